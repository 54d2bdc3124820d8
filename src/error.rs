use thiserror::Error;

/// Errors surfaced by a reconciliation cycle
#[derive(Debug, Error)]
pub enum LoginError {
    /// The pushed policy violates a structural invariant
    #[error("invalid login policy: {0}")]
    InvalidPolicy(String),

    /// A local account, group or keys-file edit failed; the rest of the cycle was skipped
    #[error("failed to update local login state: {0:#}")]
    OsMutation(#[source] anyhow::Error),
}

/// Errors returned by the remote key-lookup service
#[derive(Debug, Error)]
pub enum KeyServerError {
    #[error("key server request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("key server returned status {status}")]
    Status { status: u16 },

    #[error("key server response could not be decoded: {0}")]
    Decode(String),

    #[error("{0}")]
    Other(String),
}
