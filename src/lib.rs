//! Managed login agent
//!
//! Converges local accounts, privileged-group membership and the
//! authorized-keys file of a managed host to a centrally pushed login policy.

pub mod agent;
pub mod config;
pub mod error;
pub mod login;
pub mod platform;
pub mod policy;
pub mod service;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{KeyServerError, LoginError};
pub use policy::{KeySlot, LoginPolicy, LoginUser};
pub use service::{AuditEntry, LoginService, OperationResult};
