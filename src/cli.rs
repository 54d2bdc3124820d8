use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Managed Login Agent
///
/// Converges local accounts, the privileged group and the management
/// account's authorized_keys file to a centrally pushed login policy.
#[derive(Parser, Debug)]
#[command(name = "managed-login")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to agent configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write an agent configuration file
    Setup {
        /// Identity presented to the key server
        #[arg(long)]
        identity: String,

        /// Base URL of the key server
        #[arg(long)]
        key_server_url: String,

        /// Bearer token for the key server
        #[arg(long)]
        token: Option<String>,

        /// Policy file the daemon watches
        #[arg(long)]
        policy_file: Option<PathBuf>,

        /// Polling interval in seconds
        #[arg(long, default_value = "300")]
        poll_interval: u64,
    },
    /// Run the agent daemon in the foreground
    Run,
    /// Apply a login policy file once
    Apply {
        /// Policy file (JSON, or YAML with a .yaml/.yml extension)
        policy_file: PathBuf,

        /// Identity to present instead of the configured one
        #[arg(long)]
        identity: Option<String>,
    },
    /// Print the forced-command prefix for a user
    Prefix {
        #[arg(long)]
        username: String,

        #[arg(long)]
        email: String,

        #[arg(long)]
        uuid: String,

        #[arg(long)]
        superuser: bool,

        #[arg(long)]
        profile: Option<String>,
    },
    /// Load and validate the configuration file
    CheckConfig,
}
