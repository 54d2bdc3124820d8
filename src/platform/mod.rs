//! OS boundary for managed login
//!
//! The reconciler only talks to the host through [`Platform`]. Every
//! mutation is expected to be idempotent and the keys-file write atomic:
//! a failed cycle is repaired by the next successful one, not rolled back.

pub mod common;

#[cfg(target_os = "linux")]
pub mod linux;

use anyhow::Result;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::config::LoginSettings;
use crate::policy::LoginUser;

pub use common::ensure_admin_privileges;

/// Group membership edit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupAction {
    Add,
    Remove,
}

impl fmt::Display for GroupAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupAction::Add => f.write_str("add"),
            GroupAction::Remove => f.write_str("remove"),
        }
    }
}

/// Ownership and mode of the authorized-keys file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeysFileOptions {
    /// Account that should own the file and its directory
    pub owner: Option<String>,
    pub mode: u32,
}

impl Default for KeysFileOptions {
    fn default() -> Self {
        Self {
            owner: None,
            mode: 0o600,
        }
    }
}

/// Host operations used by the reconciler
pub trait Platform: Send + Sync {
    /// Whether managed login can run on this host at all
    fn supported_by_platform(&self) -> bool;

    fn user_exists(&self, name: &str) -> Result<bool>;

    fn uid_exists(&self, uid: u32) -> Result<bool>;

    /// Create the local account for `user`; no-op if it already exists
    fn add_user(&self, user: &LoginUser) -> Result<()>;

    /// Add or remove `username` from `group`; no-op if already in the requested state
    fn manage_group(&self, group: &str, action: GroupAction, username: &str) -> Result<()>;

    /// Current authorized-keys lines; empty if the file does not exist
    fn read_keys_file(&self, path: &Path) -> Result<Vec<String>>;

    /// Replace the authorized-keys file with `lines` in one atomic step
    fn write_keys_file(&self, lines: &[String], path: &Path, options: &KeysFileOptions) -> Result<()>;
}

/// Platform implementation for the running host
pub fn current(settings: &LoginSettings) -> Arc<dyn Platform> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(linux::LinuxPlatform::new(settings.management_user.clone()))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = settings;
        Arc::new(UnsupportedPlatform)
    }
}

/// Stand-in for hosts managed login does not run on
#[cfg(not(target_os = "linux"))]
pub struct UnsupportedPlatform;

#[cfg(not(target_os = "linux"))]
impl Platform for UnsupportedPlatform {
    fn supported_by_platform(&self) -> bool {
        false
    }

    fn user_exists(&self, _name: &str) -> Result<bool> {
        anyhow::bail!("Unsupported operating system for managed login")
    }

    fn uid_exists(&self, _uid: u32) -> Result<bool> {
        anyhow::bail!("Unsupported operating system for managed login")
    }

    fn add_user(&self, _user: &LoginUser) -> Result<()> {
        anyhow::bail!("Unsupported operating system for managed login")
    }

    fn manage_group(&self, _group: &str, _action: GroupAction, _username: &str) -> Result<()> {
        anyhow::bail!("Unsupported operating system for managed login")
    }

    fn read_keys_file(&self, _path: &Path) -> Result<Vec<String>> {
        anyhow::bail!("Unsupported operating system for managed login")
    }

    fn write_keys_file(&self, _lines: &[String], _path: &Path, _options: &KeysFileOptions) -> Result<()> {
        anyhow::bail!("Unsupported operating system for managed login")
    }
}
