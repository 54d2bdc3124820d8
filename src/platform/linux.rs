use anyhow::{Context, Result};
use std::path::Path;
use std::process::{Command, Output};
use tracing::{debug, info, warn};

use super::{GroupAction, KeysFileOptions, Platform};
use crate::platform::common;
use crate::policy::{LoginUser, validate_username};

/// Shell given to accounts created for managed users
const LOGIN_SHELL: &str = "/bin/bash";

/// `getent` exit status for "key not found in database"
const GETENT_NOT_FOUND: i32 = 2;

/// Managed login on Linux, driven through the shadow-utils command line tools
pub struct LinuxPlatform {
    management_user: String,
}

/// Fields of a passwd database entry we care about
#[derive(Debug, Clone, PartialEq, Eq)]
struct PasswdEntry {
    name: String,
    uid: u32,
    gid: u32,
    home: String,
}

impl LinuxPlatform {
    pub fn new(management_user: impl Into<String>) -> Self {
        Self {
            management_user: management_user.into(),
        }
    }

    /// Look up a passwd entry by name or numeric uid
    fn passwd_entry(&self, key: &str) -> Result<Option<PasswdEntry>> {
        ensure_account_name(key)?;
        let output = run_command("getent", &["passwd", "--", key])?;

        match output.status.code() {
            Some(0) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let line = stdout.lines().next().unwrap_or_default();
                parse_passwd_line(line)
                    .map(Some)
                    .with_context(|| format!("Malformed passwd entry for {}: {:?}", key, line))
            }
            Some(GETENT_NOT_FOUND) => Ok(None),
            _ => anyhow::bail!(
                "getent passwd {} failed: {}",
                key,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        }
    }

    fn groups_of(&self, username: &str) -> Result<Vec<String>> {
        let output = run_checked("id", &["-nG", "--", username])?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .split_whitespace()
            .map(String::from)
            .collect())
    }

    fn chown_to(&self, path: &Path, owner: &PasswdEntry) -> Result<()> {
        std::os::unix::fs::chown(path, Some(owner.uid), Some(owner.gid)).with_context(|| {
            format!("Failed to change owner of {} to {}", path.display(), owner.name)
        })
    }
}

impl Platform for LinuxPlatform {
    fn supported_by_platform(&self) -> bool {
        match self.user_exists(&self.management_user) {
            Ok(exists) => exists,
            Err(e) => {
                warn!(
                    "Could not look up management account {}: {:#}",
                    self.management_user, e
                );
                false
            }
        }
    }

    fn user_exists(&self, name: &str) -> Result<bool> {
        Ok(self.passwd_entry(name)?.is_some())
    }

    fn uid_exists(&self, uid: u32) -> Result<bool> {
        Ok(self.passwd_entry(&uid.to_string())?.is_some())
    }

    fn add_user(&self, user: &LoginUser) -> Result<()> {
        ensure_account_name(&user.username)?;
        if self.user_exists(&user.username)? {
            return Ok(());
        }

        let uid = match user.preferred_uid() {
            Some(uid) if !self.uid_exists(uid)? => Some(uid.to_string()),
            Some(uid) => {
                warn!(
                    "uid {} for {} is already taken, letting the system pick one",
                    uid, user.username
                );
                None
            }
            None => None,
        };

        let mut args = vec![
            "--create-home",
            "--shell",
            LOGIN_SHELL,
            "--comment",
            user.common_name.as_str(),
        ];
        if let Some(uid) = uid.as_deref() {
            args.push("--uid");
            args.push(uid);
        }
        args.push("--");
        args.push(user.username.as_str());

        run_checked("useradd", &args)
            .with_context(|| format!("Failed to create account {}", user.username))?;

        info!("Created account {} for {}", user.username, user.common_name);
        Ok(())
    }

    fn manage_group(&self, group: &str, action: GroupAction, username: &str) -> Result<()> {
        ensure_account_name(group)?;
        ensure_account_name(username)?;
        let is_member = self.groups_of(username)?.iter().any(|g| g == group);

        match (action, is_member) {
            (GroupAction::Add, false) => {
                run_checked("usermod", &["-a", "-G", group, "--", username])
                    .with_context(|| format!("Failed to add {} to group {}", username, group))?;
                info!("Added {} to group {}", username, group);
            }
            (GroupAction::Remove, true) => {
                run_checked("gpasswd", &["-d", username, "--", group])
                    .with_context(|| format!("Failed to remove {} from group {}", username, group))?;
                info!("Removed {} from group {}", username, group);
            }
            _ => debug!("{} already in requested state for group {} ({})", username, group, action),
        }

        Ok(())
    }

    fn read_keys_file(&self, path: &Path) -> Result<Vec<String>> {
        if !path.exists() {
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read keys file: {}", path.display()))?;

        Ok(content.lines().map(String::from).collect())
    }

    fn write_keys_file(&self, lines: &[String], path: &Path, options: &KeysFileOptions) -> Result<()> {
        let mut content = lines.join("\n");
        if !content.is_empty() {
            content.push('\n');
        }

        common::atomic_write(path, content.as_bytes(), options.mode)
            .with_context(|| format!("Failed to write keys file: {}", path.display()))?;

        if let Some(owner) = &options.owner {
            let entry = self
                .passwd_entry(owner)?
                .with_context(|| format!("Keys file owner {} does not exist", owner))?;

            if let Some(dir) = path.parent() {
                self.chown_to(dir, &entry)?;
            }
            self.chown_to(path, &entry)?;
            debug!("Keys file owned by {} (home {})", entry.name, entry.home);
        }

        Ok(())
    }
}

/// Refuse names the shadow-utils tools could read as options
fn ensure_account_name(name: &str) -> Result<()> {
    validate_username(name).map_err(anyhow::Error::msg)
}

fn parse_passwd_line(line: &str) -> Option<PasswdEntry> {
    let fields: Vec<&str> = line.split(':').collect();
    if fields.len() < 7 {
        return None;
    }

    Some(PasswdEntry {
        name: fields[0].to_string(),
        uid: fields[2].parse().ok()?,
        gid: fields[3].parse().ok()?,
        home: fields[5].to_string(),
    })
}

fn run_command(cmd: &str, args: &[&str]) -> Result<Output> {
    Command::new(cmd)
        .args(args)
        .output()
        .with_context(|| format!("Failed to execute {}", cmd))
}

/// Run a command, failing unless it exits successfully
fn run_checked(cmd: &str, args: &[&str]) -> Result<Output> {
    let output = run_command(cmd, args)?;

    if output.status.success() {
        Ok(output)
    } else {
        anyhow::bail!(
            "Command failed: {} {:?}: {}",
            cmd,
            args,
            String::from_utf8_lossy(&output.stderr).trim()
        )
    }
}
