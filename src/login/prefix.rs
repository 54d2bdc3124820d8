//! Forced-command rendering for authorized_keys lines
//!
//! Every managed key is pinned to the login shim with
//! `command="<shim> --username U --email E --uuid ID[ --superuser][ --profile P]"`.
//! The shim derives all user context from these flags, so flag order is
//! fixed and flag presence depends only on the arguments.

use tracing::warn;

use crate::config::LoginSettings;
use crate::policy::{LoginUser, contains_control};

/// Renders authorized_keys lines for managed users
#[derive(Debug, Clone)]
pub struct CommandPrefixBuilder {
    shim: String,
    ssh_options: Vec<String>,
}

impl CommandPrefixBuilder {
    pub fn new(shim: impl Into<String>, ssh_options: Vec<String>) -> Self {
        Self {
            shim: shim.into(),
            ssh_options,
        }
    }

    pub fn from_settings(settings: &LoginSettings) -> Self {
        Self::new(settings.shim.clone(), settings.ssh_options.clone())
    }

    /// Forced-command prefix for one user
    ///
    /// `--superuser` is present iff `superuser`; `--profile` iff `profile_data`
    /// is non-empty.
    pub fn get_key_prefix(
        &self,
        username: &str,
        common_name: &str,
        uuid: &str,
        superuser: bool,
        profile_data: Option<&str>,
    ) -> String {
        let mut command = format!(
            "{} --username {} --email {} --uuid {}",
            self.shim,
            shell_quote(username),
            shell_quote(common_name),
            shell_quote(uuid)
        );

        if superuser {
            command.push_str(" --superuser");
        }

        if let Some(profile) = profile_data.filter(|p| !p.is_empty()) {
            command.push_str(" --profile ");
            command.push_str(&shell_quote(profile));
        }

        let mut prefix = format!("command=\"{}\"", escape_quoted(&command));
        for option in &self.ssh_options {
            prefix.push(',');
            prefix.push_str(option);
        }

        prefix
    }

    /// One authorized_keys line per resolved key of every user, in order
    ///
    /// A key or user field holding a line break would open an unforced
    /// second line, so such users and keys are left out.
    pub fn authorized_keys_lines<'a>(&self, users: impl IntoIterator<Item = &'a LoginUser>) -> Vec<String> {
        let mut lines = Vec::new();

        for user in users {
            let fields = [
                user.username.as_str(),
                user.common_name.as_str(),
                user.uuid.as_str(),
                user.profile().unwrap_or_default(),
            ];
            if fields.iter().any(|field| contains_control(field)) {
                warn!("Skipping keys of {:?}: user fields contain control characters", user.username);
                continue;
            }

            let prefix = self.get_key_prefix(
                &user.username,
                &user.common_name,
                &user.uuid,
                user.superuser,
                user.profile(),
            );

            for key in user.public_keys() {
                let key = key.trim();
                if contains_control(key) {
                    warn!("Skipping a public key of {} spanning several lines", user.username);
                    continue;
                }
                lines.push(format!("{} {}", prefix, key));
            }
        }

        lines
    }

    /// Lines for the users that carry their own profile
    pub fn modify_keys_to_use_individual_profiles<'a>(
        &self,
        users: impl IntoIterator<Item = &'a LoginUser>,
    ) -> Vec<String> {
        self.authorized_keys_lines(users.into_iter().filter(|user| user.profile().is_some()))
    }
}

/// Quote a value for the shell sshd runs the forced command through
fn shell_quote(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./-_".contains(c));

    if safe {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

/// Escape a value for the double-quoted `command="..."` option
///
/// sshd only unescapes `\"` inside option values; other backslashes pass through.
fn escape_quoted(value: &str) -> String {
    value.replace('"', "\\\"")
}
