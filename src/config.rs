use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::policy::validate_username;

/// Agent configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentConfig {
    pub agent: AgentSettings,
    pub key_server: KeyServerConfig,
    #[serde(default)]
    pub login: LoginSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Agent settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentSettings {
    /// Identity this agent presents to the key server
    pub identity: String,

    /// Policy document the daemon watches
    #[serde(default = "default_policy_file")]
    pub policy_file: PathBuf,

    /// How often to check the policy file for changes (seconds)
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,

    /// Add random jitter to each poll (seconds)
    #[serde(default = "default_jitter")]
    pub poll_jitter: u64,
}

/// Remote key-lookup service
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KeyServerConfig {
    /// Base URL; the lookup endpoint is appended to it
    pub url: String,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

/// How login state is laid out on this host
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LoginSettings {
    /// Account whose presence marks the host as managed
    #[serde(default = "default_management_user")]
    pub management_user: String,

    /// Group mirrored from each user's superuser bit
    #[serde(default = "default_privileged_group")]
    pub privileged_group: String,

    #[serde(default = "default_keys_file")]
    pub keys_file: PathBuf,

    /// Forced-command program run for every managed login
    #[serde(default = "default_shim")]
    pub shim: String,

    /// Extra authorized_keys options appended after the forced command
    #[serde(default)]
    pub ssh_options: Vec<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_policy_file() -> PathBuf {
    PathBuf::from("/var/lib/managed-login/policy.json")
}

fn default_poll_interval() -> u64 {
    300 // 5 minutes
}

fn default_jitter() -> u64 {
    30
}

fn default_timeout() -> u64 {
    30
}

fn default_management_user() -> String {
    "rightscale".to_string()
}

fn default_privileged_group() -> String {
    "rightscale".to_string()
}

fn default_keys_file() -> PathBuf {
    PathBuf::from("/home/rightscale/.ssh/authorized_keys")
}

fn default_shim() -> String {
    "rs_thunk".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoginSettings {
    fn default() -> Self {
        Self {
            management_user: default_management_user(),
            privileged_group: default_privileged_group(),
            keys_file: default_keys_file(),
            shim: default_shim(),
            ssh_options: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl AgentConfig {
    /// Configuration with defaults for everything but the identity and key server
    pub fn new(identity: impl Into<String>, key_server_url: impl Into<String>) -> Self {
        Self {
            agent: AgentSettings {
                identity: identity.into(),
                policy_file: default_policy_file(),
                poll_interval: default_poll_interval(),
                poll_jitter: default_jitter(),
            },
            key_server: KeyServerConfig {
                url: key_server_url.into(),
                timeout_secs: default_timeout(),
                access_token: None,
            },
            login: LoginSettings::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: AgentConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let toml = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, toml)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        // The key server token lives here
        crate::platform::common::set_file_permissions(path, 0o600)?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.agent.identity.trim().is_empty() {
            anyhow::bail!("Agent identity must not be empty");
        }

        validate_key_server_url(&self.key_server.url)?;

        if self.key_server.timeout_secs == 0 {
            anyhow::bail!("Key server timeout must be at least 1 second");
        }

        if self.agent.poll_interval < 10 {
            anyhow::bail!(
                "Poll interval must be at least 10 seconds (got: {})",
                self.agent.poll_interval
            );
        }

        self.login.validate()
    }
}

impl LoginSettings {
    pub fn validate(&self) -> Result<()> {
        validate_username(&self.management_user)
            .map_err(anyhow::Error::msg)
            .context("Invalid management user")?;

        validate_username(&self.privileged_group)
            .map_err(anyhow::Error::msg)
            .context("Invalid privileged group")?;

        if !self.keys_file.is_absolute() {
            anyhow::bail!(
                "Keys file must be an absolute path (got: {})",
                self.keys_file.display()
            );
        }

        if self.shim.is_empty() || self.shim.contains('"') {
            anyhow::bail!("Login shim must be a non-empty command without double quotes");
        }

        for option in &self.ssh_options {
            if option.is_empty() || (option.contains(char::is_whitespace) && !option.contains('"')) {
                anyhow::bail!("Invalid authorized_keys option: {:?}", option);
            }
        }

        Ok(())
    }
}

/// Key server URLs must use HTTPS unless they point at the local host
pub fn validate_key_server_url(raw: &str) -> Result<url::Url> {
    let url = url::Url::parse(raw).context("Invalid key server URL")?;

    let loopback = matches!(url.host_str(), Some("localhost") | Some("127.0.0.1") | Some("[::1]"));

    match url.scheme() {
        "https" => Ok(url),
        "http" if loopback => Ok(url),
        scheme => anyhow::bail!("Key server URL must use HTTPS (got: {})", scheme),
    }
}

/// Get the agent config file path
pub fn get_agent_config_path() -> PathBuf {
    PathBuf::from("/etc/managed-login/agent.conf")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AgentConfig {
        AgentConfig::new("rs-instance-1-1", "https://keys.example.com")
    }

    #[test]
    fn agent_config_accepts_defaults() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn agent_config_validates_https() {
        let mut config = valid_config();
        config.key_server.url = "http://keys.example.com".to_string();
        assert!(config.validate().is_err());

        config.key_server.url = "http://127.0.0.1:8080".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn agent_config_requires_identity() {
        let mut config = valid_config();
        config.agent.identity = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn agent_config_validates_poll_interval() {
        let mut config = valid_config();
        config.agent.poll_interval = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn login_settings_reject_relative_keys_file() {
        let settings = LoginSettings {
            keys_file: PathBuf::from("authorized_keys"),
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn login_settings_reject_quoted_shim() {
        let settings = LoginSettings {
            shim: "rs_thunk\"; rm -rf /".to_string(),
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn login_settings_reject_option_like_account_names() {
        let settings = LoginSettings {
            management_user: "-oops".to_string(),
            ..Default::default()
        };
        let err = settings.validate().unwrap_err();
        assert!(format!("{:#}", err).contains("Invalid management user"));

        let settings = LoginSettings {
            privileged_group: String::new(),
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn agent_config_parses_minimal_toml() {
        let toml = r#"
[agent]
identity = "rs-instance-1-1"

[key_server]
url = "https://keys.example.com"
"#;
        let config: AgentConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.agent.poll_interval, 300);
        assert_eq!(config.login, LoginSettings::default());
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.login.shim, "rs_thunk");
    }

    #[test]
    fn agent_config_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("etc").join("agent.conf");

        let mut config = valid_config();
        config.login.ssh_options = vec!["no-agent-forwarding".to_string()];
        config.save(&path).unwrap();

        let loaded = AgentConfig::load(&path).unwrap();
        assert_eq!(loaded.agent.identity, "rs-instance-1-1");
        assert_eq!(loaded.login.ssh_options, vec!["no-agent-forwarding".to_string()]);
    }
}
