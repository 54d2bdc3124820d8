use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::Path;

use crate::error::LoginError;

/// Offset between a numeric account uuid and the local uid it maps to
pub const UID_OFFSET: u64 = 4096;

/// Longest account name accepted from a policy
pub const MAX_USERNAME_LEN: usize = 32;

/// One public key slot of a login user
///
/// Every slot carries the fingerprint of its key material. A pending slot
/// still has to be resolved, either from the previously applied policy or
/// from the key server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySlot {
    Resolved { fingerprint: String, key: String },
    Pending { fingerprint: String },
}

impl KeySlot {
    /// Build a resolved slot, computing the fingerprint from the key material
    pub fn resolved(key: impl Into<String>) -> Self {
        let key = key.into();
        KeySlot::Resolved {
            fingerprint: fingerprint(&key),
            key,
        }
    }

    pub fn pending(fingerprint: impl Into<String>) -> Self {
        KeySlot::Pending {
            fingerprint: fingerprint.into(),
        }
    }

    pub fn fingerprint(&self) -> &str {
        match self {
            KeySlot::Resolved { fingerprint, .. } | KeySlot::Pending { fingerprint } => fingerprint,
        }
    }

    pub fn key(&self) -> Option<&str> {
        match self {
            KeySlot::Resolved { key, .. } => Some(key),
            KeySlot::Pending { .. } => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, KeySlot::Resolved { .. })
    }
}

/// A user authorized by the login policy
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "WireLoginUser")]
pub struct LoginUser {
    /// Stable remote identity
    pub uuid: String,
    /// Local account name
    pub username: String,
    /// Audit label, usually an email address
    pub common_name: String,
    pub superuser: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub keys: Vec<KeySlot>,
    /// Opaque per-user profile (e.g. a tarball URL) handed to the login shim
    pub profile_data: Option<String>,
}

impl LoginUser {
    pub fn new(
        uuid: impl Into<String>,
        username: impl Into<String>,
        common_name: impl Into<String>,
        superuser: bool,
        expires_at: Option<DateTime<Utc>>,
        keys: Vec<KeySlot>,
    ) -> Self {
        Self {
            uuid: uuid.into(),
            username: username.into(),
            common_name: common_name.into(),
            superuser,
            expires_at,
            keys,
            profile_data: None,
        }
    }

    pub fn with_profile(mut self, profile_data: impl Into<String>) -> Self {
        self.profile_data = Some(profile_data.into());
        self
    }

    /// Resolved key material, in slot order
    pub fn public_keys(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().filter_map(KeySlot::key)
    }

    pub fn fingerprints(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(KeySlot::fingerprint)
    }

    pub fn has_resolved_keys(&self) -> bool {
        self.keys.iter().any(KeySlot::is_resolved)
    }

    pub fn is_fully_resolved(&self) -> bool {
        self.keys.iter().all(KeySlot::is_resolved)
    }

    /// Whether the user is still authorized at `now`
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at > now).unwrap_or(true)
    }

    /// Non-empty profile data, if any
    pub fn profile(&self) -> Option<&str> {
        self.profile_data.as_deref().filter(|p| !p.is_empty())
    }

    /// Local uid derived from a numeric uuid
    pub fn preferred_uid(&self) -> Option<u32> {
        let uuid: u64 = self.uuid.parse().ok()?;
        u32::try_from(uuid.checked_add(UID_OFFSET)?).ok()
    }
}

/// An authoritative snapshot of who may log in
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoginPolicy {
    pub audit_id: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub users: Vec<LoginUser>,
}

impl LoginPolicy {
    pub fn new(audit_id: u64, created_at: DateTime<Utc>, users: Vec<LoginUser>) -> Self {
        Self {
            audit_id,
            created_at,
            users,
        }
    }

    /// Every resolved key in the policy as `(fingerprint, key)` pairs
    pub fn resolved_keys(&self) -> impl Iterator<Item = (&str, &str)> {
        self.users.iter().flat_map(|user| {
            user.keys.iter().filter_map(|slot| match slot {
                KeySlot::Resolved { fingerprint, key } => Some((fingerprint.as_str(), key.as_str())),
                KeySlot::Pending { .. } => None,
            })
        })
    }

    pub fn from_json_str(content: &str) -> Result<Self, LoginError> {
        serde_json::from_str(content).map_err(|e| LoginError::InvalidPolicy(e.to_string()))
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, LoginError> {
        serde_yaml::from_str(content).map_err(|e| LoginError::InvalidPolicy(e.to_string()))
    }

    /// Parse policy content read from `path`
    ///
    /// `.yaml`/`.yml` files are parsed as YAML, anything else as JSON.
    pub fn parse_for_path(path: &Path, content: &str) -> Result<Self, LoginError> {
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );

        if is_yaml {
            Self::from_yaml_str(content)
        } else {
            Self::from_json_str(content)
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read policy file: {}", path.display()))?;

        Self::parse_for_path(path, &content)
            .with_context(|| format!("Failed to parse policy file: {}", path.display()))
    }
}

/// Content hash of an SSH public key
///
/// Only the key type and base64 body take part, so the comment can change
/// without changing the fingerprint.
pub fn fingerprint(public_key: &str) -> String {
    let mut fields = public_key.split_whitespace();
    let mut hasher = Sha256::new();

    match (fields.next(), fields.next()) {
        (Some(kind), Some(body)) => {
            hasher.update(kind.as_bytes());
            hasher.update(b" ");
            hasher.update(body.as_bytes());
        }
        _ => hasher.update(public_key.trim().as_bytes()),
    }

    format!("sha256:{}", hex::encode(&hasher.finalize()))
}

/// Check that `name` is usable as a local account name
///
/// Only ASCII letters, digits, `.`, `_` and `-` are accepted, and a leading
/// `-` is refused so the name can never be taken for a command option.
pub fn validate_username(name: &str) -> Result<(), String> {
    if name.is_empty() || name.len() > MAX_USERNAME_LEN {
        return Err(format!(
            "username '{}' must be 1 to {} characters long",
            name, MAX_USERNAME_LEN
        ));
    }

    if name.starts_with('-') {
        return Err(format!("username '{}' must not start with '-'", name));
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(format!("username '{}' contains invalid characters", name));
    }

    Ok(())
}

/// Whether `value` holds line breaks or other control characters
pub fn contains_control(value: &str) -> bool {
    value.chars().any(char::is_control)
}

mod hex {
    pub fn encode(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireUuid {
    Text(String),
    Number(u64),
}

/// Login user as pushed by the orchestrator
#[derive(Debug, Deserialize)]
struct WireLoginUser {
    uuid: WireUuid,
    username: String,
    common_name: String,
    #[serde(default)]
    superuser: bool,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    public_keys: Vec<Option<String>>,
    #[serde(default)]
    public_key_fingerprints: Option<Vec<String>>,
    #[serde(default)]
    profile_data: Option<String>,
}

impl TryFrom<WireLoginUser> for LoginUser {
    type Error = String;

    fn try_from(wire: WireLoginUser) -> Result<Self, Self::Error> {
        let fingerprints = wire.public_key_fingerprints.unwrap_or_default();

        if !fingerprints.is_empty() && fingerprints.len() != wire.public_keys.len() {
            return Err(format!(
                "user '{}' has {} public keys but {} fingerprints",
                wire.username,
                wire.public_keys.len(),
                fingerprints.len()
            ));
        }

        validate_username(&wire.username)?;

        let uuid = match wire.uuid {
            WireUuid::Text(uuid) => uuid,
            WireUuid::Number(uuid) => uuid.to_string(),
        };

        let texts = [
            ("uuid", Some(&uuid)),
            ("common_name", Some(&wire.common_name)),
            ("profile_data", wire.profile_data.as_ref()),
        ];
        for (field, value) in texts {
            if value.is_some_and(|v| contains_control(v)) {
                return Err(format!(
                    "user '{}' has control characters in {}",
                    wire.username, field
                ));
            }
        }

        let slots = wire.public_keys.iter().flatten().chain(fingerprints.iter());
        for value in slots {
            if contains_control(value) {
                return Err(format!(
                    "user '{}' has a public key or fingerprint spanning several lines",
                    wire.username
                ));
            }
        }

        let mut keys = Vec::with_capacity(wire.public_keys.len());
        for (i, key) in wire.public_keys.into_iter().enumerate() {
            let given = fingerprints.get(i).filter(|f| !f.is_empty()).cloned();
            let slot = match (key.filter(|k| !k.trim().is_empty()), given) {
                (Some(key), Some(fingerprint)) => KeySlot::Resolved { fingerprint, key },
                (Some(key), None) => KeySlot::resolved(key),
                (None, Some(fingerprint)) => KeySlot::Pending { fingerprint },
                (None, None) => {
                    return Err(format!(
                        "user '{}' has an empty public key slot {} without a fingerprint",
                        wire.username, i
                    ));
                }
            };
            keys.push(slot);
        }

        Ok(LoginUser {
            uuid,
            username: wire.username,
            common_name: wire.common_name,
            superuser: wire.superuser,
            expires_at: wire.expires_at,
            keys,
            profile_data: wire.profile_data,
        })
    }
}
