//! Public key resolution
//!
//! Pushed policies may carry only a fingerprint for a key. Fingerprints are
//! resolved first against the keys of the previously applied policy (any
//! user's key, the cache is keyed by fingerprint alone), then with a single
//! batched request to the key server.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::error::KeyServerError;
use crate::policy::{KeySlot, LoginPolicy, LoginUser, contains_control};

/// Remote key-lookup service
#[async_trait]
pub trait KeyServer: Send + Sync {
    /// Look up key material for `fingerprints`
    ///
    /// The returned map may hold only a subset of the requested fingerprints.
    async fn retrieve_public_keys(
        &self,
        identity: &str,
        fingerprints: &[String],
    ) -> Result<HashMap<String, String>, KeyServerError>;
}

/// Outcome of resolving the users of a policy
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedUsers {
    /// One entry per input user, `None` where no key could be resolved
    pub users: Vec<Option<LoginUser>>,
    /// Users with at least one unresolved key, in input order
    pub missing: Vec<LoginUser>,
    /// Every input user with the slots resolved by this pass filled in and
    /// the rest still pending; the cache source for the next pass
    pub filled: Vec<LoginUser>,
}

pub struct KeyResolver {
    key_server: Arc<dyn KeyServer>,
}

impl KeyResolver {
    pub fn new(key_server: Arc<dyn KeyServer>) -> Self {
        Self { key_server }
    }

    /// Resolve every key slot of `new_users`
    ///
    /// `current` is the last applied policy and the only source of cached
    /// keys. Unresolvable slots are dropped; a user left without keys is
    /// replaced by `None` and reported as missing, as is a user who kept
    /// only some of their keys.
    pub async fn update_users(
        &self,
        current: Option<&LoginPolicy>,
        new_users: &[LoginUser],
        identity: &str,
    ) -> ResolvedUsers {
        let mut cache: HashMap<String, String> = current
            .map(|policy| {
                policy
                    .resolved_keys()
                    .map(|(fp, key)| (fp.to_string(), key.to_string()))
                    .collect()
            })
            .unwrap_or_default();

        let pending = pending_fingerprints(new_users, &cache);
        let mut fetch_error = None;

        if !pending.is_empty() {
            debug!("Retrieving {} public keys from key server", pending.len());

            match self.key_server.retrieve_public_keys(identity, &pending).await {
                Ok(found) => {
                    let requested: HashSet<&String> = pending.iter().collect();
                    for (fp, key) in found {
                        if !requested.contains(&fp) {
                            continue;
                        }
                        if contains_control(key.trim()) {
                            warn!("Key server returned a multi-line public key for fingerprint {}", fp);
                            continue;
                        }
                        cache.insert(fp, key);
                    }
                }
                Err(e) => fetch_error = Some(e),
            }
        }

        let mut resolved = ResolvedUsers::default();
        // Unresolved fingerprint -> usernames, in first-seen order
        let mut unresolved: Vec<(String, Vec<String>)> = Vec::new();

        for user in new_users {
            let mut keys = Vec::with_capacity(user.keys.len());
            let mut slots = Vec::with_capacity(user.keys.len());
            let mut complete = true;

            for slot in &user.keys {
                let filled = match slot {
                    KeySlot::Resolved { .. } => Some(slot.clone()),
                    KeySlot::Pending { fingerprint } => cache.get(fingerprint).map(|key| KeySlot::Resolved {
                        fingerprint: fingerprint.clone(),
                        key: key.clone(),
                    }),
                };

                match filled {
                    Some(filled) => {
                        keys.push(filled.clone());
                        slots.push(filled);
                    }
                    None => {
                        complete = false;
                        record_unresolved(&mut unresolved, slot.fingerprint(), &user.username);
                        slots.push(slot.clone());
                    }
                }
            }

            resolved.filled.push(LoginUser {
                keys: slots,
                ..user.clone()
            });

            if keys.is_empty() {
                resolved.users.push(None);
                resolved.missing.push(user.clone());
                continue;
            }

            if !complete {
                resolved.missing.push(user.clone());
            }

            resolved.users.push(Some(LoginUser {
                keys,
                ..user.clone()
            }));
        }

        if !unresolved.is_empty() {
            let mut usernames: Vec<&str> = Vec::new();
            for (_, names) in &unresolved {
                for name in names {
                    if !usernames.contains(&name.as_str()) {
                        usernames.push(name);
                    }
                }
            }

            let reason = match &fetch_error {
                Some(e) => e.to_string(),
                None => "not known to the key server".to_string(),
            };
            error!(
                "Failed to retrieve public keys for users {} ({})",
                usernames.join(", "),
                reason
            );

            for (fp, names) in &unresolved {
                error!(
                    "Failed to obtain public key with fingerprint {} for user(s) {}",
                    fp,
                    names.join(", ")
                );
            }
        }

        resolved
    }
}

/// Fingerprints that neither the slot nor the cache can satisfy, de-duplicated in first-seen order
fn pending_fingerprints(users: &[LoginUser], cache: &HashMap<String, String>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut pending = Vec::new();

    for user in users {
        for slot in &user.keys {
            if let KeySlot::Pending { fingerprint } = slot {
                if !cache.contains_key(fingerprint) && seen.insert(fingerprint.as_str()) {
                    pending.push(fingerprint.clone());
                }
            }
        }
    }

    pending
}

fn record_unresolved(unresolved: &mut Vec<(String, Vec<String>)>, fingerprint: &str, username: &str) {
    match unresolved.iter_mut().find(|(fp, _)| fp == fingerprint) {
        Some((_, names)) => {
            if !names.iter().any(|n| n == username) {
                names.push(username.to_string());
            }
        }
        None => unresolved.push((fingerprint.to_string(), vec![username.to_string()])),
    }
}
