//! Reconciliation of local login state against a pushed policy

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::audit::describe_policy;
use super::expiry::{Clock, EXPIRY_RETRY_DELAY, ExpiryScheduler, system_clock};
use super::prefix::CommandPrefixBuilder;
use super::resolver::{KeyResolver, KeyServer};
use crate::config::LoginSettings;
use crate::error::LoginError;
use crate::platform::{GroupAction, KeysFileOptions, Platform};
use crate::policy::{LoginPolicy, LoginUser};

/// Audit text reported when the host cannot run managed login
pub const UNSUPPORTED_TEXT: &str = "Managed login is not supported on this platform.\n";

/// Outcome of one reconciliation cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    Applied { audit: String },
    /// Nothing was touched because the host is not managed
    Unsupported,
}

impl Reconciliation {
    pub fn audit_text(&self) -> &str {
        match self {
            Reconciliation::Applied { audit } => audit,
            Reconciliation::Unsupported => UNSUPPORTED_TEXT,
        }
    }
}

/// Owns the current applied policy and converges the host to new ones
pub struct LoginManager {
    platform: Arc<dyn Platform>,
    resolver: KeyResolver,
    expiry: ExpiryScheduler,
    prefixes: CommandPrefixBuilder,
    settings: LoginSettings,
    clock: Clock,
    /// Last applied policy with the keys resolved for it filled in
    current: Option<Arc<LoginPolicy>>,
}

impl LoginManager {
    pub fn new(
        platform: Arc<dyn Platform>,
        key_server: Arc<dyn KeyServer>,
        expiry: ExpiryScheduler,
        settings: LoginSettings,
    ) -> Self {
        Self {
            platform,
            resolver: KeyResolver::new(key_server),
            expiry,
            prefixes: CommandPrefixBuilder::from_settings(&settings),
            settings,
            clock: system_clock(),
            current: None,
        }
    }

    /// Decide user expiry against `clock` instead of the system time
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn current_policy(&self) -> Option<&Arc<LoginPolicy>> {
        self.current.as_ref()
    }

    /// Whether `policy` is the very snapshot applied last
    pub fn is_current(&self, policy: &Arc<LoginPolicy>) -> bool {
        self.current
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, policy))
    }

    pub fn supported_by_platform(&self) -> bool {
        self.platform.supported_by_platform()
    }

    /// Drop any armed expiry timer
    pub fn cancel_expiry(&self) {
        self.expiry.cancel();
    }

    /// Re-run `policy` shortly, after a cycle started by its timer failed
    pub fn retry_expiry(&self, policy: &Arc<LoginPolicy>, identity: &str) {
        self.expiry.schedule_retry(policy, identity, EXPIRY_RETRY_DELAY);
    }

    /// Run one reconciliation cycle
    ///
    /// On error the steps after the failing OS edit are skipped, the cached
    /// policy is left as it was and no timer is re-armed.
    ///
    /// The cached policy holds the keys resolved here, so later cycles find
    /// them without asking the key server again.
    pub async fn update_policy(
        &mut self,
        policy: Arc<LoginPolicy>,
        identity: &str,
    ) -> Result<Reconciliation, LoginError> {
        if !self.platform.supported_by_platform() {
            info!(
                "Skipping login policy {}: managed login is not supported on this host",
                policy.audit_id
            );
            return Ok(Reconciliation::Unsupported);
        }

        info!(
            "Applying login policy {} ({} users)",
            policy.audit_id,
            policy.users.len()
        );

        let resolved = self
            .resolver
            .update_users(self.current.as_deref(), &policy.users, identity)
            .await;

        let now = (self.clock)();
        let authorized: Vec<LoginUser> = resolved
            .users
            .into_iter()
            .flatten()
            .filter(|user| {
                let active = user.is_active_at(now);
                if !active {
                    debug!("{} expired, not authorizing", user.username);
                }
                active
            })
            .collect();

        self.converge_accounts(&authorized)?;
        self.write_keys(&authorized)?;

        let applied = Arc::new(LoginPolicy::new(policy.audit_id, policy.created_at, resolved.filled));
        // Expiry firings are matched against `current` by pointer
        self.expiry.schedule_expiry_at(&applied, identity, now);
        self.current = Some(applied);

        let superusers: Vec<LoginUser> = authorized.iter().filter(|u| u.superuser).cloned().collect();
        let audit = describe_policy(&authorized, &superusers, &resolved.missing);

        info!(
            "Login policy {} applied: {} authorized, {} missing keys",
            policy.audit_id,
            authorized.len(),
            resolved.missing.len()
        );

        Ok(Reconciliation::Applied { audit })
    }

    /// Create missing accounts and mirror the superuser bit into the privileged group
    fn converge_accounts(&self, authorized: &[LoginUser]) -> Result<(), LoginError> {
        let group = &self.settings.privileged_group;

        for user in authorized {
            if !self.platform.user_exists(&user.username).map_err(LoginError::OsMutation)? {
                self.platform.add_user(user).map_err(LoginError::OsMutation)?;
            }

            let action = if user.superuser {
                GroupAction::Add
            } else {
                GroupAction::Remove
            };

            debug!("Group {} for {}: {}", group, user.username, action);
            self.platform
                .manage_group(group, action, &user.username)
                .map_err(LoginError::OsMutation)?;
        }

        Ok(())
    }

    fn write_keys(&self, authorized: &[LoginUser]) -> Result<(), LoginError> {
        let path = &self.settings.keys_file;
        let lines = self.prefixes.authorized_keys_lines(authorized);

        match self.platform.read_keys_file(path) {
            Ok(existing) if existing == lines => {
                debug!("{} already up to date", path.display());
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => warn!("Could not read {}, rewriting it: {:#}", path.display(), e),
        }

        let options = KeysFileOptions {
            owner: Some(self.settings.management_user.clone()),
            ..Default::default()
        };

        self.platform
            .write_keys_file(&lines, path, &options)
            .map_err(LoginError::OsMutation)?;

        info!("Wrote {} authorized keys to {}", lines.len(), path.display());
        Ok(())
    }
}
