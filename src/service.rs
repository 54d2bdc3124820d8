//! Single entry point for policy pushes and expiry firings
//!
//! Both sources are funnelled through one task that owns the
//! [`LoginManager`], so exactly one reconciliation cycle runs at a time and
//! no locking is needed around the applied policy.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::config::LoginSettings;
use crate::login::{Clock, ExpiryHook, ExpiryScheduler, KeyServer, LoginManager, OneShotTimer, system_clock};
use crate::platform::Platform;
use crate::policy::LoginPolicy;

pub const AUDIT_CATEGORY: &str = "security";
pub const UPDATED_TITLE: &str = "Managed login policy updated";
pub const FAILED_TITLE: &str = "Failed to update managed login policy";

/// Audit record produced for every policy application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    pub title: String,
    pub category: String,
    pub body: String,
}

impl AuditEntry {
    fn updated(body: &str) -> Self {
        Self {
            title: UPDATED_TITLE.to_string(),
            category: AUDIT_CATEGORY.to_string(),
            body: body.to_string(),
        }
    }

    fn failed(message: &str) -> Self {
        Self {
            title: FAILED_TITLE.to_string(),
            category: AUDIT_CATEGORY.to_string(),
            body: format!("Error applying login policy: {}", message),
        }
    }
}

/// Result handed back to whoever pushed the policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationResult {
    Success { audit: AuditEntry },
    Error { message: String, audit: AuditEntry },
}

impl OperationResult {
    pub fn is_success(&self) -> bool {
        matches!(self, OperationResult::Success { .. })
    }

    pub fn audit(&self) -> &AuditEntry {
        match self {
            OperationResult::Success { audit } | OperationResult::Error { audit, .. } => audit,
        }
    }

    fn failure(message: String) -> Self {
        OperationResult::Error {
            audit: AuditEntry::failed(&message),
            message,
        }
    }
}

enum Command {
    UpdatePolicy {
        policy: Arc<LoginPolicy>,
        reply: oneshot::Sender<OperationResult>,
    },
    Expired {
        policy: Arc<LoginPolicy>,
        identity: String,
    },
}

/// Handle to the reconciliation task
#[derive(Clone)]
pub struct LoginService {
    commands: mpsc::UnboundedSender<Command>,
}

impl LoginService {
    /// Start the reconciliation task on the current tokio runtime
    ///
    /// The task stops once every handle has been dropped.
    pub fn spawn(
        platform: Arc<dyn Platform>,
        key_server: Arc<dyn KeyServer>,
        timer: Arc<dyn OneShotTimer>,
        settings: LoginSettings,
        identity: impl Into<String>,
    ) -> Self {
        Self::spawn_with_clock(platform, key_server, timer, settings, identity, system_clock())
    }

    /// Like [`LoginService::spawn`], judging user expiry by `clock`
    pub fn spawn_with_clock(
        platform: Arc<dyn Platform>,
        key_server: Arc<dyn KeyServer>,
        timer: Arc<dyn OneShotTimer>,
        settings: LoginSettings,
        identity: impl Into<String>,
        clock: Clock,
    ) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();

        // Weak so that armed timers do not keep the task alive
        let weak = commands.downgrade();
        let on_expiry: ExpiryHook = Arc::new(move |policy: Arc<LoginPolicy>, identity: String| {
            if let Some(commands) = weak.upgrade() {
                let _ = commands.send(Command::Expired { policy, identity });
            }
        });

        let manager = LoginManager::new(
            platform,
            key_server,
            ExpiryScheduler::new(timer, on_expiry),
            settings,
        )
        .with_clock(clock);

        tokio::spawn(run(manager, identity.into(), receiver));

        Self { commands }
    }

    /// Apply `policy` and wait for the outcome
    pub async fn update_login_policy(&self, policy: LoginPolicy) -> OperationResult {
        let (reply, outcome) = oneshot::channel();
        let command = Command::UpdatePolicy {
            policy: Arc::new(policy),
            reply,
        };

        if self.commands.send(command).is_err() {
            return OperationResult::failure("login service is not running".to_string());
        }

        outcome.await.unwrap_or_else(|_| {
            OperationResult::failure("login service stopped before answering".to_string())
        })
    }
}

async fn run(mut manager: LoginManager, identity: String, mut receiver: mpsc::UnboundedReceiver<Command>) {
    info!("Login service started for {}", identity);

    while let Some(command) = receiver.recv().await {
        match command {
            Command::UpdatePolicy { policy, reply } => {
                let result = apply(&mut manager, policy, &identity).await;
                if reply.send(result).is_err() {
                    warn!("Caller went away before the login policy result was delivered");
                }
            }
            Command::Expired { policy, identity } => {
                if !manager.is_current(&policy) {
                    warn!(
                        "Ignoring expiry timer for superseded login policy {}",
                        policy.audit_id
                    );
                    continue;
                }

                info!("User expiry reached, re-applying login policy {}", policy.audit_id);
                let result = apply(&mut manager, Arc::clone(&policy), &identity).await;
                if !result.is_success() {
                    // Expired users stay in the keys file until a cycle succeeds
                    manager.retry_expiry(&policy, &identity);
                }
            }
        }
    }

    manager.cancel_expiry();
    info!("Login service stopped");
}

async fn apply(manager: &mut LoginManager, policy: Arc<LoginPolicy>, identity: &str) -> OperationResult {
    let audit_id = policy.audit_id;

    match manager.update_policy(policy, identity).await {
        Ok(outcome) => OperationResult::Success {
            audit: AuditEntry::updated(outcome.audit_text()),
        },
        Err(e) => {
            error!("Failed to apply login policy {}: {}", audit_id, e);
            OperationResult::failure(e.to_string())
        }
    }
}
