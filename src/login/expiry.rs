//! Self-triggered reconciliation at the next user expiry
//!
//! At most one timer is outstanding: every scheduling pass replaces the
//! previous one. Long horizons are covered in steps of [`MAX_TIMER_DELAY`],
//! since each firing reconciles and schedules again.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::policy::LoginPolicy;

/// Longest single wait before re-checking expirations
pub const MAX_TIMER_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Wait before re-running an expiry cycle that failed
pub const EXPIRY_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Source of the current time for expiry decisions
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

pub type ExpiryCallback = Box<dyn FnOnce() + Send + 'static>;

/// Invoked with the policy and identity when an expiry timer fires
pub type ExpiryHook = Arc<dyn Fn(Arc<LoginPolicy>, String) + Send + Sync>;

/// Cancellable one-shot timer
pub trait OneShotTimer: Send + Sync {
    /// Arm the timer, replacing any armed one
    fn arm(&self, delay: Duration, callback: ExpiryCallback);

    fn cancel(&self);
}

/// [`OneShotTimer`] backed by a tokio task
pub struct TokioTimer {
    runtime: tokio::runtime::Handle,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TokioTimer {
    pub fn new(runtime: tokio::runtime::Handle) -> Self {
        Self {
            runtime,
            task: Mutex::new(None),
        }
    }

    fn replace(&self, task: Option<JoinHandle<()>>) {
        let mut slot = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = std::mem::replace(&mut *slot, task) {
            previous.abort();
        }
    }
}

impl OneShotTimer for TokioTimer {
    fn arm(&self, delay: Duration, callback: ExpiryCallback) {
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            callback();
        });
        self.replace(Some(task));
    }

    fn cancel(&self) {
        self.replace(None);
    }
}

impl Drop for TokioTimer {
    fn drop(&mut self) {
        self.replace(None);
    }
}

/// Arms a wake-up at the earliest future expiry of a policy
pub struct ExpiryScheduler {
    timer: Arc<dyn OneShotTimer>,
    on_expiry: ExpiryHook,
}

impl ExpiryScheduler {
    pub fn new(timer: Arc<dyn OneShotTimer>, on_expiry: ExpiryHook) -> Self {
        Self { timer, on_expiry }
    }

    /// Arm the timer for the next expiry in `policy`, returning whether one was armed
    pub fn schedule_expiry(&self, policy: &Arc<LoginPolicy>, identity: &str) -> bool {
        self.schedule_expiry_at(policy, identity, Utc::now())
    }

    pub fn schedule_expiry_at(&self, policy: &Arc<LoginPolicy>, identity: &str, now: DateTime<Utc>) -> bool {
        let Some(next) = next_expiry(policy, now) else {
            // An older timer would re-apply a superseded policy
            self.timer.cancel();
            debug!("No upcoming user expirations in policy {}", policy.audit_id);
            return false;
        };

        let delay = (next - now)
            .to_std()
            .unwrap_or(Duration::ZERO)
            .min(MAX_TIMER_DELAY);

        info!(
            "Next user expiry at {}; re-checking in {} seconds",
            next.format("%Y-%m-%d %H:%M:%S %Z"),
            delay.as_secs()
        );

        self.arm(policy, identity, delay);
        true
    }

    /// Arm the timer to run `policy` again after `delay`
    pub fn schedule_retry(&self, policy: &Arc<LoginPolicy>, identity: &str, delay: Duration) {
        warn!(
            "Retrying login policy {} in {} seconds",
            policy.audit_id,
            delay.as_secs()
        );
        self.arm(policy, identity, delay);
    }

    fn arm(&self, policy: &Arc<LoginPolicy>, identity: &str, delay: Duration) {
        let hook = Arc::clone(&self.on_expiry);
        let policy = Arc::clone(policy);
        let identity = identity.to_string();

        self.timer.arm(delay, Box::new(move || hook(policy, identity)));
    }

    pub fn cancel(&self) {
        self.timer.cancel();
    }
}

/// Earliest expiry strictly after `now`
pub fn next_expiry(policy: &LoginPolicy, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    policy
        .users
        .iter()
        .filter_map(|user| user.expires_at)
        .filter(|at| *at > now)
        .min()
}
