//! In-memory stand-ins for the host, the key server and the timer

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::KeyServerError;
use crate::login::expiry::{Clock, ExpiryCallback, OneShotTimer};
use crate::login::resolver::KeyServer;
use crate::platform::{GroupAction, KeysFileOptions, Platform};
use crate::policy::{KeySlot, LoginUser};

/// Key server answering from a fixed table and recording every request
pub struct FakeKeyServer {
    keys: HashMap<String, String>,
    failure: Mutex<Option<String>>,
    calls: Mutex<Vec<(String, Vec<String>)>>,
}

impl FakeKeyServer {
    pub fn returning<'a>(keys: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            keys: keys
                .into_iter()
                .map(|(fp, key)| (fp.to_string(), key.to_string()))
                .collect(),
            failure: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn empty() -> Self {
        Self::returning(Vec::new())
    }

    pub fn failing(reason: &str) -> Self {
        let server = Self::empty();
        server.fail_with(reason);
        server
    }

    /// Fail every later request with `reason`
    pub fn fail_with(&self, reason: &str) {
        *self.failure.lock().unwrap() = Some(reason.to_string());
    }

    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl KeyServer for FakeKeyServer {
    async fn retrieve_public_keys(
        &self,
        identity: &str,
        fingerprints: &[String],
    ) -> Result<HashMap<String, String>, KeyServerError> {
        self.calls
            .lock()
            .unwrap()
            .push((identity.to_string(), fingerprints.to_vec()));

        if let Some(reason) = self.failure.lock().unwrap().clone() {
            return Err(KeyServerError::Other(reason));
        }

        Ok(fingerprints
            .iter()
            .filter_map(|fp| self.keys.get(fp).map(|key| (fp.clone(), key.clone())))
            .collect())
    }
}

/// Host operation observed by [`FakePlatform`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformOp {
    AddUser(String),
    Group(GroupAction, String),
    WriteKeys(usize),
}

/// Host with accounts, group membership and a keys file held in memory
pub struct FakePlatform {
    pub supported: bool,
    fail_group_edits: AtomicBool,
    users: Mutex<HashSet<String>>,
    members: Mutex<HashSet<String>>,
    keys_file: Mutex<Vec<String>>,
    ops: Mutex<Vec<PlatformOp>>,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self {
            supported: true,
            fail_group_edits: AtomicBool::new(false),
            users: Mutex::new(HashSet::new()),
            members: Mutex::new(HashSet::new()),
            keys_file: Mutex::new(Vec::new()),
            ops: Mutex::new(Vec::new()),
        }
    }

    pub fn unsupported() -> Self {
        Self {
            supported: false,
            ..Self::new()
        }
    }

    pub fn with_failing_group_edits() -> Self {
        let platform = Self::new();
        platform.set_failing_group_edits(true);
        platform
    }

    pub fn set_failing_group_edits(&self, failing: bool) {
        self.fail_group_edits.store(failing, Ordering::SeqCst);
    }

    pub fn ops(&self) -> Vec<PlatformOp> {
        self.ops.lock().unwrap().clone()
    }

    pub fn clear_ops(&self) {
        self.ops.lock().unwrap().clear();
    }

    pub fn keys_file(&self) -> Vec<String> {
        self.keys_file.lock().unwrap().clone()
    }

    pub fn is_member(&self, username: &str) -> bool {
        self.members.lock().unwrap().contains(username)
    }

    pub fn writes(&self) -> usize {
        self.ops()
            .iter()
            .filter(|op| matches!(op, PlatformOp::WriteKeys(_)))
            .count()
    }
}

impl Platform for FakePlatform {
    fn supported_by_platform(&self) -> bool {
        self.supported
    }

    fn user_exists(&self, name: &str) -> Result<bool> {
        Ok(self.users.lock().unwrap().contains(name))
    }

    fn uid_exists(&self, _uid: u32) -> Result<bool> {
        Ok(false)
    }

    fn add_user(&self, user: &LoginUser) -> Result<()> {
        self.users.lock().unwrap().insert(user.username.clone());
        self.ops
            .lock()
            .unwrap()
            .push(PlatformOp::AddUser(user.username.clone()));
        Ok(())
    }

    fn manage_group(&self, _group: &str, action: GroupAction, username: &str) -> Result<()> {
        if self.fail_group_edits.load(Ordering::SeqCst) {
            anyhow::bail!("usermod: group edit refused");
        }

        let mut members = self.members.lock().unwrap();
        match action {
            GroupAction::Add => members.insert(username.to_string()),
            GroupAction::Remove => members.remove(username),
        };
        self.ops
            .lock()
            .unwrap()
            .push(PlatformOp::Group(action, username.to_string()));
        Ok(())
    }

    fn read_keys_file(&self, _path: &Path) -> Result<Vec<String>> {
        Ok(self.keys_file())
    }

    fn write_keys_file(&self, lines: &[String], _path: &Path, _options: &KeysFileOptions) -> Result<()> {
        *self.keys_file.lock().unwrap() = lines.to_vec();
        self.ops
            .lock()
            .unwrap()
            .push(PlatformOp::WriteKeys(lines.len()));
        Ok(())
    }
}

/// Timer that only fires when a test tells it to
#[derive(Default)]
pub struct ManualTimer {
    armed: Mutex<Option<(Duration, ExpiryCallback)>>,
    arm_count: Mutex<usize>,
}

impl ManualTimer {
    pub fn armed_delay(&self) -> Option<Duration> {
        self.armed.lock().unwrap().as_ref().map(|(delay, _)| *delay)
    }

    pub fn arm_count(&self) -> usize {
        *self.arm_count.lock().unwrap()
    }

    /// Disarm and hand back the pending callback without running it
    pub fn take_armed(&self) -> Option<ExpiryCallback> {
        self.armed.lock().unwrap().take().map(|(_, callback)| callback)
    }

    /// Fire the armed timer, returning whether one was armed
    pub fn fire(&self) -> bool {
        match self.take_armed() {
            Some(callback) => {
                callback();
                true
            }
            None => false,
        }
    }
}

impl OneShotTimer for ManualTimer {
    fn arm(&self, delay: Duration, callback: ExpiryCallback) {
        *self.armed.lock().unwrap() = Some((delay, callback));
        *self.arm_count.lock().unwrap() += 1;
    }

    fn cancel(&self) {
        self.armed.lock().unwrap().take();
    }
}

/// Clock that only moves when a test advances it
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn starting_at(now: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(now),
        })
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    pub fn advance(&self, by: chrono::Duration) {
        *self.now.lock().unwrap() += by;
    }

    pub fn clock(self: &Arc<Self>) -> Clock {
        let clock = Arc::clone(self);
        Arc::new(move || clock.now())
    }
}

/// User whose slots are given as `(fingerprint, Some(key) | None)`
pub fn user_with_slots(num: u32, superuser: bool, slots: &[(&str, Option<&str>)]) -> LoginUser {
    let keys = slots
        .iter()
        .map(|(fp, key)| match key {
            Some(key) => KeySlot::Resolved {
                fingerprint: fp.to_string(),
                key: key.to_string(),
            },
            None => KeySlot::pending(*fp),
        })
        .collect();

    LoginUser::new(
        num.to_string(),
        format!("user{}", num),
        format!("{}@rightscale.com", num),
        superuser,
        None,
        keys,
    )
}

/// User with one resolved key per entry in `keys`
pub fn user_with_keys(num: u32, superuser: bool, keys: &[&str]) -> LoginUser {
    LoginUser::new(
        num.to_string(),
        format!("user{}", num),
        format!("{}@rightscale.com", num),
        superuser,
        None,
        keys.iter().map(|key| KeySlot::resolved(*key)).collect(),
    )
}
