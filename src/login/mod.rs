// Login policy reconciliation
//
// A pushed policy flows through key resolution, expiry filtering, account
// and group convergence and the authorized-keys write, in that order. The
// manager then arms a timer for the next expiry so lapsed users are dropped
// without waiting for another push.

pub mod audit;
pub mod expiry;
pub mod key_server;
pub mod manager;
pub mod prefix;
pub mod resolver;

pub use audit::describe_policy;
pub use expiry::{
    Clock, EXPIRY_RETRY_DELAY, ExpiryHook, ExpiryScheduler, MAX_TIMER_DELAY, OneShotTimer, TokioTimer, system_clock,
};
pub use key_server::HttpKeyServer;
pub use manager::{LoginManager, Reconciliation, UNSUPPORTED_TEXT};
pub use prefix::CommandPrefixBuilder;
pub use resolver::{KeyResolver, KeyServer, ResolvedUsers};
