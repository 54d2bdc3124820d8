// Agent daemon
//
// Polls the locally delivered policy file and pushes each new version into
// the login service. The service outlives individual polls so expiry timers
// armed by one apply keep firing until the next.

mod daemon;
mod scheduler;

pub use daemon::{build_service, check_and_apply_once, check_policy_file, run_agent_daemon};
pub use scheduler::PollingScheduler;
