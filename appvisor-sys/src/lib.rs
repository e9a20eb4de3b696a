pub mod cgroup;
pub mod kill;
pub mod notify;
pub mod reaper;
pub mod rlimit;
pub mod spawn;

pub use cgroup::{CgroupDriver, Created, FreezeState, Subsystem};
pub use kill::{KillTimers, SOFT_KILL_TIMEOUT};
pub use notify::{StopNotifier, notify_app_stopped};
pub use spawn::{LaunchSpec, LaunchedProc, launch};

/// Tests that spawn or wait on child processes observe each other through
/// wait(), so they serialize on this lock.
#[cfg(test)]
pub(crate) static CHILD_TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
