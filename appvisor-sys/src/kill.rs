use std::collections::HashMap;
use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::task::AbortHandle;
use tracing::warn;

/// Interval between the soft kill and the hard kill.
pub const SOFT_KILL_TIMEOUT: Duration = Duration::from_millis(1000);

/// Soft-then-hard termination with a deadline per target PID.
///
/// `soft_kill` sends SIGTERM and arms a timer that escalates to SIGKILL. The
/// timer MUST be cancelled through [`KillTimers::died`] once the reaper
/// confirms the death, so a recycled PID can never receive a stale SIGKILL.
#[derive(Debug, Default)]
pub struct KillTimers {
    timers: HashMap<i32, AbortHandle>,
}

impl KillTimers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn soft_kill(&mut self, pid: i32, timeout: Duration) {
        send(pid, Signal::SIGTERM);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            warn!(pid, "soft kill deadline passed, sending SIGKILL");
            send(pid, Signal::SIGKILL);
        })
        .abort_handle();

        if let Some(old) = self.timers.insert(pid, handle) {
            old.abort();
        }
    }

    pub fn hard_kill(&self, pid: i32) {
        send(pid, Signal::SIGKILL);
    }

    /// The reaper confirmed this PID dead; cancel its pending escalation.
    pub fn died(&mut self, pid: i32) {
        if let Some(handle) = self.timers.remove(&pid) {
            handle.abort();
        }
    }

    pub fn pending(&self) -> usize {
        self.timers.len()
    }

    pub fn clear(&mut self) {
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
    }
}

fn send(pid: i32, sig: Signal) {
    // ESRCH means the process beat us to it.
    let _ = kill(Pid::from_raw(pid), sig);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_died_for_unknown_pid_is_a_no_op() {
        let mut timers = KillTimers::new();
        timers.died(12345);
        assert_eq!(timers.pending(), 0);
    }
}
