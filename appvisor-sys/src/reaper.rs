//! Wrappers around the wait() family.
//!
//! Peeking and reaping are split so the dispatch layer can identify which
//! subsystem owns a child before its status is consumed.

use nix::errno::Errno;
use nix::sys::wait::{Id, WaitPidFlag, WaitStatus, waitid, waitpid};
use nix::unistd::Pid;

use appvisor_core::{Error, ExitStatus, Result};

/// Pid of any child in a waitable state, without reaping it. Never blocks.
pub fn peek_any_child() -> Result<Option<i32>> {
    loop {
        match waitid(
            Id::All,
            WaitPidFlag::WEXITED | WaitPidFlag::WNOHANG | WaitPidFlag::WNOWAIT,
        ) {
            Ok(WaitStatus::StillAlive) => return Ok(None),
            Ok(status) => return Ok(status.pid().map(Pid::as_raw)),
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => return Ok(None),
            Err(e) => return Err(e.into()),
        }
    }
}

/// Reaps a specific child, which must be in a waitable state (normally one
/// just reported by [`peek_any_child`]). Never blocks.
pub fn reap_child(pid: i32) -> Result<ExitStatus> {
    loop {
        match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(ExitStatus::exited(code)),
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                return Ok(ExitStatus::signaled(signal as i32));
            }
            Ok(other) => {
                return Err(Error::Supervisor(format!(
                    "could not reap child {pid}: unexpected wait status {other:?}"
                )));
            }
            Err(Errno::EINTR) => continue,
            Err(e) => {
                return Err(Error::Supervisor(format!("could not reap child {pid}: {e}")));
            }
        }
    }
}
