//! Framework-daemon orchestrator.
//!
//! The auxiliary daemons (service directory, logger, config tree, updater,
//! watchdog) must exist before any app starts. They are started in
//! configuration order, each behind a ready barrier, and shut down in
//! reverse order, one soft kill at a time.

use std::os::fd::OwnedFd;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use nix::sys::signal::{SigSet, SigmaskHow, sigprocmask};
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tracing::{info, warn};

use appvisor_core::{Error, Result};
use appvisor_sys::{KillTimers, SOFT_KILL_TIMEOUT, reaper};

#[derive(Debug)]
struct Daemon {
    path: PathBuf,
    pid: Option<i32>,
}

impl Daemon {
    fn name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("<daemon>")
    }
}

/// Progress of the reverse-ordered shutdown sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    /// A daemon was soft-killed; waiting for its SIGCHLD.
    Advanced,
    /// Only the first daemon is left and has just been soft-killed. Replies
    /// must go out now, while it is still alive to route them.
    Intermediate,
    /// All framework daemons are down.
    Complete,
}

/// Outcome of a framework daemon's exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonExit {
    ShuttingDown(ShutdownPhase),
    /// A framework daemon died outside a shutdown sequence. The system is
    /// unworkable.
    Unexpected,
}

#[derive(Debug)]
pub struct DaemonSet {
    daemons: Vec<Daemon>,
    shutdown_cursor: Option<isize>,
}

impl DaemonSet {
    pub fn new(paths: &[PathBuf]) -> Self {
        Self {
            daemons: paths
                .iter()
                .map(|path| Daemon { path: path.clone(), pid: None })
                .collect(),
            shutdown_cursor: None,
        }
    }

    pub fn owns(&self, pid: i32) -> bool {
        self.daemons.iter().any(|d| d.pid == Some(pid))
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_cursor.is_some()
    }

    /// Starts every daemon in order, waiting for each one's ready barrier.
    ///
    /// A daemon that dies during this phase leaves the framework unworkable,
    /// so each barrier is followed by a peek at the reaper.
    pub async fn start_all(&mut self) -> Result<()> {
        for idx in 0..self.daemons.len() {
            self.start_one(idx).await?;

            if let Some(pid) = reaper::peek_any_child()?
                && self.owns(pid)
            {
                return Err(Error::Supervisor(format!(
                    "framework daemon '{}' died during startup",
                    self.daemons.iter().find(|d| d.pid == Some(pid)).unwrap().name()
                )));
            }
        }
        Ok(())
    }

    async fn start_one(&mut self, idx: usize) -> Result<()> {
        let daemon = &self.daemons[idx];
        let name = daemon.name().to_string();

        // The child inherits the write end of the sync pipe on fd 0 and
        // signals readiness by closing it; EOF on the read end is the
        // barrier.
        let (sync_read, sync_write): (OwnedFd, OwnedFd) = nix::unistd::pipe()?;

        // The Command must go out of scope before the barrier read: it keeps
        // its copy of the pipe's write end until it is dropped, and EOF only
        // arrives once the child holds the last one.
        let pid = {
            let mut cmd = Command::new(&daemon.path);
            cmd.stdin(Stdio::from(sync_write));
            unsafe {
                cmd.pre_exec(|| {
                    // The daemon must not inherit the supervisor's signal mask.
                    sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)
                        .map_err(std::io::Error::from)?;
                    Ok(())
                });
            }

            let child = cmd
                .spawn()
                .map_err(|e| Error::SpawnFailed(format!("{}: {e}", daemon.path.display())))?;
            child.id() as i32
        };

        self.daemons[idx].pid = Some(pid);

        let mut barrier = pipe::Receiver::from_owned_fd(set_nonblocking(sync_read)?)?;
        let mut scratch = Vec::new();
        barrier.read_to_end(&mut scratch).await?;

        info!("started framework daemon '{name}' with pid {pid}");
        Ok(())
    }

    /// Kicks off the reverse-ordered shutdown. Asynchronous: each subsequent
    /// step runs from [`DaemonSet::handle_exit`] as the SIGCHLDs come in.
    pub fn begin_shutdown(&mut self, kill: &mut KillTimers) -> ShutdownPhase {
        self.shutdown_cursor = Some(self.daemons.len() as isize - 1);
        self.shutdown_next(kill)
    }

    fn shutdown_next(&mut self, kill: &mut KillTimers) -> ShutdownPhase {
        let mut cursor = self.shutdown_cursor.expect("shutdown not started");

        while cursor >= 0 && self.daemons[cursor as usize].pid.is_none() {
            cursor -= 1;
        }
        self.shutdown_cursor = Some(cursor);

        if cursor < 0 {
            return ShutdownPhase::Complete;
        }

        let daemon = &self.daemons[cursor as usize];
        warn!("killing framework daemon '{}'", daemon.name());
        kill.soft_kill(daemon.pid.unwrap(), SOFT_KILL_TIMEOUT);

        if cursor == 0 {
            ShutdownPhase::Intermediate
        } else {
            ShutdownPhase::Advanced
        }
    }

    /// Processes the reaped exit of a framework daemon. The caller has
    /// already verified ownership via [`DaemonSet::owns`].
    pub fn handle_exit(&mut self, pid: i32, kill: &mut KillTimers) -> DaemonExit {
        let daemon = self
            .daemons
            .iter_mut()
            .find(|d| d.pid == Some(pid))
            .expect("pid not owned by a framework daemon");
        daemon.pid = None;

        if self.is_shutting_down() {
            DaemonExit::ShuttingDown(self.shutdown_next(kill))
        } else {
            DaemonExit::Unexpected
        }
    }
}

fn set_nonblocking(fd: OwnedFd) -> Result<OwnedFd> {
    use nix::fcntl::{FcntlArg, OFlag, fcntl};
    let flags = fcntl(&fd, FcntlArg::F_GETFL)?;
    fcntl(
        &fd,
        FcntlArg::F_SETFL(OFlag::from_bits_retain(flags) | OFlag::O_NONBLOCK),
    )?;
    Ok(fd)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Far beyond any kernel pid_max, so the soft kills inside the shutdown
    // walk can only get ESRCH.
    const PID_A: i32 = 9_000_011;
    const PID_B: i32 = 9_000_013;

    fn fake_set(pids: &[Option<i32>]) -> DaemonSet {
        let paths: Vec<PathBuf> = (0..pids.len())
            .map(|i| PathBuf::from(format!("/usr/libexec/d{i}")))
            .collect();
        let mut set = DaemonSet::new(&paths);
        for (daemon, pid) in set.daemons.iter_mut().zip(pids) {
            daemon.pid = *pid;
        }
        set
    }

    #[test]
    fn test_ownership() {
        let set = fake_set(&[Some(PID_A), None, Some(PID_B)]);
        assert!(set.owns(PID_A));
        assert!(set.owns(PID_B));
        assert!(!set.owns(1));
    }

    #[tokio::test]
    async fn test_shutdown_walks_backwards_skipping_dead() {
        let mut set = fake_set(&[Some(PID_A), None, Some(PID_B)]);
        let mut kill = KillTimers::new();

        // The last live daemon goes first.
        assert_eq!(set.begin_shutdown(&mut kill), ShutdownPhase::Advanced);

        // The middle daemon is already dead, so the next exit moves straight
        // to daemon 0, which is the intermediate point.
        assert_eq!(
            set.handle_exit(PID_B, &mut kill),
            DaemonExit::ShuttingDown(ShutdownPhase::Intermediate)
        );

        assert_eq!(
            set.handle_exit(PID_A, &mut kill),
            DaemonExit::ShuttingDown(ShutdownPhase::Complete)
        );

        kill.clear();
    }

    #[tokio::test]
    async fn test_empty_set_completes_immediately() {
        let mut set = DaemonSet::new(&[]);
        let mut kill = KillTimers::new();
        assert_eq!(set.begin_shutdown(&mut kill), ShutdownPhase::Complete);
    }

    #[test]
    fn test_exit_outside_shutdown_is_unexpected() {
        let mut set = fake_set(&[Some(PID_A)]);
        let mut kill = KillTimers::new();
        assert_eq!(set.handle_exit(PID_A, &mut kill), DaemonExit::Unexpected);
    }
}
