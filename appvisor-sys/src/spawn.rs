use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

use nix::fcntl::{FcntlArg, OFlag, fcntl};
use tokio::net::unix::pipe;

use appvisor_core::config::{PriorityClass, ProcLimits};
use appvisor_core::{Error, Result};

use crate::rlimit;

/// Everything needed to launch one managed process.
#[derive(Debug)]
pub struct LaunchSpec<'a> {
    pub exec: &'a str,
    pub args: &'a [String],
    pub env: &'a HashMap<String, String>,
    pub priority: PriorityClass,
    pub limits: &'a ProcLimits,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub groups: &'a [u32],
    /// Stop under ptrace before exec so an attaching tracer can inherit.
    pub debug: bool,
}

/// A launched child. The OS process is NOT tied to this value; reaping is
/// the central reaper's job and dropping this only drops the stdio pipes.
pub struct LaunchedProc {
    pub pid: i32,
    pub stdout: Option<pipe::Receiver>,
    pub stderr: Option<pipe::Receiver>,
}

/// Forks and execs a managed process.
///
/// In the child, before exec: scheduling class, rlimits, identity drop and
/// the optional ptrace stop. In the parent: the stdio pipes are switched to
/// non-blocking and handed back for forwarding.
///
/// Stdin comes from /dev/null; stdout and stderr are piped to the caller.
pub fn launch(spec: &LaunchSpec<'_>) -> Result<LaunchedProc> {
    let mut cmd = Command::new(spec.exec);
    cmd.args(spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    for (key, value) in spec.env {
        cmd.env(key, value);
    }

    let priority = spec.priority;
    let limits = *spec.limits;
    let debug = spec.debug;
    let uid = spec.uid;
    let gid = spec.gid;
    let groups: Vec<u32> = spec.groups.to_vec();
    unsafe {
        cmd.pre_exec(move || {
            if !groups.is_empty() {
                let gids: Vec<nix::unistd::Gid> =
                    groups.iter().map(|g| nix::unistd::Gid::from_raw(*g)).collect();
                nix::unistd::setgroups(&gids).map_err(std::io::Error::from)?;
            }
            if let Some(gid) = gid {
                nix::unistd::setgid(nix::unistd::Gid::from_raw(gid))
                    .map_err(std::io::Error::from)?;
            }
            if let Some(uid) = uid {
                nix::unistd::setuid(nix::unistd::Uid::from_raw(uid))
                    .map_err(std::io::Error::from)?;
            }
            apply_priority(priority)?;
            rlimit::apply(&limits)?;
            if debug {
                nix::sys::ptrace::traceme().map_err(std::io::Error::from)?;
                if libc::raise(libc::SIGSTOP) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::SpawnFailed(format!("{}: {e}", spec.exec)))?;
    let pid = child.id() as i32;

    let stdout = child.stdout.take().map(into_async_pipe).transpose()?;
    let stderr = child.stderr.take().map(into_async_pipe).transpose()?;

    // The Child handle is dropped here without waiting; dropping neither
    // kills nor reaps, and the reaper stays authoritative.
    Ok(LaunchedProc { pid, stdout, stderr })
}

fn apply_priority(class: PriorityClass) -> std::io::Result<()> {
    if let Some(rt_priority) = class.rt_priority() {
        let param = libc::sched_param { sched_priority: rt_priority };
        if unsafe { libc::sched_setscheduler(0, libc::SCHED_RR, &param) } == -1 {
            return Err(std::io::Error::last_os_error());
        }
    } else if let Some(nice) = class.nice()
        && nice != 0
        && unsafe { libc::setpriority(libc::PRIO_PROCESS as _, 0, nice) } == -1
    {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn into_async_pipe(out: impl Into<OwnedFd>) -> Result<pipe::Receiver> {
    let fd: OwnedFd = out.into();

    let flags = fcntl(&fd, FcntlArg::F_GETFL).map_err(std::io::Error::from)?;
    let flags = OFlag::from_bits_retain(flags) | OFlag::O_NONBLOCK;
    fcntl(&fd, FcntlArg::F_SETFL(flags)).map_err(std::io::Error::from)?;

    Ok(pipe::Receiver::from_owned_fd(fd)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CHILD_TEST_LOCK;

    #[tokio::test]
    async fn test_launch_captures_stdout() {
        use tokio::io::AsyncReadExt;

        let _guard = CHILD_TEST_LOCK.lock().unwrap();
        let env = HashMap::new();
        let limits = ProcLimits::default();
        let args = vec!["hello".to_string()];
        let launched = launch(&LaunchSpec {
            exec: "/bin/echo",
            args: &args,
            env: &env,
            priority: PriorityClass::Medium,
            limits: &limits,
            uid: None,
            gid: None,
            groups: &[],
            debug: false,
        })
        .unwrap();
        assert!(launched.pid > 0);

        let mut output = String::new();
        launched
            .stdout
            .unwrap()
            .read_to_string(&mut output)
            .await
            .unwrap();
        assert_eq!(output.trim(), "hello");

        // Leave no zombie behind for other tests.
        let _ = nix::sys::wait::waitpid(nix::unistd::Pid::from_raw(launched.pid), None);
    }

    #[test]
    fn test_launch_of_missing_executable_fails() {
        let env = HashMap::new();
        let limits = ProcLimits::default();
        let result = launch(&LaunchSpec {
            exec: "/nonexistent/bin",
            args: &[],
            env: &env,
            priority: PriorityClass::Medium,
            limits: &limits,
            uid: None,
            gid: None,
            groups: &[],
            debug: false,
        });
        assert!(matches!(result, Err(Error::SpawnFailed(_))));
    }
}
