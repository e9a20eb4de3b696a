//! Soft-kill behavior against real child processes.

use std::process::Command;
use std::time::Duration;

use nix::sys::signal::kill;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;

use appvisor_sys::KillTimers;

fn spawn_shell(script: &str) -> i32 {
    let child = Command::new("/bin/sh").args(["-c", script]).spawn().unwrap();
    let pid = child.id() as i32;
    drop(child);
    pid
}

/// Polls the child until it is reaped, without blocking the timer tasks.
async fn wait_for_exit(pid: i32) -> WaitStatus {
    loop {
        match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)).unwrap() {
            WaitStatus::StillAlive => tokio::time::sleep(Duration::from_millis(20)).await,
            status => return status,
        }
    }
}

#[tokio::test]
async fn test_soft_kill_terminates_cooperative_child() {
    let pid = spawn_shell("sleep 30");
    let mut timers = KillTimers::new();

    timers.soft_kill(pid, Duration::from_secs(5));
    let status = wait_for_exit(pid).await;
    timers.died(pid);

    assert_eq!(status, WaitStatus::Signaled(Pid::from_raw(pid), nix::sys::signal::SIGTERM, false));
    assert_eq!(timers.pending(), 0);
}

#[tokio::test]
async fn test_soft_kill_escalates_to_sigkill() {
    let pid = spawn_shell("trap '' TERM; sleep 30");
    // Give the shell a moment to install the trap.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut timers = KillTimers::new();
    timers.soft_kill(pid, Duration::from_millis(200));

    let status = wait_for_exit(pid).await;
    timers.died(pid);

    assert_eq!(status, WaitStatus::Signaled(Pid::from_raw(pid), nix::sys::signal::SIGKILL, false));
}

#[tokio::test]
async fn test_died_cancels_pending_escalation() {
    let pid = spawn_shell("trap '' TERM; sleep 30");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut timers = KillTimers::new();
    timers.soft_kill(pid, Duration::from_millis(100));
    timers.died(pid);

    // Well past the deadline the child must still be alive, since the
    // escalation timer was cancelled.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(kill(Pid::from_raw(pid), None).is_ok());

    timers.hard_kill(pid);
    wait_for_exit(pid).await;
}
