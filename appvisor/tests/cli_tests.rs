//! CLI surface tests against the built binary. None of these need a running
//! supervisor.

use std::process::Command;

fn appvisor() -> Command {
    Command::new(env!("CARGO_BIN_EXE_appvisor"))
}

#[test]
fn test_help_lists_commands() {
    let output = appvisor().arg("--help").output().unwrap();
    assert!(output.status.success());

    let text = String::from_utf8_lossy(&output.stdout);
    for command in ["start", "stop", "restart", "list", "status", "info", "run-proc"] {
        assert!(text.contains(command), "--help does not mention '{command}'");
    }
}

#[test]
fn test_start_requires_an_app_name() {
    let output = appvisor().arg("start").output().unwrap();
    assert!(!output.status.success());
}

#[test]
fn test_commands_fail_cleanly_without_a_daemon() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("nonexistent.sock");

    let output = appvisor()
        .args(["--socket", socket.to_str().unwrap(), "list"])
        .output()
        .unwrap();
    assert!(!output.status.success());

    let text = String::from_utf8_lossy(&output.stderr);
    assert!(text.contains("could not reach the supervisor"));
}

#[test]
fn test_supervisor_rejects_bad_start_apps_mode() {
    let output = appvisor()
        .args(["supervisor", "--start-apps", "sometimes"])
        .output()
        .unwrap();
    assert!(!output.status.success());

    let text = String::from_utf8_lossy(&output.stderr);
    assert!(text.contains("start-apps"));
}
