//! Cross-module lifecycle behavior through the public API: registry
//! membership, fault policy and override reversion working together.

use std::time::{Duration, Instant};

use appvisor_core::fault::{ExitStatus, FaultAction};
use appvisor_core::registry::SessionId;
use appvisor_core::{ConfigStore, Registry, SystemConfig};

fn store() -> ConfigStore {
    let config: SystemConfig = serde_json::from_str(
        r#"{
            "apps": [{
                "name": "crasher",
                "procs": [{
                    "name": "main",
                    "command": "/bin/crasher",
                    "fault_action": "restart",
                    "probation_ms": 30000
                }]
            }]
        }"#,
    )
    .unwrap();
    ConfigStore::from_config(config)
}

#[test]
fn test_crash_loop_is_bounded_by_the_fault_limit() {
    let store = store();
    let mut registry = Registry::new();
    registry.get_or_create(&store, "crasher").unwrap();
    registry.activate("crasher");

    let t0 = Instant::now();
    let app = registry.app_mut("crasher").unwrap();
    let proc = app.proc_mut("main").unwrap();

    // First crash: the configured action applies.
    proc.started(100);
    assert_eq!(
        proc.evaluate_fault(ExitStatus::exited(1), t0),
        Some(FaultAction::Restart)
    );

    // Second crash inside probation: the fault limit floors the action to
    // stop-app, whatever was configured.
    proc.started(101);
    assert_eq!(
        proc.evaluate_fault(ExitStatus::exited(1), t0 + Duration::from_secs(2)),
        Some(FaultAction::StopApp)
    );
}

#[test]
fn test_restart_cycle_reuses_the_container() {
    let store = store();
    let mut registry = Registry::new();
    registry.get_or_create(&store, "crasher").unwrap();

    registry.activate("crasher");
    registry.app_mut("crasher").unwrap().proc_mut("main").unwrap().started(200);
    assert_eq!(registry.app_owning_pid(200), Some("crasher"));

    // Stop: the process exits, the app deactivates, the container stays.
    let app = registry.app_mut("crasher").unwrap();
    app.proc_mut("main").unwrap().evaluate_fault(ExitStatus::exited(0), Instant::now());
    registry.deactivate("crasher");
    assert!(registry.app("crasher").is_some());

    // Start again: a new PID, same container.
    registry.activate("crasher");
    registry.app_mut("crasher").unwrap().proc_mut("main").unwrap().started(201);
    assert_eq!(registry.app_owning_pid(201), Some("crasher"));
    assert_eq!(registry.app_owning_pid(200), None);
}

#[test]
fn test_override_reversion_law() {
    let store = store();
    let mut registry = Registry::new();

    let handle = registry.create_handle(&store, "crasher", SessionId(1)).unwrap();
    registry
        .app_mut("crasher")
        .unwrap()
        .proc_mut("main")
        .unwrap()
        .set_run_override(false);
    assert!(!registry.app("crasher").unwrap().proc("main").unwrap().effective_run());

    // After release, every override equals configuration again.
    registry.release_handle(handle, SessionId(1));
    assert!(registry.app("crasher").unwrap().proc("main").unwrap().effective_run());
}
