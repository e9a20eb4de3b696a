use std::path::PathBuf;

use crate::config::AppConfig;
use crate::process::{Proc, ProcState};
use crate::registry::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Stopped,
    Running,
}

/// What to do once an app's stop completes. Set by whoever initiated the
/// stop; the default is to simply move the app to the inactive list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopDisposition {
    /// Move to the inactive list.
    #[default]
    Deactivate,
    /// Start the app again (fault action restart-app, or an explicit
    /// restart request).
    Restart,
    /// A client asked for the stop; reply to it, then deactivate.
    Reply,
    /// Removal requested; deactivate, delete the container, then reply.
    Remove,
    /// Framework shutdown in progress; delete this app and stop the next.
    ShutdownNext,
}

/// The supervisor-side container for one installed application: its process
/// objects, per-handle overrides and stop bookkeeping.
///
/// Created lazily on first reference or start, reused across restart cycles,
/// destroyed on uninstall.
#[derive(Debug)]
pub struct App {
    config: AppConfig,
    state: AppState,
    procs: Vec<Proc>,
    disposition: StopDisposition,
    /// Bumped on every stop cycle so stale deadline timers can be told apart
    /// from current ones.
    stop_seq: u64,
    /// Stop-completion recheck budget, per app.
    stop_retries: u32,
    /// A stop sequence is in flight; suppresses fault-driven proc restarts.
    stopping: bool,
    /// PIDs hit by the most recent kill sweep over the freezer cgroup, for
    /// detecting processes that survive two passes.
    last_kill_pass: Vec<i32>,
    /// Session currently holding the override handle, if any.
    owner: Option<SessionId>,
    imports: Vec<PathBuf>,
    device_perms: Vec<(PathBuf, String)>,
}

impl App {
    pub fn new(config: AppConfig) -> Self {
        let procs = config.procs.iter().cloned().map(Proc::new).collect();
        Self {
            config,
            state: AppState::Stopped,
            procs,
            disposition: StopDisposition::Deactivate,
            stop_seq: 0,
            stop_retries: 0,
            stopping: false,
            last_kill_pass: Vec::new(),
            owner: None,
            imports: Vec::new(),
            device_perms: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn state(&self) -> AppState {
        self.state
    }

    pub fn set_state(&mut self, state: AppState) {
        self.state = state;
    }

    pub fn procs(&self) -> impl Iterator<Item = &Proc> {
        self.procs.iter()
    }

    pub fn proc(&self, name: &str) -> Option<&Proc> {
        self.procs.iter().find(|p| p.name() == name)
    }

    pub fn proc_mut(&mut self, name: &str) -> Option<&mut Proc> {
        self.procs.iter_mut().find(|p| p.name() == name)
    }

    pub fn proc_by_pid_mut(&mut self, pid: i32) -> Option<&mut Proc> {
        self.procs.iter_mut().find(|p| p.pid() == Some(pid))
    }

    pub fn owns_pid(&self, pid: i32) -> bool {
        self.procs.iter().any(|p| p.pid() == Some(pid))
    }

    pub fn has_running_procs(&self) -> bool {
        self.procs.iter().any(|p| p.state() == ProcState::Running)
    }

    /// Adds a client-injected process object. The name must not collide with
    /// another process of this app.
    pub fn add_proc(&mut self, proc: Proc) -> crate::Result<()> {
        if self.proc(proc.name()).is_some() {
            return Err(crate::Error::InvalidName(format!(
                "process '{}' already exists in app '{}'",
                proc.name(),
                self.name()
            )));
        }
        self.procs.push(proc);
        Ok(())
    }

    pub fn remove_proc(&mut self, name: &str) -> Option<Proc> {
        let idx = self.procs.iter().position(|p| p.name() == name)?;
        Some(self.procs.remove(idx))
    }

    pub fn disposition(&self) -> StopDisposition {
        self.disposition
    }

    pub fn set_disposition(&mut self, disposition: StopDisposition) {
        self.disposition = disposition;
    }

    /// Resets stop bookkeeping for a new stop cycle and returns its sequence
    /// number.
    pub fn begin_stop_cycle(&mut self) -> u64 {
        self.stop_seq += 1;
        self.stop_retries = 0;
        self.stopping = true;
        self.last_kill_pass.clear();
        self.stop_seq
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    pub fn stop_cycle_done(&mut self) {
        self.stopping = false;
        self.last_kill_pass.clear();
    }

    pub fn last_kill_pass(&self) -> &[i32] {
        &self.last_kill_pass
    }

    pub fn set_last_kill_pass(&mut self, pids: Vec<i32>) {
        self.last_kill_pass = pids;
    }

    pub fn stop_seq(&self) -> u64 {
        self.stop_seq
    }

    pub fn bump_stop_retries(&mut self) -> u32 {
        self.stop_retries += 1;
        self.stop_retries
    }

    pub fn reset_stop_retries(&mut self) {
        self.stop_retries = 0;
    }

    pub fn owner(&self) -> Option<SessionId> {
        self.owner
    }

    pub fn set_owner(&mut self, session: SessionId) {
        self.owner = Some(session);
    }

    pub fn add_import(&mut self, path: PathBuf) {
        self.imports.push(path);
    }

    pub fn add_device_perm(&mut self, path: PathBuf, perm: String) {
        self.device_perms.push((path, perm));
    }

    pub fn imports(&self) -> &[PathBuf] {
        &self.imports
    }

    pub fn device_perms(&self) -> &[(PathBuf, String)] {
        &self.device_perms
    }

    /// Reverts everything a handle holder may have changed. Called on
    /// release and on client disconnect.
    pub fn release_handle(&mut self) {
        self.owner = None;
        self.imports.clear();
        self.device_perms.clear();
        for proc in &mut self.procs {
            proc.clear_overrides();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SystemConfig;
    use crate::process::Proc;

    fn test_app() -> App {
        let config: SystemConfig = serde_json::from_str(
            r#"{
                "apps": [{
                    "name": "svc",
                    "procs": [
                        {"name": "worker", "command": "/bin/worker"},
                        {"name": "helper", "command": "/bin/helper", "run": false}
                    ]
                }]
            }"#,
        )
        .unwrap();
        App::new(config.apps.into_iter().next().unwrap())
    }

    #[test]
    fn test_new_app_is_stopped_with_configured_procs() {
        let app = test_app();
        assert_eq!(app.state(), AppState::Stopped);
        assert_eq!(app.procs().count(), 2);
        assert!(app.proc("worker").is_some());
        assert!(!app.has_running_procs());
    }

    #[test]
    fn test_pid_lookup() {
        let mut app = test_app();
        app.proc_mut("worker").unwrap().started(42);

        assert!(app.owns_pid(42));
        assert!(!app.owns_pid(43));
        assert_eq!(app.proc_by_pid_mut(42).unwrap().name(), "worker");
        assert!(app.has_running_procs());
    }

    #[test]
    fn test_release_handle_reverts_all_overrides() {
        let mut app = test_app();
        app.set_owner(SessionId(7));
        app.proc_mut("worker").unwrap().set_run_override(false);
        app.proc_mut("helper").unwrap().set_debug_override(true);
        app.add_import(PathBuf::from("/etc/resolv.conf"));
        app.add_device_perm(PathBuf::from("/dev/ttyS0"), "rw".to_string());

        app.release_handle();

        assert_eq!(app.owner(), None);
        assert!(app.proc("worker").unwrap().effective_run());
        assert!(!app.proc("helper").unwrap().effective_debug());
        assert!(app.imports().is_empty());
        assert!(app.device_perms().is_empty());
    }

    #[test]
    fn test_injected_proc_name_collision() {
        let mut app = test_app();
        let config = serde_json::from_str(r#"{"name": "worker", "command": "/bin/other"}"#).unwrap();
        let injected = Proc::new_injected(config, SessionId(1));
        assert!(app.add_proc(injected).is_err());

        let config = serde_json::from_str(r#"{"name": "extra", "command": "/bin/other"}"#).unwrap();
        let injected = Proc::new_injected(config, SessionId(1));
        assert!(app.add_proc(injected).is_ok());
        assert!(app.remove_proc("extra").is_some());
    }

    #[test]
    fn test_stop_cycle_bookkeeping() {
        let mut app = test_app();
        let seq = app.begin_stop_cycle();
        assert_eq!(seq, 1);
        assert_eq!(app.bump_stop_retries(), 1);
        assert_eq!(app.bump_stop_retries(), 2);

        // A new cycle invalidates the old sequence and retry count.
        let seq2 = app.begin_stop_cycle();
        assert_ne!(seq, seq2);
        assert_eq!(app.bump_stop_retries(), 1);
    }
}
