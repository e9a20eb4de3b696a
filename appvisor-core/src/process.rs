use std::time::Instant;

use crate::config::ProcConfig;
use crate::fault::{ExitStatus, FaultAction};
use crate::registry::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Stopped,
    Running,
}

/// The supervisor's bookkeeping for one configured or client-injected
/// process. At most one live OS process corresponds to it; `pid` is set iff
/// the state is `Running`.
#[derive(Debug)]
pub struct Proc {
    config: ProcConfig,
    state: ProcState,
    pid: Option<i32>,
    /// Per-handle override of the configured run flag.
    run_override: Option<bool>,
    /// Per-handle override of the configured debug flag.
    debug_override: Option<bool>,
    /// One-shot executable override for a client-requested run.
    command_override: Option<(String, Vec<String>)>,
    /// Time of the most recent fault, for fault-rate limiting.
    last_fault: Option<Instant>,
    /// Session that injected this process, for configured processes None.
    injected_by: Option<SessionId>,
    /// Set when the injecting client is gone; the object is dropped once the
    /// exit is reaped.
    remove_on_exit: bool,
}

impl Proc {
    pub fn new(config: ProcConfig) -> Self {
        Self {
            config,
            state: ProcState::Stopped,
            pid: None,
            run_override: None,
            debug_override: None,
            command_override: None,
            last_fault: None,
            injected_by: None,
            remove_on_exit: false,
        }
    }

    pub fn new_injected(config: ProcConfig, session: SessionId) -> Self {
        Self {
            injected_by: Some(session),
            ..Self::new(config)
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ProcConfig {
        &self.config
    }

    pub fn state(&self) -> ProcState {
        self.state
    }

    pub fn pid(&self) -> Option<i32> {
        self.pid
    }

    pub fn is_running(&self) -> bool {
        self.state == ProcState::Running
    }

    pub fn injected_by(&self) -> Option<SessionId> {
        self.injected_by
    }

    pub fn is_injected(&self) -> bool {
        self.injected_by.is_some()
    }

    pub fn orphan(&mut self) {
        self.injected_by = None;
        self.remove_on_exit = true;
    }

    pub fn remove_on_exit(&self) -> bool {
        self.remove_on_exit
    }

    pub fn set_run_override(&mut self, run: bool) {
        self.run_override = Some(run);
    }

    pub fn set_debug_override(&mut self, debug: bool) {
        self.debug_override = Some(debug);
    }

    pub fn clear_overrides(&mut self) {
        self.run_override = None;
        self.debug_override = None;
    }

    pub fn effective_run(&self) -> bool {
        self.run_override.unwrap_or(self.config.run)
    }

    pub fn effective_debug(&self) -> bool {
        self.debug_override.unwrap_or(self.config.debug)
    }

    pub fn set_command_override(&mut self, command: String, args: Vec<String>) {
        self.command_override = Some((command, args));
    }

    pub fn clear_command_override(&mut self) {
        self.command_override = None;
    }

    pub fn effective_command(&self) -> (&str, &[String]) {
        match &self.command_override {
            Some((command, args)) => (command, args),
            None => (&self.config.command, &self.config.args),
        }
    }

    pub fn started(&mut self, pid: i32) {
        self.pid = Some(pid);
        self.state = ProcState::Running;
    }

    /// Records the termination reported by the reaper and returns the
    /// recovery action to apply.
    ///
    /// A clean exit is not a fault. A fault landing within the probation
    /// interval of the previous one means the process is crash-looping, and
    /// the action is forced to stop-app no matter what is configured.
    pub fn evaluate_fault(&mut self, status: ExitStatus, now: Instant) -> Option<FaultAction> {
        self.pid = None;
        self.state = ProcState::Stopped;

        if status.success() {
            return None;
        }

        let limit_reached = self
            .last_fault
            .is_some_and(|prev| now.duration_since(prev) < self.config.probation);
        self.last_fault = Some(now);

        if limit_reached {
            tracing::error!(
                proc = %self.config.name,
                "fault limit reached, stopping the app instead of applying '{:?}'",
                self.config.fault_action
            );
            Some(FaultAction::StopApp)
        } else {
            Some(self.config.fault_action)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcConfig;
    use std::time::Duration;

    fn proc_with_action(action: FaultAction) -> Proc {
        let config: ProcConfig = serde_json::from_str(
            r#"{"name": "p", "command": "/bin/true", "probation_ms": 30000}"#,
        )
        .unwrap();
        let mut config = config;
        config.fault_action = action;
        Proc::new(config)
    }

    #[test]
    fn test_clean_exit_is_not_a_fault() {
        let mut proc = proc_with_action(FaultAction::Reboot);
        proc.started(100);
        let action = proc.evaluate_fault(ExitStatus::exited(0), Instant::now());
        assert_eq!(action, None);
        assert_eq!(proc.state(), ProcState::Stopped);
        assert_eq!(proc.pid(), None);
    }

    #[test]
    fn test_fault_uses_configured_action() {
        let mut proc = proc_with_action(FaultAction::Restart);
        proc.started(100);
        let action = proc.evaluate_fault(ExitStatus::exited(1), Instant::now());
        assert_eq!(action, Some(FaultAction::Restart));
    }

    #[test]
    fn test_signal_death_is_a_fault() {
        let mut proc = proc_with_action(FaultAction::RestartApp);
        proc.started(100);
        let action = proc.evaluate_fault(ExitStatus::signaled(11), Instant::now());
        assert_eq!(action, Some(FaultAction::RestartApp));
    }

    #[test]
    fn test_two_faults_inside_probation_force_stop_app() {
        let mut proc = proc_with_action(FaultAction::Restart);
        let t0 = Instant::now();

        proc.started(100);
        assert_eq!(
            proc.evaluate_fault(ExitStatus::exited(1), t0),
            Some(FaultAction::Restart)
        );

        proc.started(101);
        assert_eq!(
            proc.evaluate_fault(ExitStatus::exited(1), t0 + Duration::from_secs(5)),
            Some(FaultAction::StopApp)
        );
    }

    #[test]
    fn test_probation_survived_resets_fault_history() {
        let mut proc = proc_with_action(FaultAction::Restart);
        let t0 = Instant::now();

        proc.started(100);
        proc.evaluate_fault(ExitStatus::exited(1), t0);

        // The restarted process stayed alive past probation, so the next
        // fault is treated as a first fault again.
        proc.started(101);
        assert_eq!(
            proc.evaluate_fault(ExitStatus::exited(1), t0 + Duration::from_secs(31)),
            Some(FaultAction::Restart)
        );
    }

    #[test]
    fn test_overrides_and_reversion() {
        let mut proc = proc_with_action(FaultAction::Ignore);
        assert!(proc.effective_run());
        assert!(!proc.effective_debug());

        proc.set_run_override(false);
        proc.set_debug_override(true);
        assert!(!proc.effective_run());
        assert!(proc.effective_debug());

        proc.clear_overrides();
        assert!(proc.effective_run());
        assert!(!proc.effective_debug());
    }
}
