use serde::{Deserialize, Serialize};

/// Recovery policy applied when a managed process terminates abnormally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultAction {
    /// Leave the process stopped; the rest of the app keeps running.
    #[serde(rename = "ignore")]
    Ignore,
    /// Restart only the faulted process.
    #[serde(rename = "restart")]
    Restart,
    /// Stop the whole app, then start it again.
    #[serde(rename = "restartApp")]
    RestartApp,
    /// Stop the whole app and leave it inactive.
    #[serde(rename = "stopApp")]
    StopApp,
    /// The device is not usable without this process.
    #[serde(rename = "reboot")]
    Reboot,
}

/// Policy applied when the external watchdog reports a process as hung.
///
/// Same closed set as [`FaultAction`] with the addition of `handled`, which
/// means a lower layer already dealt with the expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchdogAction {
    #[serde(rename = "handled")]
    Handled,
    #[serde(untagged)]
    Fault(FaultAction),
}

/// How a child process terminated, as reported by the reaper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    code: Option<i32>,
    signal: Option<i32>,
}

impl ExitStatus {
    pub fn exited(code: i32) -> Self {
        Self { code: Some(code), signal: None }
    }

    pub fn signaled(signal: i32) -> Self {
        Self { code: None, signal: Some(signal) }
    }

    /// Only a normal exit with code 0 is a non-fault.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn code(&self) -> Option<i32> {
        self.code
    }

    pub fn signal(&self) -> Option<i32> {
        self.signal
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exited with code {code}"),
            (None, Some(sig)) => write!(f, "killed by signal {sig}"),
            (None, None) => write!(f, "terminated for an unknown reason"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_status_classification() {
        assert!(ExitStatus::exited(0).success());
        assert!(!ExitStatus::exited(1).success());
        assert!(!ExitStatus::signaled(9).success());
        assert_eq!(ExitStatus::signaled(15).signal(), Some(15));
        assert_eq!(ExitStatus::exited(2).code(), Some(2));
    }

    #[test]
    fn test_fault_action_wire_names() {
        let json = |a: FaultAction| serde_json::to_string(&a).unwrap();
        assert_eq!(json(FaultAction::Ignore), "\"ignore\"");
        assert_eq!(json(FaultAction::RestartApp), "\"restartApp\"");
        assert_eq!(json(FaultAction::StopApp), "\"stopApp\"");

        let parsed: FaultAction = serde_json::from_str("\"reboot\"").unwrap();
        assert_eq!(parsed, FaultAction::Reboot);
    }

    #[test]
    fn test_watchdog_action_shares_fault_set() {
        let parsed: WatchdogAction = serde_json::from_str("\"handled\"").unwrap();
        assert_eq!(parsed, WatchdogAction::Handled);

        let parsed: WatchdogAction = serde_json::from_str("\"restartApp\"").unwrap();
        assert_eq!(parsed, WatchdogAction::Fault(FaultAction::RestartApp));
    }
}
