pub mod app;
pub mod config;
pub mod error;
pub mod fault;
pub mod process;
pub mod registry;

pub use app::{App, AppState, StopDisposition};
pub use config::{
    AppConfig, ConfigStore, ConfigWatcher, DaemonConfig, InstallEvent, PriorityClass, ProcConfig,
    ProcLimits, StartMode, SystemConfig,
};
pub use error::{Error, Result};
pub use fault::{ExitStatus, FaultAction, WatchdogAction};
pub use process::{Proc, ProcState};
pub use registry::{HandleId, Registry, SessionId};

/// Checks that a name received from a client is usable as an app or process
/// name: non-empty and free of path separators, since names become cgroup
/// directory names.
pub fn is_name_valid(name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && name != "." && name != ".."
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_validation() {
        assert!(is_name_valid("echo"));
        assert!(is_name_valid("my-app_2"));
        assert!(!is_name_valid(""));
        assert!(!is_name_valid("a/b"));
        assert!(!is_name_valid("."));
        assert!(!is_name_valid(".."));
    }
}
