use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::fault::{FaultAction, WatchdogAction};

/// Scheduling class for a configured process.
///
/// `Idle`..`High` map to nice levels; `Rt(n)` is SCHED_RR with realtime
/// priority `n` (1..=32). Realtime processes are exempt from the cpu cgroup
/// so they are never throttled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityClass {
    Idle,
    Low,
    Medium,
    High,
    Rt(u8),
}

impl PriorityClass {
    pub fn is_realtime(&self) -> bool {
        matches!(self, Self::Rt(_))
    }

    /// Nice level for non-realtime classes.
    pub fn nice(&self) -> Option<i32> {
        match self {
            Self::Idle => Some(19),
            Self::Low => Some(10),
            Self::Medium => Some(0),
            Self::High => Some(-10),
            Self::Rt(_) => None,
        }
    }

    /// SCHED_RR priority for realtime classes.
    pub fn rt_priority(&self) -> Option<i32> {
        match self {
            Self::Rt(n) => Some(i32::from(*n)),
            _ => None,
        }
    }
}

impl FromStr for PriorityClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            _ => {
                let n = s
                    .strip_prefix("rt")
                    .and_then(|n| n.parse::<u8>().ok())
                    .filter(|n| (1..=32).contains(n))
                    .ok_or_else(|| format!("unknown priority class '{s}'"))?;
                Ok(Self::Rt(n))
            }
        }
    }
}

impl std::fmt::Display for PriorityClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Rt(n) => write!(f, "rt{n}"),
        }
    }
}

impl Serialize for PriorityClass {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PriorityClass {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The eight per-process rlimits. Soft and hard limits are set equal.
///
/// Defaults match what the installer writes for an app with no explicit
/// limits section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcLimits {
    pub max_core_dump_bytes: u64,
    pub max_file_bytes: u64,
    pub max_locked_memory_bytes: u64,
    pub max_file_descriptors: u64,
    /// 0 means "leave the OS default".
    pub max_stack_bytes: u64,
    pub max_mqueue_bytes: u64,
    pub max_threads: u64,
    pub max_queued_signals: u64,
}

impl Default for ProcLimits {
    fn default() -> Self {
        Self {
            max_core_dump_bytes: 8 * 1024,
            max_file_bytes: 90 * 1024,
            max_locked_memory_bytes: 8 * 1024,
            max_file_descriptors: 256,
            max_stack_bytes: 0,
            max_mqueue_bytes: 512,
            max_threads: 20,
            max_queued_signals: 100,
        }
    }
}

/// A configured process within an app.
#[derive(Debug, Clone, Serialize)]
pub struct ProcConfig {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub priority: PriorityClass,
    pub fault_action: FaultAction,
    pub watchdog_action: WatchdogAction,
    pub run: bool,
    pub debug: bool,
    pub probation: Duration,
    pub limits: ProcLimits,
}

// Raw deserialization struct so missing fields pick up documented defaults
// and `command` strings can carry their own arguments.
#[derive(Debug, Deserialize)]
struct ProcConfigRaw {
    name: String,
    command: String,
    args: Option<Vec<String>>,
    env: Option<HashMap<String, String>>,
    priority: Option<PriorityClass>,
    fault_action: Option<FaultAction>,
    watchdog_action: Option<WatchdogAction>,
    run: Option<bool>,
    debug: Option<bool>,
    probation_ms: Option<u64>,
    limits: Option<ProcLimits>,
}

impl<'de> Deserialize<'de> for ProcConfig {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        ProcConfigRaw::deserialize(deserializer).map(Into::into)
    }
}

impl From<ProcConfigRaw> for ProcConfig {
    fn from(raw: ProcConfigRaw) -> Self {
        // If args weren't provided, split them out of the command string.
        let (command, args) = if let Some(args) = raw.args {
            (raw.command, args)
        } else {
            match shell_words::split(&raw.command) {
                Ok(parts) if !parts.is_empty() => {
                    let command = parts[0].clone();
                    let args = parts.into_iter().skip(1).collect();
                    (command, args)
                }
                _ => (raw.command, Vec::new()),
            }
        };

        ProcConfig {
            name: raw.name,
            command,
            args,
            env: raw.env.unwrap_or_default(),
            priority: raw.priority.unwrap_or(PriorityClass::Medium),
            fault_action: raw.fault_action.unwrap_or(FaultAction::Ignore),
            watchdog_action: raw
                .watchdog_action
                .unwrap_or(WatchdogAction::Fault(FaultAction::Restart)),
            run: raw.run.unwrap_or(true),
            debug: raw.debug.unwrap_or(false),
            probation: Duration::from_millis(raw.probation_ms.unwrap_or(30_000)),
            limits: raw.limits.unwrap_or_default(),
        }
    }
}

/// Whether an installed app starts with the framework or only on request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartMode {
    #[serde(rename = "auto")]
    Auto,
    #[serde(rename = "manual")]
    Manual,
}

/// An installed application definition.
#[derive(Debug, Clone, Serialize)]
pub struct AppConfig {
    pub name: String,
    pub sandboxed: bool,
    pub start: StartMode,
    /// Relative cpu weight for the app's cpu cgroup.
    pub cpu_share: u64,
    /// Limit for the app's memory cgroup, in bytes.
    pub max_memory_bytes: u64,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub groups: Vec<u32>,
    pub procs: Vec<ProcConfig>,
}

pub const DEFAULT_CPU_SHARE: u64 = 1024;
pub const DEFAULT_MAX_MEMORY_BYTES: u64 = 40_960_000;

#[derive(Debug, Deserialize)]
struct AppConfigRaw {
    name: String,
    sandboxed: Option<bool>,
    start: Option<StartMode>,
    cpu_share: Option<u64>,
    max_memory_bytes: Option<u64>,
    uid: Option<u32>,
    gid: Option<u32>,
    groups: Option<Vec<u32>>,
    #[serde(default)]
    procs: Vec<ProcConfig>,
}

impl<'de> Deserialize<'de> for AppConfig {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        AppConfigRaw::deserialize(deserializer).map(Into::into)
    }
}

impl From<AppConfigRaw> for AppConfig {
    fn from(raw: AppConfigRaw) -> Self {
        AppConfig {
            name: raw.name,
            sandboxed: raw.sandboxed.unwrap_or(true),
            start: raw.start.unwrap_or(StartMode::Auto),
            cpu_share: raw.cpu_share.unwrap_or(DEFAULT_CPU_SHARE),
            max_memory_bytes: raw.max_memory_bytes.unwrap_or(DEFAULT_MAX_MEMORY_BYTES),
            uid: raw.uid,
            gid: raw.gid,
            groups: raw.groups.unwrap_or_default(),
            procs: raw.procs,
        }
    }
}

/// Daemon-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub runtime_dir: PathBuf,
    pub cgroup_root: PathBuf,
    pub log_dir: PathBuf,
    pub log_level: String,
    /// Auxiliary daemons started before any app, in this order, and stopped
    /// in reverse order.
    pub framework_daemons: Vec<PathBuf>,
    /// Script run to snapshot logs and cores before a reboot escalation.
    pub save_logs_script: Option<PathBuf>,
    /// How often the config file is re-checksummed for install changes.
    pub config_poll_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            runtime_dir: PathBuf::from("/run/appvisor"),
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            log_dir: PathBuf::from("/var/log/appvisor"),
            log_level: "info".to_string(),
            framework_daemons: Vec::new(),
            save_logs_script: None,
            config_poll_secs: 5,
        }
    }
}

impl DaemonConfig {
    pub fn lock_file(&self) -> PathBuf {
        self.runtime_dir.join("supervisor.lock")
    }

    pub fn ctrl_socket(&self) -> PathBuf {
        self.runtime_dir.join("ctrl.sock")
    }

    pub fn stop_socket(&self) -> PathBuf {
        self.runtime_dir.join("app-stop.sock")
    }

    pub fn try_count_file(&self) -> PathBuf {
        self.runtime_dir.join("try-count")
    }
}

/// The whole configuration tree, as this supervisor sees it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub apps: Vec<AppConfig>,
}

/// Read-only view over the loaded configuration. Reads are short-lived; the
/// store is re-read only through [`ConfigWatcher`].
#[derive(Debug, Clone)]
pub struct ConfigStore {
    config: SystemConfig,
}

impl ConfigStore {
    pub fn load(path: impl AsRef<Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: SystemConfig = serde_json::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("failed to parse config: {e}")))?;
        Ok(Self { config })
    }

    pub fn from_config(config: SystemConfig) -> Self {
        Self { config }
    }

    pub fn daemon(&self) -> &DaemonConfig {
        &self.config.daemon
    }

    pub fn app(&self, name: &str) -> Option<&AppConfig> {
        self.config.apps.iter().find(|a| a.name == name)
    }

    pub fn apps(&self) -> &[AppConfig] {
        &self.config.apps
    }

    pub fn auto_start_names(&self) -> Vec<String> {
        self.config
            .apps
            .iter()
            .filter(|a| a.start == StartMode::Auto)
            .map(|a| a.name.clone())
            .collect()
    }
}

/// A change to the installed-app set, derived from a config reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallEvent {
    Installed(String),
    Removed(String),
}

/// Detects config-file changes by checksum and reports which apps were
/// installed or removed, standing in for the external installer's
/// notifications.
pub struct ConfigWatcher {
    path: PathBuf,
    checksum: Vec<u8>,
}

impl ConfigWatcher {
    pub fn new(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let checksum = Self::compute_checksum(&path)?;
        Ok(Self { path, checksum })
    }

    fn compute_checksum(path: &Path) -> crate::Result<Vec<u8>> {
        let content = std::fs::read(path)?;
        let mut hasher = Sha256::new();
        hasher.update(&content);
        Ok(hasher.finalize().to_vec())
    }

    /// Re-checksum the file. On change, reload it, swap the store and return
    /// the install/remove events relative to the previous app set.
    pub fn check_reload(&mut self, store: &mut ConfigStore) -> crate::Result<Vec<InstallEvent>> {
        let new_checksum = Self::compute_checksum(&self.path)?;
        if new_checksum == self.checksum {
            return Ok(Vec::new());
        }

        let new_store = ConfigStore::load(&self.path)?;
        let events = diff_app_sets(store, &new_store);
        self.checksum = new_checksum;
        *store = new_store;
        Ok(events)
    }
}

fn diff_app_sets(old: &ConfigStore, new: &ConfigStore) -> Vec<InstallEvent> {
    let old_names: HashSet<&str> = old.apps().iter().map(|a| a.name.as_str()).collect();
    let new_names: HashSet<&str> = new.apps().iter().map(|a| a.name.as_str()).collect();

    let mut events = Vec::new();
    for name in old_names.difference(&new_names) {
        events.push(InstallEvent::Removed((*name).to_string()));
    }
    for name in new_names.difference(&old_names) {
        events.push(InstallEvent::Installed((*name).to_string()));
    }
    events
}
