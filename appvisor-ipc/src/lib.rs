mod unix;

pub use unix::{IpcClient, IpcConnection, IpcServer, RequestStream, ResponseSink};

use serde::{Deserialize, Serialize};
use std::time::Duration;

use appvisor_core::fault::{ExitStatus, FaultAction};

/// Client operations wait this long for a reply; stop and restart replies
/// arrive only when the state transition completes.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on a single framed message.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Control-plane operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    Start { app: String },
    Stop { app: String },
    Restart { app: String },
    Remove { app: String },
    List,
    Status { app: String },
    Info { app: String },
    Version,
    GetHandle { app: String },
    ReleaseHandle { handle: u64 },
    SetRun { handle: u64, proc: String, run: bool },
    SetDebug { handle: u64, proc: String, debug: bool },
    Import { handle: u64, path: String },
    SetDevicePerm { handle: u64, path: String, perm: String },
    RunProc { app: String, proc: Option<String>, exec: Option<String>, args: Vec<String> },
    WatchdogKicked { pid: i32 },
    StopDaemon,
    RestartDaemon { manual: bool },
}

/// Closed result-code set shared by every operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultCode {
    Ok,
    AlreadyRunning,
    NotRunning,
    NotInstalled,
    Duplicate,
    BadParameter,
    NotFound,
    Failed,
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ResultCode::Ok => "OK",
            ResultCode::AlreadyRunning => "already running",
            ResultCode::NotRunning => "not running",
            ResultCode::NotInstalled => "not installed",
            ResultCode::Duplicate => "duplicate",
            ResultCode::BadParameter => "bad parameter",
            ResultCode::NotFound => "not found",
            ResultCode::Failed => "failed",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppStateKind {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcStateKind {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSummary {
    pub name: String,
    pub state: AppStateKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcInfo {
    pub name: String,
    pub pid: Option<i32>,
    pub state: ProcStateKind,
    pub fault_action: FaultAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppInfo {
    pub name: String,
    pub sandboxed: bool,
    pub state: AppStateKind,
    pub procs: Vec<ProcInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StdStream {
    Stdout,
    Stderr,
}

/// Replies and events. Most requests get exactly one reply; `RunProc` also
/// streams `ProcOutput` events and finishes with `ProcExited`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Done { code: ResultCode },
    Handle { code: ResultCode, handle: Option<u64> },
    List { apps: Vec<AppSummary> },
    Status { code: ResultCode, state: Option<AppStateKind> },
    Info { code: ResultCode, info: Option<AppInfo> },
    Version { version: String },
    ProcOutput { stream: StdStream, line: String },
    ProcExited { status: ExitStatus },
}
