use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "appvisor")]
#[command(about = "Application supervisor for embedded Linux devices", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Control socket of the supervisor daemon
    #[arg(short, long, global = true)]
    pub socket: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start an installed application
    Start(AppArgs),

    /// Stop a running application
    Stop(AppArgs),

    /// Restart an application
    Restart(AppArgs),

    /// Remove an application's runtime state (the installer removes the payload)
    Remove(AppArgs),

    /// List installed applications and their states
    List,

    /// Show the state of one application
    Status(StatusArgs),

    /// Show per-process details of one application
    Info(StatusArgs),

    /// Show the supervisor version
    Version,

    /// Run a single process inside an application
    RunProc(RunProcArgs),

    /// Stop the whole framework (all apps, then all framework daemons)
    StopDaemon,

    /// Restart the whole framework
    RestartDaemon(RestartDaemonArgs),

    /// Run the supervisor daemon (internal use)
    #[command(hide = true)]
    Supervisor(SupervisorArgs),
}

#[derive(Parser)]
pub struct AppArgs {
    /// Application name
    pub name: String,
}

#[derive(Parser)]
pub struct StatusArgs {
    /// Application name
    pub name: String,

    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

#[derive(Parser)]
pub struct RunProcArgs {
    /// Application to run the process in
    pub app: String,

    /// Configured process name to run (or the name for an ad-hoc process)
    #[arg(short, long)]
    pub proc: Option<String>,

    /// Executable path (required unless --proc names a configured process)
    #[arg(short, long)]
    pub exec: Option<String>,

    /// Arguments passed to the executable
    #[arg(last = true)]
    pub args: Vec<String>,
}

#[derive(Parser)]
pub struct RestartDaemonArgs {
    /// Mark the restart as administrator-driven (distinct exit code)
    #[arg(long)]
    pub manual: bool,
}

#[derive(Parser)]
pub struct SupervisorArgs {
    /// Config file path
    #[arg(short, long, default_value = "/etc/appvisor/config.json")]
    pub config: PathBuf,

    /// Whether to start apps marked for automatic start ("auto" or "none")
    #[arg(short = 'a', long, default_value = "auto")]
    pub start_apps: String,

    /// Stay attached to the controlling terminal and parent process
    #[arg(short, long)]
    pub no_daemonize: bool,
}
