mod cli;
mod commands;
mod common;
mod daemon;

use std::os::fd::OwnedFd;

use clap::Parser;
use nix::errno::Errno;
use nix::unistd::ForkResult;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::daemon::{AppStartMode, DaemonArgs};

fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();
    let socket = cli.socket.clone();

    match cli.command {
        cli::Command::Supervisor(args) => run_supervisor(args),
        command => run_client(socket, command),
    }
}

fn run_client(socket: Option<std::path::PathBuf>, command: cli::Command) -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        match command {
            cli::Command::Start(args) => commands::simple::start(&socket, args).await,
            cli::Command::Stop(args) => commands::simple::stop(&socket, args).await,
            cli::Command::Restart(args) => commands::simple::restart(&socket, args).await,
            cli::Command::Remove(args) => commands::simple::remove(&socket, args).await,
            cli::Command::List => commands::list::execute(&socket).await,
            cli::Command::Status(args) => commands::status::status(&socket, args).await,
            cli::Command::Info(args) => commands::status::info(&socket, args).await,
            cli::Command::Version => commands::status::version(&socket).await,
            cli::Command::RunProc(args) => commands::run_proc::execute(&socket, args).await,
            cli::Command::StopDaemon => commands::ctl::stop_daemon(&socket).await,
            cli::Command::RestartDaemon(args) => {
                commands::ctl::restart_daemon(&socket, args).await
            }
            cli::Command::Supervisor(_) => unreachable!("handled in main"),
        }
    })
}

fn run_supervisor(args: cli::SupervisorArgs) -> anyhow::Result<()> {
    let start_apps = match args.start_apps.as_str() {
        "auto" => AppStartMode::Auto,
        "none" => AppStartMode::None,
        other => anyhow::bail!("invalid --start-apps '{other}', must be 'auto' or 'none'"),
    };

    // Framework-created files must get full permissions regardless of who
    // launched us.
    unsafe { libc::umask(0) };

    // The fork must happen before the runtime exists.
    let readiness = if args.no_daemonize { None } else { Some(daemonize()?) };

    init_daemon_tracing(&args)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(daemon::run(
        DaemonArgs { config: args.config, start_apps },
        readiness,
    ))
}

fn init_daemon_tracing(args: &cli::SupervisorArgs) -> anyhow::Result<()> {
    // The daemon's own log settings come from the config file; RUST_LOG
    // overrides, and APPVISOR_CONSOLE_LOG forces console output for
    // debugging.
    let store = appvisor_core::ConfigStore::load(&args.config)?;
    let log_dir = store.daemon().log_dir.clone();
    let log_level = store.daemon().log_level.clone();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level));

    let force_console = std::env::var("APPVISOR_CONSOLE_LOG").is_ok();
    if args.no_daemonize || force_console {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    } else {
        std::fs::create_dir_all(&log_dir)?;
        let file_appender = tracing_appender::rolling::never(&log_dir, "supervisor.log");
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file_appender)
                    .with_ansi(false),
            )
            .init();
    }
    Ok(())
}

/// Detaches from the controlling terminal. The parent blocks until the
/// child closes the returned pipe end (which the kernel does at readiness),
/// so whatever launched us can sequence on a fully started framework.
fn daemonize() -> anyhow::Result<OwnedFd> {
    let (read, write) = nix::unistd::pipe()?;

    match unsafe { nix::unistd::fork() }? {
        ForkResult::Parent { .. } => {
            drop(write);
            let mut buf = [0u8; 1];
            loop {
                match nix::unistd::read(&read, &mut buf) {
                    Ok(0) => std::process::exit(0),
                    Ok(_) => continue,
                    Err(Errno::EINTR) => continue,
                    Err(_) => std::process::exit(1),
                }
            }
        }
        ForkResult::Child => {
            drop(read);
            nix::unistd::setsid()?;
            Ok(write)
        }
    }
}
