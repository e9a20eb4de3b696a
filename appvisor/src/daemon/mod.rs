//! The supervisor kernel.
//!
//! Everything here runs on one task of a current-thread runtime: registry
//! lists, app state machines, pending replies and override maps are all
//! owned by [`Supervisor`] and mutated only between `select!` arms. The only
//! deliberate blocking points are the per-daemon ready barriers during
//! startup and the single-instance lock; all other I/O is non-blocking.

pub mod apps;
pub mod daemons;
pub mod rpc;

use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;
use std::time::Duration;

use nix::fcntl::{Flock, FlockArg};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use appvisor_core::fault::FaultAction;
use appvisor_core::registry::Registry;
use appvisor_core::{ConfigStore, ConfigWatcher, ExitStatus, InstallEvent};
use appvisor_ipc::{IpcServer, Response, ResultCode};
use appvisor_sys::{CgroupDriver, KillTimers, StopNotifier, reaper};

use self::daemons::{DaemonExit, DaemonSet, ShutdownPhase};

/// Exit codes understood by the outer starter.
pub const EXIT_STOPPED: i32 = 0;
pub const EXIT_FATAL: i32 = 1;
pub const EXIT_RESTART: i32 = 2;
pub const EXIT_RESTART_MANUAL: i32 = 3;

/// If the framework daemons are not all up within this window the system is
/// unworkable.
const STARTUP_WATCHDOG: Duration = Duration::from_secs(30);

/// Interval between stop-completion rechecks while SIGCHLD handling catches
/// up with an emptied freezer cgroup.
pub(crate) const STOP_RECHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Recheck budget per app; exhausting it means the cgroup notification
/// machinery is broken and the system cannot be trusted.
pub(crate) const MAX_STOP_RETRIES: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppStartMode {
    Auto,
    None,
}

#[derive(Debug, Clone)]
pub struct DaemonArgs {
    pub config: PathBuf,
    pub start_apps: AppStartMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Starting,
    Normal,
    Stopping,
    Restarting,
    RestartingManual,
}

/// Messages feeding the kernel's event loop.
pub enum CoreMsg {
    Client(rpc::ClientEvent),
    /// The soft-kill deadline for a stop cycle expired.
    StopDeadline { app: String, seq: u64 },
    /// Re-check whether a stop can be declared complete.
    RecheckStop { app: String },
}

pub struct Supervisor {
    state: State,
    start_mode: AppStartMode,
    store: ConfigStore,
    watcher: ConfigWatcher,
    registry: Registry,
    cgroups: CgroupDriver,
    kill: KillTimers,
    daemons: DaemonSet,
    /// Reply sinks for in-flight Stop/Restart/Remove requests, per app.
    pending_stop_replies: HashMap<String, rpc::ReplySink>,
    /// Output sinks for client-run processes, keyed by (app, proc).
    run_proc_sinks: HashMap<(String, String), rpc::ReplySink>,
    /// Actions forced by watchdog expiry for PIDs we killed ourselves.
    watchdog_kills: HashMap<i32, FaultAction>,
    shutdown_reply: Option<rpc::ReplySink>,
    msg_tx: mpsc::Sender<CoreMsg>,
}

pub async fn run(args: DaemonArgs, readiness: Option<OwnedFd>) -> anyhow::Result<()> {
    let store = ConfigStore::load(&args.config)?;
    let watcher = ConfigWatcher::new(&args.config)?;
    let daemon_cfg = store.daemon().clone();

    std::fs::create_dir_all(&daemon_cfg.runtime_dir)?;

    let lock_file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(daemon_cfg.lock_file())?;
    let _instance_lock = match Flock::lock(lock_file, FlockArg::LockExclusiveNonblock) {
        Ok(lock) => lock,
        Err((_, e)) => {
            anyhow::bail!("another supervisor instance is already running ({e})");
        }
    };

    // Orphaned grand-descendants reparent here instead of to init, so every
    // SIGCHLD for a managed process arrives at this one dispatch point.
    nix::sys::prctl::set_child_subreaper(true)?;

    // Registered before the first child is forked so no exit can be missed.
    let mut sigchld = signal(SignalKind::child())?;

    let agent_path = std::env::current_exe()?.with_file_name("appvisor-stop-agent");
    let cgroups = CgroupDriver::new(&daemon_cfg.cgroup_root);
    cgroups.init(&agent_path)?;

    let notifier = StopNotifier::bind(daemon_cfg.stop_socket())?;

    let (msg_tx, mut msg_rx) = mpsc::channel(1024);

    let mut sup = Supervisor {
        state: State::Starting,
        start_mode: args.start_apps,
        store,
        watcher,
        registry: Registry::new(),
        cgroups,
        kill: KillTimers::new(),
        daemons: DaemonSet::new(&daemon_cfg.framework_daemons),
        pending_stop_replies: HashMap::new(),
        run_proc_sinks: HashMap::new(),
        watchdog_kills: HashMap::new(),
        shutdown_reply: None,
        msg_tx,
    };

    match tokio::time::timeout(STARTUP_WATCHDOG, sup.daemons.start_all()).await {
        Ok(Ok(())) => info!("all framework daemons ready"),
        Ok(Err(e)) => sup.fatal(format!("framework daemon startup failed: {e}")),
        Err(_) => sup.fatal("framework daemon startup timed out"),
    }

    let server = IpcServer::bind(daemon_cfg.ctrl_socket())?;
    tokio::spawn(rpc::serve(server, sup.msg_tx.clone()));

    sup.state = State::Normal;

    if sup.start_mode == AppStartMode::Auto {
        info!("auto-starting apps");
        sup.auto_start();
    } else {
        info!("skipping app auto-start");
    }

    // Closing stdin tells whatever launched us that the framework is up.
    signal_ready(readiness);

    let mut config_timer =
        tokio::time::interval(Duration::from_secs(daemon_cfg.config_poll_secs.max(1)));
    config_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    config_timer.tick().await;

    loop {
        tokio::select! {
            _ = sigchld.recv() => sup.handle_sigchld(),

            result = notifier.recv() => match result {
                Ok(Some(name)) => sup.on_stop_notification(&name),
                Ok(None) => {}
                Err(e) => warn!("stop notifier receive failed: {e}"),
            },

            Some(msg) = msg_rx.recv() => sup.handle_msg(msg),

            _ = config_timer.tick() => sup.check_config_reload(),
        }
    }
}

impl Supervisor {
    fn handle_msg(&mut self, msg: CoreMsg) {
        match msg {
            CoreMsg::Client(rpc::ClientEvent::Request { session, op, reply }) => {
                self.dispatch(session, op, reply);
            }
            CoreMsg::Client(rpc::ClientEvent::Disconnected { session }) => {
                self.drop_session(session);
            }
            CoreMsg::StopDeadline { app, seq } => self.on_stop_deadline(&app, seq),
            CoreMsg::RecheckStop { app } => self.on_stop_recheck(&app),
        }
    }

    /// Drains every waitable child and routes each to exactly one owner:
    /// app fault evaluation, the framework-daemon shutdown cursor, or the
    /// unknown-child log.
    fn handle_sigchld(&mut self) {
        loop {
            let pid = match reaper::peek_any_child() {
                Ok(Some(pid)) => pid,
                Ok(None) => break,
                Err(e) => self.fatal(format!("wait peek failed: {e}")),
            };

            if let Some(app) = self.registry.app_owning_pid(pid).map(str::to_string) {
                let status = self.reap(pid);
                self.kill.died(pid);
                self.handle_proc_exit(&app, pid, status);
            } else if self.daemons.owns(pid) {
                let status = self.reap(pid);
                self.kill.died(pid);
                match self.daemons.handle_exit(pid, &mut self.kill) {
                    DaemonExit::ShuttingDown(phase) => self.on_daemon_shutdown_phase(phase),
                    DaemonExit::Unexpected => {
                        error!("framework daemon died unexpectedly ({status})");
                        self.capture_debug_data();
                        self.fatal("framework daemon failure, system is unworkable");
                    }
                }
            } else {
                // Not ours, but the sub-reaper contract makes it our zombie.
                let _ = reaper::reap_child(pid);
                self.kill.died(pid);
                error!("reaped unknown child process {pid}");
            }
        }
    }

    fn reap(&mut self, pid: i32) -> ExitStatus {
        match reaper::reap_child(pid) {
            Ok(status) => status,
            Err(e) => self.fatal(format!("{e}")),
        }
    }

    fn on_daemon_shutdown_phase(&mut self, phase: ShutdownPhase) {
        match phase {
            ShutdownPhase::Advanced => {}
            // The service directory is still alive at this point, so the
            // reply can reach the requesting client.
            ShutdownPhase::Intermediate => self.send_shutdown_reply(),
            ShutdownPhase::Complete => {
                self.send_shutdown_reply();
                self.finish_shutdown();
            }
        }
    }

    fn send_shutdown_reply(&mut self) {
        if let Some(sink) = self.shutdown_reply.take() {
            sink.send(Response::Done { code: ResultCode::Ok });
        }
    }

    fn finish_shutdown(&mut self) {
        let code = match self.state {
            State::Stopping => {
                info!("framework shut down");
                EXIT_STOPPED
            }
            State::Restarting => {
                info!("framework shut down complete, restarting");
                EXIT_RESTART
            }
            State::RestartingManual => {
                info!("framework manual shut down complete, restarting");
                EXIT_RESTART_MANUAL
            }
            state => {
                error!("shutdown completed in unexpected state {state:?}");
                EXIT_FATAL
            }
        };

        // A controlled shutdown is not a failed boot attempt.
        self.decrement_try_count();

        // Leave the loop running briefly so queued replies flush before the
        // process goes away.
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            std::process::exit(code);
        });
    }

    /// Backs one boot attempt out of the persisted status counter.
    fn decrement_try_count(&self) {
        let path = self.store.daemon().try_count_file();
        match std::fs::read_to_string(&path) {
            Ok(raw) => match raw.trim().parse::<u64>() {
                Ok(count) if count > 0 => {
                    if let Err(e) = std::fs::write(&path, (count - 1).to_string()) {
                        warn!("could not update try count: {e}");
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("unparseable try count file: {e}"),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no try count file to decrement");
            }
            Err(e) => warn!("could not read try count file: {e}"),
        }
    }

    fn check_config_reload(&mut self) {
        let events = match self.watcher.check_reload(&mut self.store) {
            Ok(events) => events,
            Err(e) => {
                warn!("config reload failed: {e}");
                return;
            }
        };

        for event in events {
            match event {
                InstallEvent::Removed(name) => {
                    if self.registry.is_active(&name) {
                        // The installer is expected to stop apps before
                        // removing them.
                        warn!("app '{name}' was uninstalled while running");
                    } else if self.registry.remove_inactive(&name).is_some() {
                        info!("dropped container for uninstalled app '{name}'");
                    }
                }
                InstallEvent::Installed(name) => {
                    // Any stale container must be rebuilt from the new
                    // definition on the next start.
                    if self.registry.is_active(&name) {
                        warn!("app '{name}' was reinstalled while running");
                    } else {
                        self.registry.remove_inactive(&name);
                        info!("app '{name}' installed");
                    }
                }
            }
        }
    }

    /// Best-effort log and core snapshot before a reboot escalation.
    fn capture_debug_data(&self) {
        let Some(script) = self.store.daemon().save_logs_script.clone() else {
            return;
        };
        match std::process::Command::new(&script).status() {
            Ok(status) if status.success() => {}
            Ok(status) => error!("save-logs script failed with {status}"),
            Err(e) => error!("could not run save-logs script: {e}"),
        }
    }

    /// Escalate to a device reboot: snapshot diagnostics, then die so the
    /// outer starter reboots.
    pub(crate) fn reboot(&mut self) -> ! {
        self.capture_debug_data();
        self.fatal("supervisor going down to trigger reboot")
    }

    pub(crate) fn fatal(&self, msg: impl std::fmt::Display) -> ! {
        error!("FATAL: {msg}");
        std::process::exit(EXIT_FATAL);
    }
}

fn signal_ready(readiness: Option<OwnedFd>) {
    drop(readiness);

    match std::fs::File::open("/dev/null") {
        Ok(devnull) => {
            if unsafe { libc::dup2(devnull.as_raw_fd(), libc::STDIN_FILENO) } == -1 {
                warn!("could not redirect stdin to /dev/null: {}", std::io::Error::last_os_error());
            }
        }
        Err(e) => warn!("could not open /dev/null: {e}"),
    }
}
