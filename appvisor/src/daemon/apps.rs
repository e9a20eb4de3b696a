//! Application lifecycle sequencing: launch, fault dispatch, asynchronous
//! stop with the freezer-cgroup completion oracle, client overrides and
//! injected processes.

use std::path::Path;
use std::time::Instant;

use nix::sys::signal::Signal;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};

use appvisor_core::app::{App, AppState, StopDisposition};
use appvisor_core::config::ProcConfig;
use appvisor_core::fault::{FaultAction, WatchdogAction};
use appvisor_core::process::{Proc, ProcState};
use appvisor_core::registry::{HandleId, SessionId};
use appvisor_core::{Error, ExitStatus, is_name_valid};
use appvisor_ipc::{
    AppInfo, AppStateKind, AppSummary, ProcInfo, ProcStateKind, Request, Response, ResultCode,
    StdStream,
};
use appvisor_sys::{LaunchSpec, SOFT_KILL_TIMEOUT, Subsystem, launch};

use super::rpc::ReplySink;
use super::{CoreMsg, MAX_STOP_RETRIES, STOP_RECHECK_INTERVAL, State, Supervisor};

impl Supervisor {
    pub(crate) fn dispatch(&mut self, session: SessionId, op: Request, reply: ReplySink) {
        // App mutations would race the shutdown chain's stop dispositions.
        if self.state != State::Normal
            && matches!(
                op,
                Request::Start { .. }
                    | Request::Stop { .. }
                    | Request::Restart { .. }
                    | Request::Remove { .. }
                    | Request::RunProc { .. }
            )
        {
            warn!("refusing app operation in state {:?}", self.state);
            reply.send(Response::Done { code: ResultCode::Failed });
            return;
        }

        match op {
            Request::Start { app } => {
                let code = self.launch_app(&app);
                reply.send(Response::Done { code });
            }

            Request::Stop { app } => {
                if !is_name_valid(&app) {
                    reply.send(Response::Done { code: ResultCode::BadParameter });
                } else if !self.registry.is_active(&app) {
                    warn!("app '{app}' is not running and cannot be stopped");
                    reply.send(Response::Done { code: ResultCode::NotRunning });
                } else {
                    // The reply goes out from stop_complete, not from here.
                    self.pending_stop_replies.insert(app.clone(), reply);
                    self.stop_app(&app, Some(StopDisposition::Reply));
                }
            }

            Request::Restart { app } => {
                if !is_name_valid(&app) {
                    reply.send(Response::Done { code: ResultCode::BadParameter });
                } else if self.registry.is_active(&app) {
                    self.pending_stop_replies.insert(app.clone(), reply);
                    self.stop_app(&app, Some(StopDisposition::Restart));
                } else {
                    let code = self.launch_app(&app);
                    reply.send(Response::Done { code });
                }
            }

            Request::Remove { app } => {
                if !is_name_valid(&app) {
                    reply.send(Response::Done { code: ResultCode::BadParameter });
                } else if self.registry.is_active(&app) {
                    self.pending_stop_replies.insert(app.clone(), reply);
                    self.stop_app(&app, Some(StopDisposition::Remove));
                } else if self.store.app(&app).is_none() && self.registry.app(&app).is_none() {
                    reply.send(Response::Done { code: ResultCode::NotInstalled });
                } else {
                    // Payload removal belongs to the installer; this only
                    // drops the runtime container.
                    self.registry.remove_inactive(&app);
                    reply.send(Response::Done { code: ResultCode::Ok });
                }
            }

            Request::List => reply.send(self.list_apps()),
            Request::Status { app } => reply.send(self.app_status(&app)),
            Request::Info { app } => reply.send(self.app_info(&app)),
            Request::Version => reply.send(Response::Version {
                version: env!("CARGO_PKG_VERSION").to_string(),
            }),

            Request::GetHandle { app } => {
                if !is_name_valid(&app) {
                    reply.send(Response::Handle { code: ResultCode::BadParameter, handle: None });
                    return;
                }
                match self.registry.create_handle(&self.store, &app, session) {
                    Ok(handle) => reply.send(Response::Handle {
                        code: ResultCode::Ok,
                        handle: Some(handle.0),
                    }),
                    Err(Error::NotInstalled(_)) => {
                        reply.send(Response::Handle { code: ResultCode::NotInstalled, handle: None });
                    }
                    Err(Error::AlreadyReferenced(_)) => {
                        reply.send(Response::Handle { code: ResultCode::Duplicate, handle: None });
                    }
                    Err(e) => {
                        error!("could not create handle for '{app}': {e}");
                        reply.send(Response::Handle { code: ResultCode::Failed, handle: None });
                    }
                }
            }

            Request::ReleaseHandle { handle } => {
                let code = match self.registry.release_handle(HandleId(handle), session) {
                    Some(_) => ResultCode::Ok,
                    None => ResultCode::NotFound,
                };
                reply.send(Response::Done { code });
            }

            Request::SetRun { handle, proc, run } => {
                let code = self.with_handle_proc(session, handle, &proc, |p| p.set_run_override(run));
                reply.send(Response::Done { code });
            }

            Request::SetDebug { handle, proc, debug } => {
                let code =
                    self.with_handle_proc(session, handle, &proc, |p| p.set_debug_override(debug));
                reply.send(Response::Done { code });
            }

            Request::Import { handle, path } => {
                let code = self.with_handle_app(session, handle, |app| {
                    app.add_import(path.into());
                    ResultCode::Ok
                });
                reply.send(Response::Done { code });
            }

            Request::SetDevicePerm { handle, path, perm } => {
                let code = if matches!(perm.as_str(), "r" | "w" | "rw") {
                    self.with_handle_app(session, handle, |app| {
                        app.add_device_perm(path.into(), perm);
                        ResultCode::Ok
                    })
                } else {
                    ResultCode::BadParameter
                };
                reply.send(Response::Done { code });
            }

            Request::RunProc { app, proc, exec, args } => {
                self.run_proc(session, app, proc, exec, args, reply);
            }

            Request::WatchdogKicked { pid } => {
                // Acknowledge first; the action may tear the caller down.
                reply.send(Response::Done { code: ResultCode::Ok });
                self.watchdog_kicked(pid);
            }

            Request::StopDaemon => self.begin_framework_shutdown(State::Stopping, reply),
            Request::RestartDaemon { manual } => {
                let target = if manual { State::RestartingManual } else { State::Restarting };
                self.begin_framework_shutdown(target, reply);
            }
        }
    }

    // ---- starting ------------------------------------------------------

    pub(crate) fn auto_start(&mut self) {
        for name in self.store.auto_start_names() {
            let code = self.launch_app(&name);
            if code != ResultCode::Ok {
                error!("could not auto-start app '{name}': {code}");
            }
        }
    }

    pub(crate) fn launch_app(&mut self, name: &str) -> ResultCode {
        if !is_name_valid(name) {
            return ResultCode::BadParameter;
        }

        match self.registry.get_or_create(&self.store, name) {
            Ok(_) => {}
            Err(Error::NotInstalled(_)) => {
                error!("app '{name}' is not installed");
                return ResultCode::NotInstalled;
            }
            Err(e) => {
                error!("could not create container for '{name}': {e}");
                return ResultCode::Failed;
            }
        }

        if self.registry.is_active(name) {
            warn!("app '{name}' is already running");
            return ResultCode::AlreadyRunning;
        }

        info!("starting app '{name}'");
        if let Err(e) = self.activate_container(name) {
            error!("could not activate app '{name}': {e}");
            self.registry.deactivate(name);
            return ResultCode::Failed;
        }

        self.start_configured_procs(name)
    }

    /// Creates the app's cgroups, applies its aggregate limits and marks the
    /// container active. Stale groups left by a crashed predecessor are
    /// deleted and re-created.
    fn activate_container(&mut self, name: &str) -> appvisor_core::Result<()> {
        let (cpu_share, max_memory) = {
            let app = self
                .registry
                .app(name)
                .ok_or_else(|| Error::Supervisor(format!("no container for '{name}'")))?;
            (app.config().cpu_share, app.config().max_memory_bytes)
        };

        for subsys in Subsystem::ALL {
            if self.cgroups.create(subsys, name)? == appvisor_sys::Created::AlreadyExists {
                self.cgroups.remove(subsys, name)?;
                self.cgroups.create(subsys, name)?;
            }
        }

        self.cgroups.set_cpu_share(name, cpu_share)?;
        self.cgroups.set_mem_limit(name, max_memory)?;

        let app = self.registry.app_mut(name).unwrap();
        app.set_state(AppState::Running);
        app.stop_cycle_done();
        app.set_disposition(StopDisposition::Deactivate);
        self.registry.activate(name);
        Ok(())
    }

    /// Starts every configured process whose effective run flag is set, in
    /// configuration order within this loop turn.
    fn start_configured_procs(&mut self, name: &str) -> ResultCode {
        let to_start: Vec<String> = self
            .registry
            .app(name)
            .map(|app| {
                app.procs()
                    .filter(|p| !p.is_injected() && p.effective_run())
                    .map(|p| p.name().to_string())
                    .collect()
            })
            .unwrap_or_default();

        for proc_name in to_start {
            if let Err(e) = self.start_proc(name, &proc_name) {
                error!("could not start process '{proc_name}' of app '{name}': {e}");
                if self.handle_spawn_failure(name, &proc_name) {
                    return ResultCode::Failed;
                }
            }
        }
        ResultCode::Ok
    }

    /// Applies the fault policy of a process that failed to spawn. Returns
    /// true when the whole app start has to be abandoned.
    fn handle_spawn_failure(&mut self, app_name: &str, proc_name: &str) -> bool {
        let action = self
            .registry
            .app(app_name)
            .and_then(|app| app.proc(proc_name))
            .map(|p| p.config().fault_action)
            .unwrap_or(FaultAction::Ignore);

        match action {
            FaultAction::Ignore | FaultAction::Restart => false,
            FaultAction::RestartApp => {
                if let Some(app) = self.registry.app_mut(app_name) {
                    app.set_disposition(StopDisposition::Restart);
                }
                self.stop_app(app_name, None);
                true
            }
            FaultAction::StopApp => {
                self.stop_app(app_name, None);
                true
            }
            FaultAction::Reboot => self.reboot(),
        }
    }

    /// Forks and execs one process object and binds it to the app's cgroups.
    /// Realtime processes stay out of the cpu hierarchy so they are never
    /// throttled.
    fn start_proc(&mut self, app_name: &str, proc_name: &str) -> appvisor_core::Result<()> {
        struct LaunchData {
            exec: String,
            args: Vec<String>,
            env: std::collections::HashMap<String, String>,
            priority: appvisor_core::PriorityClass,
            limits: appvisor_core::ProcLimits,
            uid: Option<u32>,
            gid: Option<u32>,
            groups: Vec<u32>,
            debug: bool,
        }

        let data = {
            let app = self
                .registry
                .app(app_name)
                .ok_or_else(|| Error::Supervisor(format!("no container for '{app_name}'")))?;
            let proc = app
                .proc(proc_name)
                .ok_or_else(|| Error::ProcessNotFound(proc_name.to_string()))?;
            let (exec, args) = proc.effective_command();
            LaunchData {
                exec: exec.to_string(),
                args: args.to_vec(),
                env: proc.config().env.clone(),
                priority: proc.config().priority,
                limits: proc.config().limits,
                uid: app.config().uid,
                gid: app.config().gid,
                groups: app.config().groups.clone(),
                debug: proc.effective_debug(),
            }
        };

        let launched = launch(&LaunchSpec {
            exec: &data.exec,
            args: &data.args,
            env: &data.env,
            priority: data.priority,
            limits: &data.limits,
            uid: data.uid,
            gid: data.gid,
            groups: &data.groups,
            debug: data.debug,
        })?;

        let pid = launched.pid;
        self.registry
            .app_mut(app_name)
            .unwrap()
            .proc_mut(proc_name)
            .unwrap()
            .started(pid);

        for subsys in Subsystem::ALL {
            if subsys == Subsystem::Cpu && data.priority.is_realtime() {
                continue;
            }
            match self.cgroups.add_proc(subsys, app_name, pid) {
                Ok(()) => {}
                Err(Error::ProcessNotFound(_)) => {
                    // Died before placement; the exit is already queued.
                    warn!("process '{proc_name}' (pid {pid}) exited before cgroup placement");
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        let sink = self
            .run_proc_sinks
            .get(&(app_name.to_string(), proc_name.to_string()))
            .cloned();
        if let Some(stdout) = launched.stdout {
            forward_output(app_name, proc_name, StdStream::Stdout, stdout, sink.clone());
        }
        if let Some(stderr) = launched.stderr {
            forward_output(app_name, proc_name, StdStream::Stderr, stderr, sink);
        }

        info!("started process '{proc_name}' of app '{app_name}' with pid {pid}");
        Ok(())
    }

    // ---- fault handling ------------------------------------------------

    /// Routes a reaped exit to the owning process object and applies the
    /// resulting recovery action.
    pub(crate) fn handle_proc_exit(&mut self, app_name: &str, pid: i32, status: ExitStatus) {
        let forced = self.watchdog_kills.remove(&pid);

        let (proc_name, action, remove_after) = {
            let Some(app) = self.registry.app_mut(app_name) else { return };
            let Some(proc) = app.proc_by_pid_mut(pid) else { return };

            let name = proc.name().to_string();
            let mut action = proc.evaluate_fault(status, Instant::now());
            proc.clear_command_override();
            if let Some(forced) = forced {
                action = Some(forced);
            }
            (name, action, proc.remove_on_exit())
        };

        info!("process '{proc_name}' of app '{app_name}' (pid {pid}) {status}");

        if let Some(sink) = self
            .run_proc_sinks
            .remove(&(app_name.to_string(), proc_name.clone()))
        {
            sink.send(Response::ProcExited { status });
        }

        if remove_after {
            self.registry.app_mut(app_name).unwrap().remove_proc(&proc_name);
        }

        let stopping = self.registry.app(app_name).is_some_and(App::is_stopping);

        match action {
            None | Some(FaultAction::Ignore) => {}
            Some(FaultAction::Restart) => {
                if stopping || remove_after {
                    return;
                }
                match self.start_proc(app_name, &proc_name) {
                    Ok(()) => info!("restarted process '{proc_name}' of app '{app_name}'"),
                    Err(e) => {
                        error!("could not restart process '{proc_name}': {e}");
                        if self.handle_spawn_failure(app_name, &proc_name) {
                            debug!("app '{app_name}' is being stopped after a failed restart");
                        }
                    }
                }
            }
            Some(FaultAction::RestartApp) => {
                if let Some(app) = self.registry.app_mut(app_name) {
                    app.set_disposition(StopDisposition::Restart);
                }
                if !stopping {
                    self.stop_app(app_name, None);
                }
            }
            Some(FaultAction::StopApp) => {
                if !stopping {
                    self.stop_app(app_name, None);
                }
            }
            Some(FaultAction::Reboot) => {
                error!("process '{proc_name}' of app '{app_name}' faulted: rebooting");
                self.reboot();
            }
        }
    }

    /// Watchdog expiry uses the same action set as fault recovery, with
    /// `handled` as a no-op. For a process-level restart the hung PID is
    /// soft-killed and the action is pinned so the exit dispatch applies it
    /// instead of the configured fault action.
    pub(crate) fn watchdog_kicked(&mut self, pid: i32) {
        info!("handling watchdog expiry for pid {pid}");

        let Some(app_name) = self.registry.app_owning_pid(pid).map(str::to_string) else {
            error!("pid {pid} was not started by the supervisor, no watchdog action possible");
            return;
        };

        let action = self
            .registry
            .app(&app_name)
            .and_then(|app| app.procs().find(|p| p.pid() == Some(pid)))
            .map(|p| p.config().watchdog_action)
            .unwrap_or(WatchdogAction::Handled);

        match action {
            WatchdogAction::Handled | WatchdogAction::Fault(FaultAction::Ignore) => {}
            WatchdogAction::Fault(FaultAction::Restart) => {
                self.watchdog_kills.insert(pid, FaultAction::Restart);
                self.kill.soft_kill(pid, SOFT_KILL_TIMEOUT);
            }
            WatchdogAction::Fault(FaultAction::RestartApp) => {
                if let Some(app) = self.registry.app_mut(&app_name) {
                    app.set_disposition(StopDisposition::Restart);
                }
                self.stop_app(&app_name, None);
            }
            WatchdogAction::Fault(FaultAction::StopApp) => {
                self.stop_app(&app_name, None);
            }
            WatchdogAction::Fault(FaultAction::Reboot) => {
                error!("watchdog expiry for pid {pid} in app '{app_name}': rebooting");
                self.reboot();
            }
        }
    }

    // ---- stopping ------------------------------------------------------

    /// Begins (or re-disposes) an asynchronous stop: SIGTERM to every member
    /// of the freezer cgroup, then a deadline that escalates to SIGKILL. The
    /// transition to STOPPED is declared by `mark_app_stopped` only.
    pub(crate) fn stop_app(&mut self, name: &str, disposition: Option<StopDisposition>) {
        let seq = {
            let Some(app) = self.registry.active_app_mut(name) else {
                warn!("cannot stop '{name}', not an active app");
                return;
            };
            if let Some(disposition) = disposition {
                app.set_disposition(disposition);
            }
            if app.is_stopping() {
                // A cycle is already in flight; only the disposition changed.
                return;
            }
            app.begin_stop_cycle()
        };

        info!("stopping app '{name}'");

        match self.cgroups.send_signal(Subsystem::Freezer, name, Signal::SIGTERM, &[]) {
            Ok(pids) if pids.is_empty() => {
                // Nothing left alive in the group; completion only waits on
                // process-object bookkeeping.
                self.mark_app_stopped(name);
            }
            Ok(pids) => {
                self.registry.app_mut(name).unwrap().set_last_kill_pass(pids);
                self.arm_stop_deadline(name, seq);
            }
            Err(Error::Unkillable(pid)) => {
                error!("process {pid} of app '{name}' is unkillable, restarting device");
                self.reboot();
            }
            Err(e) => {
                warn!("could not sweep freezer cgroup of '{name}': {e}");
                self.mark_app_stopped(name);
            }
        }
    }

    /// The soft-kill deadline for a stop cycle expired: SIGKILL the
    /// survivors. A process observed in uninterruptible sleep on two
    /// successive passes forces a reboot.
    pub(crate) fn on_stop_deadline(&mut self, name: &str, seq: u64) {
        let prev_pass = {
            let Some(app) = self.registry.active_app_mut(name) else { return };
            if app.stop_seq() != seq || !app.is_stopping() {
                // Deadline from a previous stop cycle.
                return;
            }
            app.last_kill_pass().to_vec()
        };

        match self.cgroups.send_signal(Subsystem::Freezer, name, Signal::SIGKILL, &prev_pass) {
            Ok(pids) if pids.is_empty() => {
                // The release agent will report the drained group.
            }
            Ok(pids) => {
                self.registry.app_mut(name).unwrap().set_last_kill_pass(pids);
                self.arm_stop_deadline(name, seq);
            }
            Err(Error::Unkillable(pid)) => {
                error!("process {pid} of app '{name}' survived SIGKILL in state D, restarting device");
                self.reboot();
            }
            Err(e) => warn!("could not hard-kill survivors of '{name}': {e}"),
        }
    }

    /// Datagram from the release agent: the app's freezer cgroup drained.
    pub(crate) fn on_stop_notification(&mut self, name: &str) {
        if !self.registry.is_active(name) {
            // Can happen during teardown, after the container is gone.
            warn!("stop notification for unknown or inactive app '{name}'");
            return;
        }
        self.mark_app_stopped(name);
    }

    pub(crate) fn on_stop_recheck(&mut self, name: &str) {
        if self.registry.is_active(name) {
            self.mark_app_stopped(name);
        }
    }

    /// Declares an app STOPPED only when both conditions hold: the freezer
    /// cgroup is empty (kernel ground truth) and every process object is
    /// STOPPED (supervisor bookkeeping). The two are decoupled, so a bounded
    /// recheck bridges the gap; exhausting the budget means the notification
    /// machinery is broken.
    fn mark_app_stopped(&mut self, name: &str) {
        let has_running = self.registry.app(name).is_some_and(App::has_running_procs);
        let cgroup_empty = match self.cgroups.is_empty(Subsystem::Freezer, name) {
            Ok(empty) => empty,
            Err(e) => {
                warn!("could not read freezer cgroup of '{name}': {e}");
                true
            }
        };

        if self.registry.app(name).is_none() {
            return;
        }

        if has_running {
            if cgroup_empty {
                // SIGCHLD handling has not caught up with the emptied group.
                let retries = self.registry.app_mut(name).unwrap().bump_stop_retries();
                if retries > MAX_STOP_RETRIES {
                    self.fatal(format!(
                        "app '{name}' cannot be marked stopped: process objects \
                         never reached STOPPED"
                    ));
                }
                debug!("app '{name}' still has running process objects, recheck {retries}");
                self.arm_stop_recheck(name);
            } else {
                // A fault-driven process restart repopulated the group; the
                // app is staying up.
                self.registry.app_mut(name).unwrap().reset_stop_retries();
                debug!("process restart in flight, not marking app '{name}' stopped");
            }
        } else {
            self.registry.app_mut(name).unwrap().reset_stop_retries();
            if cgroup_empty {
                self.stop_complete(name);
            } else {
                self.fatal(format!(
                    "app '{name}' has no running process objects but a non-empty \
                     freezer cgroup; notify_on_release is not working"
                ));
            }
        }
    }

    /// Both stop conditions hold: tear down the cgroups and run the pending
    /// disposition.
    fn stop_complete(&mut self, name: &str) {
        let disposition = {
            let Some(app) = self.registry.app_mut(name) else { return };
            app.set_state(AppState::Stopped);
            app.stop_cycle_done();
            let disposition = app.disposition();
            app.set_disposition(StopDisposition::Deactivate);
            disposition
        };

        // Cgroups are removed only once the app has reached STOPPED.
        for subsys in Subsystem::ALL {
            if let Err(e) = self.cgroups.remove(subsys, name) {
                error!("could not remove {subsys} cgroup of app '{name}': {e}");
            }
        }

        match disposition {
            StopDisposition::Deactivate => {
                self.registry.deactivate(name);
                info!("app '{name}' has stopped");
            }
            StopDisposition::Reply => {
                self.registry.deactivate(name);
                info!("app '{name}' has stopped");
                if let Some(sink) = self.pending_stop_replies.remove(name) {
                    sink.send(Response::Done { code: ResultCode::Ok });
                }
            }
            StopDisposition::Remove => {
                self.registry.deactivate(name);
                self.registry.remove(name);
                info!("app '{name}' has stopped and was removed");
                if let Some(sink) = self.pending_stop_replies.remove(name) {
                    sink.send(Response::Done { code: ResultCode::Ok });
                }
            }
            StopDisposition::Restart => {
                info!("restarting app '{name}'");
                let code = match self.activate_container(name) {
                    Ok(()) => self.start_configured_procs(name),
                    Err(e) => {
                        error!("could not restart app '{name}': {e}");
                        self.registry.deactivate(name);
                        ResultCode::Failed
                    }
                };
                if let Some(sink) = self.pending_stop_replies.remove(name) {
                    sink.send(Response::Done { code });
                }
            }
            StopDisposition::ShutdownNext => {
                info!("app '{name}' has stopped");
                if let Some(sink) = self.pending_stop_replies.remove(name) {
                    sink.send(Response::Done { code: ResultCode::Ok });
                }
                self.registry.deactivate(name);
                self.registry.remove(name);
                self.shutdown_next_app();
            }
        }
    }

    fn arm_stop_deadline(&self, name: &str, seq: u64) {
        let tx = self.msg_tx.clone();
        let app = name.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(SOFT_KILL_TIMEOUT).await;
            let _ = tx.send(CoreMsg::StopDeadline { app, seq }).await;
        });
    }

    fn arm_stop_recheck(&self, name: &str) {
        let tx = self.msg_tx.clone();
        let app = name.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(STOP_RECHECK_INTERVAL).await;
            let _ = tx.send(CoreMsg::RecheckStop { app }).await;
        });
    }

    // ---- framework shutdown --------------------------------------------

    fn begin_framework_shutdown(&mut self, target: State, reply: ReplySink) {
        if self.state != State::Normal {
            debug!("ignoring shutdown request in state {:?}", self.state);
            reply.send(Response::Done { code: ResultCode::Duplicate });
            return;
        }

        info!("framework shutdown requested");
        self.state = target;
        self.shutdown_reply = Some(reply);

        self.registry.remove_all_inactive();
        self.shutdown_next_app();
    }

    /// Stops active apps one at a time; once none remain, tears down the
    /// framework daemons in reverse order.
    pub(crate) fn shutdown_next_app(&mut self) {
        if let Some(name) = self.registry.next_active_name() {
            self.stop_app(&name, Some(StopDisposition::ShutdownNext));
        } else {
            let phase = self.daemons.begin_shutdown(&mut self.kill);
            self.on_daemon_shutdown_phase(phase);
        }
    }

    // ---- client sessions -----------------------------------------------

    /// A control client went away: its handles revert, and every process it
    /// ran dies with it.
    pub(crate) fn drop_session(&mut self, session: SessionId) {
        let client_runs: Vec<(String, String)> = self
            .run_proc_sinks
            .iter()
            .filter(|(_, sink)| sink.session() == session)
            .map(|(key, _)| key.clone())
            .collect();
        for key in client_runs {
            self.run_proc_sinks.remove(&key);
            let pid = self
                .registry
                .app(&key.0)
                .and_then(|app| app.proc(&key.1))
                .filter(|p| p.state() == ProcState::Running)
                .and_then(Proc::pid);
            if let Some(pid) = pid {
                self.kill.soft_kill(pid, SOFT_KILL_TIMEOUT);
            }
        }

        for pid in self.registry.drop_session(session) {
            self.kill.soft_kill(pid, SOFT_KILL_TIMEOUT);
        }
    }

    // ---- client-injected processes -------------------------------------

    /// Runs a single process inside an app on a client's behalf. The app
    /// container (and its cgroups) is activated if needed, but other
    /// configured processes are not started. Output streams back to the
    /// client, which also gets the exit status as an event.
    fn run_proc(
        &mut self,
        session: SessionId,
        app_name: String,
        proc: Option<String>,
        exec: Option<String>,
        args: Vec<String>,
        reply: ReplySink,
    ) {
        if !is_name_valid(&app_name) || proc.as_deref().is_some_and(|p| !is_name_valid(p)) {
            reply.send(Response::Done { code: ResultCode::BadParameter });
            return;
        }

        let Some(proc_name) = proc.clone().or_else(|| {
            exec.as_deref()
                .and_then(|e| Path::new(e).file_name())
                .and_then(|n| n.to_str())
                .map(str::to_string)
        }) else {
            // Neither a process name nor an executable path.
            reply.send(Response::Done { code: ResultCode::BadParameter });
            return;
        };

        match self.registry.get_or_create(&self.store, &app_name) {
            Ok(_) => {}
            Err(Error::NotInstalled(_)) => {
                reply.send(Response::Done { code: ResultCode::NotInstalled });
                return;
            }
            Err(e) => {
                error!("could not create container for '{app_name}': {e}");
                reply.send(Response::Done { code: ResultCode::Failed });
                return;
            }
        }

        {
            let app = self.registry.app_mut(&app_name).unwrap();
            match app.proc_mut(&proc_name) {
                Some(existing) => {
                    if existing.is_running() {
                        reply.send(Response::Done { code: ResultCode::Duplicate });
                        return;
                    }
                    // A configured definition seeds the run; an explicit
                    // exec path overrides it for this run only.
                    if let Some(exec) = exec {
                        existing.set_command_override(exec, args);
                    }
                }
                None => {
                    let Some(exec) = exec else {
                        error!("process '{proc_name}' is not configured and no executable was given");
                        reply.send(Response::Done { code: ResultCode::BadParameter });
                        return;
                    };
                    let config = injected_proc_config(&proc_name, exec, args);
                    if app.add_proc(Proc::new_injected(config, session)).is_err() {
                        reply.send(Response::Done { code: ResultCode::Duplicate });
                        return;
                    }
                }
            }
        }

        if !self.registry.is_active(&app_name)
            && let Err(e) = self.activate_container(&app_name)
        {
            error!("could not activate app '{app_name}' for client process: {e}");
            self.registry.deactivate(&app_name);
            reply.send(Response::Done { code: ResultCode::Failed });
            return;
        }

        self.run_proc_sinks
            .insert((app_name.clone(), proc_name.clone()), reply.clone());

        match self.start_proc(&app_name, &proc_name) {
            Ok(()) => reply.send(Response::Done { code: ResultCode::Ok }),
            Err(e) => {
                error!("could not start client process '{proc_name}': {e}");
                self.run_proc_sinks.remove(&(app_name, proc_name));
                reply.send(Response::Done { code: ResultCode::Failed });
            }
        }
    }

    // ---- queries -------------------------------------------------------

    fn list_apps(&self) -> Response {
        let apps = self
            .store
            .apps()
            .iter()
            .map(|config| AppSummary {
                name: config.name.clone(),
                state: self.state_kind(&config.name),
            })
            .collect();
        Response::List { apps }
    }

    fn app_status(&self, name: &str) -> Response {
        if self.store.app(name).is_none() {
            return Response::Status { code: ResultCode::NotInstalled, state: None };
        }
        Response::Status { code: ResultCode::Ok, state: Some(self.state_kind(name)) }
    }

    fn app_info(&self, name: &str) -> Response {
        let Some(config) = self.store.app(name) else {
            return Response::Info { code: ResultCode::NotInstalled, info: None };
        };

        let procs = match self.registry.app(name) {
            Some(app) => app
                .procs()
                .map(|p| ProcInfo {
                    name: p.name().to_string(),
                    pid: p.pid(),
                    state: match p.state() {
                        ProcState::Running => ProcStateKind::Running,
                        ProcState::Stopped => ProcStateKind::Stopped,
                    },
                    fault_action: p.config().fault_action,
                })
                .collect(),
            None => config
                .procs
                .iter()
                .map(|p| ProcInfo {
                    name: p.name.clone(),
                    pid: None,
                    state: ProcStateKind::Stopped,
                    fault_action: p.fault_action,
                })
                .collect(),
        };

        Response::Info {
            code: ResultCode::Ok,
            info: Some(AppInfo {
                name: config.name.clone(),
                sandboxed: config.sandboxed,
                state: self.state_kind(name),
                procs,
            }),
        }
    }

    /// Clients see RUNNING until the stop transition fully completes.
    fn state_kind(&self, name: &str) -> AppStateKind {
        if self.registry.is_active(name) {
            AppStateKind::Running
        } else {
            AppStateKind::Stopped
        }
    }

    // ---- handle plumbing -----------------------------------------------

    fn with_handle_app(
        &mut self,
        session: SessionId,
        handle: u64,
        f: impl FnOnce(&mut App) -> ResultCode,
    ) -> ResultCode {
        let Some(name) = self
            .registry
            .handle_app(HandleId(handle), session)
            .map(str::to_string)
        else {
            return ResultCode::NotFound;
        };
        match self.registry.app_mut(&name) {
            Some(app) => f(app),
            None => ResultCode::NotFound,
        }
    }

    fn with_handle_proc(
        &mut self,
        session: SessionId,
        handle: u64,
        proc: &str,
        f: impl FnOnce(&mut Proc),
    ) -> ResultCode {
        if !is_name_valid(proc) {
            return ResultCode::BadParameter;
        }
        self.with_handle_app(session, handle, |app| match app.proc_mut(proc) {
            Some(p) => {
                f(p);
                ResultCode::Ok
            }
            None => ResultCode::NotFound,
        })
    }
}

fn injected_proc_config(name: &str, exec: String, args: Vec<String>) -> ProcConfig {
    ProcConfig {
        name: name.to_string(),
        command: exec,
        args,
        env: Default::default(),
        priority: appvisor_core::PriorityClass::Medium,
        fault_action: FaultAction::Ignore,
        watchdog_action: WatchdogAction::Fault(FaultAction::Restart),
        run: true,
        debug: false,
        probation: std::time::Duration::from_secs(30),
        limits: Default::default(),
    }
}

/// Pumps one stdio pipe of a managed process. Output from client-run
/// processes streams back over the control connection; everything else goes
/// to the logger under the app's name.
fn forward_output(
    app: &str,
    proc: &str,
    stream: StdStream,
    pipe: tokio::net::unix::pipe::Receiver,
    sink: Option<ReplySink>,
) {
    let app = app.to_string();
    let proc = proc.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match &sink {
                Some(sink) => sink.send(Response::ProcOutput { stream, line }),
                None => match stream {
                    StdStream::Stdout => info!(target: "app", %app, %proc, "{line}"),
                    StdStream::Stderr => warn!(target: "app", %app, %proc, "{line}"),
                },
            }
        }
    });
}
