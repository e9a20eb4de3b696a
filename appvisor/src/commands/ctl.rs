//! Framework-level control: stop or restart the whole supervisor.

use std::path::PathBuf;

use appvisor_ipc::{Request, Response, ResultCode};

use crate::cli::RestartDaemonArgs;
use crate::common::connect;

pub async fn stop_daemon(socket: &Option<PathBuf>) -> anyhow::Result<()> {
    let mut client = connect(socket).await?;
    // Replied to just before the service plane goes away.
    match client.call(&Request::StopDaemon).await? {
        Response::Done { code: ResultCode::Ok } => {
            println!("framework stopped");
            Ok(())
        }
        Response::Done { code } => anyhow::bail!("stop-daemon: {code}"),
        other => anyhow::bail!("unexpected reply: {other:?}"),
    }
}

pub async fn restart_daemon(
    socket: &Option<PathBuf>,
    args: RestartDaemonArgs,
) -> anyhow::Result<()> {
    let mut client = connect(socket).await?;
    match client.call(&Request::RestartDaemon { manual: args.manual }).await? {
        Response::Done { code: ResultCode::Ok } => {
            println!("framework restarting");
            Ok(())
        }
        Response::Done { code } => anyhow::bail!("restart-daemon: {code}"),
        other => anyhow::bail!("unexpected reply: {other:?}"),
    }
}
