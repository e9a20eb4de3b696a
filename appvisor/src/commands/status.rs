use std::path::PathBuf;

use appvisor_ipc::{AppStateKind, Request, Response, ResultCode};

use crate::cli::StatusArgs;
use crate::common::connect;

pub async fn status(socket: &Option<PathBuf>, args: StatusArgs) -> anyhow::Result<()> {
    let mut client = connect(socket).await?;

    match client.call(&Request::Status { app: args.name.clone() }).await? {
        Response::Status { code: ResultCode::Ok, state: Some(state) } => {
            if args.json {
                println!("{}", serde_json::json!({ "name": args.name, "state": state }));
            } else {
                let state = match state {
                    AppStateKind::Running => "running",
                    AppStateKind::Stopped => "stopped",
                };
                println!("{}: {state}", args.name);
            }
            Ok(())
        }
        Response::Status { code, .. } => anyhow::bail!("status '{}': {code}", args.name),
        other => anyhow::bail!("unexpected reply: {other:?}"),
    }
}

pub async fn info(socket: &Option<PathBuf>, args: StatusArgs) -> anyhow::Result<()> {
    let mut client = connect(socket).await?;

    match client.call(&Request::Info { app: args.name.clone() }).await? {
        Response::Info { code: ResultCode::Ok, info: Some(info) } => {
            if args.json {
                println!("{}", serde_json::to_string_pretty(&info)?);
                return Ok(());
            }

            let state = match info.state {
                AppStateKind::Running => "running",
                AppStateKind::Stopped => "stopped",
            };
            println!("{} [{state}]{}", info.name, if info.sandboxed { " (sandboxed)" } else { "" });
            for proc in info.procs {
                match proc.pid {
                    Some(pid) => println!("  {} pid {pid}", proc.name),
                    None => println!("  {} stopped", proc.name),
                }
            }
            Ok(())
        }
        Response::Info { code, .. } => anyhow::bail!("info '{}': {code}", args.name),
        other => anyhow::bail!("unexpected reply: {other:?}"),
    }
}

pub async fn version(socket: &Option<PathBuf>) -> anyhow::Result<()> {
    let mut client = connect(socket).await?;
    match client.call(&Request::Version).await? {
        Response::Version { version } => {
            println!("appvisor {version}");
            Ok(())
        }
        other => anyhow::bail!("unexpected reply: {other:?}"),
    }
}
