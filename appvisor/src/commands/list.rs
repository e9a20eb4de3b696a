use std::path::PathBuf;

use appvisor_ipc::{AppStateKind, Request, Response};

use crate::common::connect;

pub async fn execute(socket: &Option<PathBuf>) -> anyhow::Result<()> {
    let mut client = connect(socket).await?;

    match client.call(&Request::List).await? {
        Response::List { apps } => {
            if apps.is_empty() {
                println!("no applications installed");
                return Ok(());
            }
            for app in apps {
                let state = match app.state {
                    AppStateKind::Running => "running",
                    AppStateKind::Stopped => "stopped",
                };
                println!("[{state}] {}", app.name);
            }
            Ok(())
        }
        other => anyhow::bail!("unexpected reply: {other:?}"),
    }
}
