use std::path::PathBuf;

use appvisor_ipc::{IpcClient, Response, ResultCode};

pub const DEFAULT_CTRL_SOCKET: &str = "/run/appvisor/ctrl.sock";

pub async fn connect(socket: &Option<PathBuf>) -> anyhow::Result<IpcClient> {
    let path = socket
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CTRL_SOCKET));
    IpcClient::connect(&path)
        .await
        .map_err(|e| anyhow::anyhow!("could not reach the supervisor at {}: {e}", path.display()))
}

/// Prints the outcome of a simple command and fails the process on any
/// non-OK code.
pub fn finish(app: &str, verb: &str, response: Response) -> anyhow::Result<()> {
    match response {
        Response::Done { code: ResultCode::Ok } => {
            println!("{verb} '{app}': OK");
            Ok(())
        }
        Response::Done { code } => anyhow::bail!("{verb} '{app}': {code}"),
        other => anyhow::bail!("unexpected reply: {other:?}"),
    }
}
