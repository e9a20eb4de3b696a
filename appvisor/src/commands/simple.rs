//! Start / Stop / Restart / Remove: one request, one (possibly deferred)
//! reply.

use std::path::PathBuf;

use appvisor_ipc::Request;

use crate::cli::AppArgs;
use crate::common::{connect, finish};

pub async fn start(socket: &Option<PathBuf>, args: AppArgs) -> anyhow::Result<()> {
    let mut client = connect(socket).await?;
    let reply = client.call(&Request::Start { app: args.name.clone() }).await?;
    finish(&args.name, "start", reply)
}

pub async fn stop(socket: &Option<PathBuf>, args: AppArgs) -> anyhow::Result<()> {
    let mut client = connect(socket).await?;
    // The reply arrives once the app has fully reached STOPPED.
    let reply = client.call(&Request::Stop { app: args.name.clone() }).await?;
    finish(&args.name, "stop", reply)
}

pub async fn restart(socket: &Option<PathBuf>, args: AppArgs) -> anyhow::Result<()> {
    let mut client = connect(socket).await?;
    let reply = client.call(&Request::Restart { app: args.name.clone() }).await?;
    finish(&args.name, "restart", reply)
}

pub async fn remove(socket: &Option<PathBuf>, args: AppArgs) -> anyhow::Result<()> {
    let mut client = connect(socket).await?;
    let reply = client.call(&Request::Remove { app: args.name.clone() }).await?;
    finish(&args.name, "remove", reply)
}
