use std::path::PathBuf;

use appvisor_ipc::{Request, Response, ResultCode, StdStream};

use crate::cli::RunProcArgs;
use crate::common::connect;

/// Runs a process inside an app and relays its output until it exits. The
/// child's exit code becomes ours.
pub async fn execute(socket: &Option<PathBuf>, args: RunProcArgs) -> anyhow::Result<()> {
    let mut client = connect(socket).await?;
    // The process may legitimately run for a long time.
    client.set_timeout(std::time::Duration::from_secs(24 * 60 * 60));

    client
        .send(&Request::RunProc {
            app: args.app.clone(),
            proc: args.proc,
            exec: args.exec,
            args: args.args,
        })
        .await?;

    match client.recv().await? {
        Response::Done { code: ResultCode::Ok } => {}
        Response::Done { code } => anyhow::bail!("run-proc in '{}': {code}", args.app),
        other => anyhow::bail!("unexpected reply: {other:?}"),
    }

    loop {
        match client.recv().await? {
            Response::ProcOutput { stream: StdStream::Stdout, line } => println!("{line}"),
            Response::ProcOutput { stream: StdStream::Stderr, line } => eprintln!("{line}"),
            Response::ProcExited { status } => {
                if !status.success() {
                    eprintln!("process {status}");
                    std::process::exit(status.code().unwrap_or(1));
                }
                return Ok(());
            }
            other => anyhow::bail!("unexpected event: {other:?}"),
        }
    }
}
