//! Control-plane transport glue.
//!
//! The kernel owns all supervisor state on one task; connections live on
//! their own tasks and talk to it over the core channel. Each request
//! carries a [`ReplySink`] so the kernel can answer immediately or store the
//! sink and reply when the state transition completes.

use tokio::sync::mpsc;
use tracing::{debug, warn};

use appvisor_core::registry::SessionId;
use appvisor_ipc::{IpcServer, Request, Response};

use super::CoreMsg;

/// Write end of one client connection. Sends never block the kernel; a
/// client that stopped draining its socket loses events instead.
#[derive(Clone)]
pub struct ReplySink {
    session: SessionId,
    tx: mpsc::Sender<Response>,
}

impl ReplySink {
    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn send(&self, response: Response) {
        if let Err(e) = self.tx.try_send(response) {
            warn!(session = self.session.0, "dropping reply to stalled client: {e}");
        }
    }
}

/// What the kernel hears about clients.
pub enum ClientEvent {
    Request { session: SessionId, op: Request, reply: ReplySink },
    Disconnected { session: SessionId },
}

/// Accept loop. Runs until the listener fails.
pub async fn serve(server: IpcServer, core: mpsc::Sender<CoreMsg>) {
    let mut next_session = 0u64;

    loop {
        match server.accept().await {
            Ok(conn) => {
                next_session += 1;
                let session = SessionId(next_session);
                tokio::spawn(connection(session, conn, core.clone()));
            }
            Err(e) => {
                warn!("control socket accept failed: {e}");
                return;
            }
        }
    }
}

async fn connection(
    session: SessionId,
    conn: appvisor_ipc::IpcConnection,
    core: mpsc::Sender<CoreMsg>,
) {
    let (mut requests, mut responses) = conn.into_split();
    let (reply_tx, mut reply_rx) = mpsc::channel::<Response>(256);

    // Writer side: replies and events may arrive long after the request that
    // caused them, and must not block request reading.
    let writer = tokio::spawn(async move {
        while let Some(response) = reply_rx.recv().await {
            if responses.send(&response).await.is_err() {
                break;
            }
        }
    });

    loop {
        match requests.recv().await {
            Ok(Some(op)) => {
                let event = ClientEvent::Request {
                    session,
                    op,
                    reply: ReplySink { session, tx: reply_tx.clone() },
                };
                if core.send(CoreMsg::Client(event)).await.is_err() {
                    break;
                }
            }
            Ok(None) => {
                debug!(session = session.0, "client disconnected");
                break;
            }
            Err(e) => {
                warn!(session = session.0, "dropping client after protocol error: {e}");
                break;
            }
        }
    }

    let _ = core.send(CoreMsg::Client(ClientEvent::Disconnected { session })).await;
    drop(reply_tx);
    let _ = writer.await;
}
