//! The "app stopped" oracle.
//!
//! Each per-app freezer cgroup is created with `notify_on_release`; when its
//! last task exits, the kernel runs the release agent, which sends the app
//! name as a datagram to this socket. SIGCHLD alone cannot provide this
//! signal because grandchildren can outlive the processes the supervisor
//! forked.

use std::path::Path;

use tokio::net::UnixDatagram;
use tracing::{debug, warn};

use appvisor_core::Result;

/// Longest app name accepted on the wire.
const MAX_NAME_BYTES: usize = 256;

/// Receiving side, owned by the supervisor's event loop.
pub struct StopNotifier {
    socket: UnixDatagram,
}

impl StopNotifier {
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Err(e) = std::fs::remove_file(path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!("failed to remove stale stop-notifier socket: {e}");
        }

        let socket = UnixDatagram::bind(path)?;
        debug!("stop notifier bound to {}", path.display());
        Ok(Self { socket })
    }

    /// Next reported app name. Malformed datagrams are dropped with a
    /// warning; they can occur during teardown.
    pub async fn recv(&self) -> Result<Option<String>> {
        let mut buf = [0u8; MAX_NAME_BYTES];
        let len = self.socket.recv(&mut buf).await?;

        if len == 0 {
            warn!("empty app-stop datagram");
            return Ok(None);
        }

        match std::str::from_utf8(&buf[..len]) {
            Ok(name) => Ok(Some(name.to_string())),
            Err(e) => {
                warn!("app-stop datagram is not valid UTF-8: {e}");
                Ok(None)
            }
        }
    }
}

/// Sending side, used by the release-agent helper. Payload is the bare app
/// name; the datagram boundary delimits it.
pub fn notify_app_stopped(socket_path: &Path, app_name: &str) -> std::io::Result<()> {
    let socket = std::os::unix::net::UnixDatagram::unbound()?;
    socket.send_to(app_name.as_bytes(), socket_path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_notifier_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app-stop.sock");

        let notifier = StopNotifier::bind(&path).unwrap();
        notify_app_stopped(&path, "echo").unwrap();

        assert_eq!(notifier.recv().await.unwrap(), Some("echo".to_string()));
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app-stop.sock");

        let notifier = StopNotifier::bind(&path).unwrap();
        let sender = std::os::unix::net::UnixDatagram::unbound().unwrap();
        sender.send_to(&[0xff, 0xfe], &path).unwrap();

        assert_eq!(notifier.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app-stop.sock");

        drop(StopNotifier::bind(&path).unwrap());
        let notifier = StopNotifier::bind(&path).unwrap();

        notify_app_stopped(&path, "svc").unwrap();
        assert_eq!(notifier.recv().await.unwrap(), Some("svc".to_string()));
    }
}
