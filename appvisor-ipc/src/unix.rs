use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::time::timeout;
use tracing::{debug, error, warn};

use crate::{DEFAULT_TIMEOUT, MAX_MESSAGE_SIZE, Request, Response};

async fn read_frame<R>(reader: &mut R) -> appvisor_core::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;

    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_MESSAGE_SIZE {
        error!("message size {len} exceeds maximum {MAX_MESSAGE_SIZE}");
        return Err(appvisor_core::Error::Other(anyhow::anyhow!(
            "message size {len} exceeds maximum allowed size {MAX_MESSAGE_SIZE}"
        )));
    }

    let mut buffer = vec![0u8; len];
    reader.read_exact(&mut buffer).await?;
    Ok(buffer)
}

async fn write_frame<W>(writer: &mut W, data: &[u8]) -> appvisor_core::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if data.len() > MAX_MESSAGE_SIZE {
        error!("message size {} exceeds maximum {MAX_MESSAGE_SIZE}", data.len());
        return Err(appvisor_core::Error::Other(anyhow::anyhow!(
            "message size {} exceeds maximum allowed size {MAX_MESSAGE_SIZE}",
            data.len()
        )));
    }

    let len = (data.len() as u32).to_le_bytes();
    writer.write_all(&len).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

fn encode<T: Serialize>(value: &T) -> appvisor_core::Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| {
        error!("failed to serialize message: {e}");
        appvisor_core::Error::Other(e.into())
    })
}

fn decode<T: DeserializeOwned>(data: &[u8]) -> appvisor_core::Result<T> {
    serde_json::from_slice(data).map_err(|e| {
        error!("failed to deserialize message: {e}");
        appvisor_core::Error::Other(e.into())
    })
}

/// Listening side of the control-plane socket.
pub struct IpcServer {
    listener: UnixListener,
}

impl IpcServer {
    pub fn bind(path: impl AsRef<Path>) -> appvisor_core::Result<Self> {
        let path = path.as_ref();

        if let Err(e) = std::fs::remove_file(path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!("failed to remove existing socket file: {e}");
        }

        debug!("binding control socket to {}", path.display());
        let listener = UnixListener::bind(path).map_err(|e| {
            error!("failed to bind control socket: {e}");
            appvisor_core::Error::Io(e)
        })?;

        Ok(Self { listener })
    }

    pub async fn accept(&self) -> appvisor_core::Result<IpcConnection> {
        let (stream, _addr) = self.listener.accept().await.map_err(|e| {
            error!("failed to accept connection: {e}");
            appvisor_core::Error::Io(e)
        })?;
        debug!("client connected");
        Ok(IpcConnection { stream })
    }
}

/// One accepted client connection.
pub struct IpcConnection {
    stream: UnixStream,
}

impl IpcConnection {
    /// Splits into independent halves so replies and events can be written
    /// while the next request is being read.
    pub fn into_split(self) -> (RequestStream, ResponseSink) {
        let (read, write) = self.stream.into_split();
        (RequestStream { read }, ResponseSink { write })
    }
}

/// Server-side request reader. Waits as long as the client stays connected.
pub struct RequestStream {
    read: OwnedReadHalf,
}

impl RequestStream {
    /// Next request, or None once the client disconnects.
    pub async fn recv(&mut self) -> appvisor_core::Result<Option<Request>> {
        match read_frame(&mut self.read).await {
            Ok(frame) => {
                let request = decode(&frame)?;
                debug!("received request: {request:?}");
                Ok(Some(request))
            }
            Err(appvisor_core::Error::Io(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// Server-side response writer.
pub struct ResponseSink {
    write: OwnedWriteHalf,
}

impl ResponseSink {
    pub async fn send(&mut self, response: &Response) -> appvisor_core::Result<()> {
        debug!("sending response: {response:?}");
        let data = encode(response)?;
        write_frame(&mut self.write, &data).await
    }
}

/// Client end of the control-plane socket.
pub struct IpcClient {
    stream: UnixStream,
    timeout: Duration,
}

impl IpcClient {
    pub async fn connect(path: impl AsRef<Path>) -> appvisor_core::Result<Self> {
        let path = path.as_ref();
        debug!("connecting to control socket at {}", path.display());

        let stream = UnixStream::connect(path).await.map_err(|e| {
            error!("failed to connect to supervisor: {e}");
            appvisor_core::Error::Io(e)
        })?;

        Ok(Self { stream, timeout: DEFAULT_TIMEOUT })
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub async fn send(&mut self, request: &Request) -> appvisor_core::Result<()> {
        debug!("sending request: {request:?}");
        let data = encode(request)?;
        timeout(self.timeout, write_frame(&mut self.stream, &data))
            .await
            .map_err(|_| appvisor_core::Error::Timeout("request send".to_string()))?
    }

    pub async fn recv(&mut self) -> appvisor_core::Result<Response> {
        let frame = timeout(self.timeout, read_frame(&mut self.stream))
            .await
            .map_err(|_| appvisor_core::Error::Timeout("reply".to_string()))??;
        let response = decode(&frame)?;
        debug!("received response: {response:?}");
        Ok(response)
    }

    /// Send a request and wait for its single reply.
    pub async fn call(&mut self, request: &Request) -> appvisor_core::Result<Response> {
        self.send(request).await?;
        self.recv().await
    }
}
