//! Server-side state for one connected client.

use crate::control::LoopControl;
use shared::{ClientInfo, HEADER_VERSION_1};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// Write half of a client connection.
pub type ClientWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Per-session settings taken from the server configuration.
#[derive(Debug, Clone)]
pub struct SessionDefaults {
    pub client_info: ClientInfo,
    pub send_timeout: Duration,
    pub receive_timeout: Duration,
}

/// A connected client, owned by the [`ClientRegistry`](crate::client_registry::ClientRegistry).
pub struct ClientSession {
    pub id: u32,
    pub addr: SocketAddr,
    pub client_info: ClientInfo,
    /// min(server max, client declared), starts at version 1
    pub header_version: u16,
    /// Timestamp of the last frame streamed to this client
    pub last_sent_timestamp: f64,
    /// Timestamp of the last TDATA message, used for rate limiting
    pub last_tracking_timestamp: f64,
    pub send_timeout: Duration,
    pub receive_timeout: Duration,
    pub connected_at: Instant,
    writer: Arc<Mutex<ClientWriter>>,
    receiver: Arc<LoopControl>,
}

impl ClientSession {
    pub fn new(
        id: u32,
        addr: SocketAddr,
        writer: ClientWriter,
        receiver: Arc<LoopControl>,
        defaults: &SessionDefaults,
    ) -> Self {
        Self {
            id,
            addr,
            client_info: defaults.client_info.clone(),
            header_version: HEADER_VERSION_1,
            last_sent_timestamp: 0.0,
            last_tracking_timestamp: 0.0,
            send_timeout: defaults.send_timeout,
            receive_timeout: defaults.receive_timeout,
            connected_at: Instant::now(),
            writer: Arc::new(Mutex::new(writer)),
            receiver,
        }
    }

    /// Control flags of this session's receive loop.
    pub fn receiver(&self) -> Arc<LoopControl> {
        Arc::clone(&self.receiver)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            addr: self.addr,
            client_info: self.client_info.clone(),
            header_version: self.header_version,
            last_sent_timestamp: self.last_sent_timestamp,
            connected_at: self.connected_at,
        }
    }

    pub fn send_target(&self) -> SendTarget {
        SendTarget {
            id: self.id,
            client_info: self.client_info.clone(),
            header_version: self.header_version,
            last_sent_timestamp: self.last_sent_timestamp,
            last_tracking_timestamp: self.last_tracking_timestamp,
            send_timeout: self.send_timeout,
            writer: Arc::clone(&self.writer),
        }
    }

    /// Closes the write side of the socket. Errors are logged, not returned.
    pub async fn shutdown(self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            log::debug!("Client {}: socket close failed: {}", self.id, e);
        }
    }
}

/// Read-only copy of a session for callers outside the registry lock.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub id: u32,
    pub addr: SocketAddr,
    pub client_info: ClientInfo,
    pub header_version: u16,
    pub last_sent_timestamp: f64,
    pub connected_at: Instant,
}

/// Everything the broadcast loop needs to stream to one client without
/// holding the registry lock during IO.
#[derive(Clone)]
pub struct SendTarget {
    pub id: u32,
    pub client_info: ClientInfo,
    pub header_version: u16,
    pub last_sent_timestamp: f64,
    pub last_tracking_timestamp: f64,
    pub send_timeout: Duration,
    writer: Arc<Mutex<ClientWriter>>,
}

impl SendTarget {
    /// Writes `bytes` in full within the session's send timeout.
    pub async fn send(&self, bytes: &[u8]) -> io::Result<()> {
        self.send_from(bytes, &AtomicUsize::new(0)).await
    }

    /// Writes `bytes[written..]` within the session's send timeout, advancing
    /// `written` as the peer accepts data. Calling again after a timeout
    /// continues where the last attempt stopped, so a message is never
    /// partially repeated on the wire.
    pub async fn send_from(&self, bytes: &[u8], written: &AtomicUsize) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        let write = async {
            let mut offset = written.load(Ordering::Acquire);
            while offset < bytes.len() {
                let n = writer.write(&bytes[offset..]).await?;
                if n == 0 {
                    return Err(io::Error::from(io::ErrorKind::WriteZero));
                }
                offset += n;
                written.store(offset, Ordering::Release);
            }
            writer.flush().await
        };
        match tokio::time::timeout(self.send_timeout, write).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!(
                    "send to client {} timed out after {} of {} bytes",
                    self.id,
                    written.load(Ordering::Acquire),
                    bytes.len()
                ),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn defaults() -> SessionDefaults {
        SessionDefaults {
            client_info: ClientInfo::default(),
            send_timeout: Duration::from_millis(100),
            receive_timeout: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn test_send_target_writes_to_socket() {
        let (server_side, mut client_side) = tokio::io::duplex(64);
        let session = ClientSession::new(
            7,
            "127.0.0.1:1".parse().unwrap(),
            Box::new(server_side),
            LoopControl::new(),
            &defaults(),
        );

        session.send_target().send(b"hello").await.unwrap();

        let mut buf = [0u8; 5];
        client_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_send_times_out_when_peer_stops_reading() {
        let (server_side, _client_side) = tokio::io::duplex(4);
        let session = ClientSession::new(
            8,
            "127.0.0.1:1".parse().unwrap(),
            Box::new(server_side),
            LoopControl::new(),
            &defaults(),
        );

        let err = session.send_target().send(&[0u8; 64]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_send_resumes_after_timeout() {
        let (server_side, mut client_side) = tokio::io::duplex(16);
        let session = ClientSession::new(
            10,
            "127.0.0.1:1".parse().unwrap(),
            Box::new(server_side),
            LoopControl::new(),
            &defaults(),
        );
        let target = session.send_target();
        let bytes: Vec<u8> = (0..40u8).collect();
        let written = AtomicUsize::new(0);

        let err = target.send_from(&bytes, &written).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert_eq!(written.load(Ordering::Acquire), 16);

        let mut first = [0u8; 16];
        client_side.read_exact(&mut first).await.unwrap();
        let mut rest = [0u8; 24];
        let (sent, read) = tokio::join!(
            target.send_from(&bytes, &written),
            client_side.read_exact(&mut rest)
        );
        sent.unwrap();
        read.unwrap();
        assert_eq!(written.load(Ordering::Acquire), 40);
        assert_eq!(&first[..], &bytes[..16]);
        assert_eq!(&rest[..], &bytes[16..]);
    }

    #[tokio::test]
    async fn test_shutdown_closes_peer() {
        let (server_side, mut client_side) = tokio::io::duplex(64);
        let session = ClientSession::new(
            9,
            "127.0.0.1:1".parse().unwrap(),
            Box::new(server_side),
            LoopControl::new(),
            &defaults(),
        );
        session.shutdown().await;

        let mut buf = Vec::new();
        assert_eq!(client_side.read_to_end(&mut buf).await.unwrap(), 0);
    }
}
