//! Accept loop: turns incoming connections into registered sessions.

use crate::control::{LoopControl, StoppedGuard};
use crate::receiver::{run_receive_loop, ReceiveContext};
use crate::session::{ClientWriter, SessionDefaults};
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

/// Upper bound on how long a stop request goes unnoticed.
pub const ACCEPT_TIMEOUT: Duration = Duration::from_millis(200);

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Accepts connections until `control` is stopped, then drops the listener.
pub async fn run_acceptor(
    listener: TcpListener,
    defaults: SessionDefaults,
    context: ReceiveContext,
    control: Arc<LoopControl>,
    guard: StoppedGuard,
) {
    let _guard = guard;
    if let Ok(addr) = listener.local_addr() {
        info!("Accepting clients on {}", addr);
    }

    while control.is_running() {
        match timeout(ACCEPT_TIMEOUT, listener.accept()).await {
            Err(_) => continue,
            Ok(Ok((stream, addr))) => {
                register_connection(stream, addr, &defaults, &context).await;
            }
            Ok(Err(e)) => {
                warn!("Failed to accept connection: {}", e);
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }

    drop(listener);
    info!("Stopped accepting clients");
}

/// Registers an accepted TCP connection and starts its receive loop.
pub async fn register_connection(
    stream: TcpStream,
    addr: SocketAddr,
    defaults: &SessionDefaults,
    context: &ReceiveContext,
) -> u32 {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not disable Nagle for {}: {}", addr, e);
    }
    let (reader, writer) = stream.into_split();
    spawn_session(reader, Box::new(writer), addr, defaults, context).await
}

/// Adds a session for any reader/writer pair and spawns the receive loop
/// bound to it.
pub async fn spawn_session<R>(
    reader: R,
    writer: ClientWriter,
    addr: SocketAddr,
    defaults: &SessionDefaults,
    context: &ReceiveContext,
) -> u32
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (client_id, control) = context
        .registry
        .write()
        .await
        .add_client(addr, writer, defaults);
    let guard = control.stopped_guard();

    tokio::spawn(run_receive_loop(
        client_id,
        reader,
        defaults.receive_timeout,
        control,
        guard,
        context.clone(),
    ));
    client_id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_registry::ClientRegistry;
    use crate::command::{CommandProcessor, CommandRegistry};
    use crate::pending::PendingMessageQueue;
    use crate::resource::FileResourceLoader;
    use shared::{ClientInfo, Message, MessageBody};
    use std::cell::Cell;
    use std::marker::PhantomData;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncWriteExt, ReadBuf};

    fn context() -> (ReceiveContext, CommandProcessor) {
        let (processor, queue, _responses) = CommandProcessor::start(CommandRegistry::new());
        let context = ReceiveContext {
            registry: ClientRegistry::shared(),
            pending: Arc::new(PendingMessageQueue::new()),
            commands: queue,
            resources: Arc::new(FileResourceLoader::default()),
            crc_check: false,
        };
        (context, processor)
    }

    fn defaults() -> SessionDefaults {
        SessionDefaults {
            client_info: ClientInfo::default(),
            send_timeout: Duration::from_millis(200),
            receive_timeout: Duration::from_millis(50),
        }
    }

    async fn wait_for_clients(context: &ReceiveContext, count: usize) {
        for _ in 0..200 {
            if context.registry.read().await.len() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} clients", count);
    }

    #[tokio::test]
    async fn test_accepted_connections_are_registered_and_removed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (context, processor) = context();
        let control = LoopControl::new();
        let guard = control.stopped_guard();
        tokio::spawn(run_acceptor(
            listener,
            defaults(),
            context.clone(),
            Arc::clone(&control),
            guard,
        ));

        let first = TcpStream::connect(addr).await.unwrap();
        let second = TcpStream::connect(addr).await.unwrap();
        wait_for_clients(&context, 2).await;

        let ids = context.registry.read().await.ids();
        assert_ne!(ids[0], ids[1]);

        drop(first);
        wait_for_clients(&context, 1).await;
        drop(second);
        wait_for_clients(&context, 0).await;

        control.stop().await;
        processor.shutdown();
    }

    #[tokio::test]
    async fn test_stop_releases_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (context, processor) = context();
        let control = LoopControl::new();
        let guard = control.stopped_guard();
        tokio::spawn(run_acceptor(
            listener,
            defaults(),
            context,
            Arc::clone(&control),
            guard,
        ));

        control.stop().await;
        assert!(TcpStream::connect(addr).await.is_err());
        processor.shutdown();
    }

    /// Can move between threads but cannot be shared between them.
    struct UnsharedReader {
        inner: tokio::io::DuplexStream,
        _unshared: PhantomData<Cell<()>>,
    }

    impl AsyncRead for UnsharedReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    #[tokio::test]
    async fn test_session_runs_on_reader_without_sync() {
        let (context, processor) = context();
        let (server_side, mut peer) = tokio::io::duplex(1024);
        let reader = UnsharedReader {
            inner: server_side,
            _unshared: PhantomData,
        };

        let client_id = spawn_session(
            reader,
            Box::new(tokio::io::sink()),
            "127.0.0.1:1".parse().unwrap(),
            &defaults(),
            &context,
        )
        .await;

        let bytes = Message::new("", MessageBody::GetStatus).pack().unwrap();
        peer.write_all(&bytes).await.unwrap();
        for _ in 0..100 {
            if context.pending.len(client_id).await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(context.pending.len(client_id).await, 1);

        drop(peer);
        wait_for_clients(&context, 0).await;
        processor.shutdown();
    }
}
