//! Per-client receive loop: reads requests, updates the session and queues
//! replies and commands.
//!
//! One loop runs per connected client. Every read is bounded by the session's
//! receive timeout and the stop flag is checked before each read, including
//! reads in the middle of a body, so the loop notices a stop request within
//! one timeout however slowly the peer writes.
//! Malformed or truncated messages are dropped and the loop carries on; only
//! a closed socket or a stop request ends it early.

use crate::client_registry::SharedRegistry;
use crate::command::reply::malformed_device_name_reply;
use crate::command::{xml_attribute, CommandQueue, CommandRequest, CommandStyle, RecentUids};
use crate::control::{LoopControl, StoppedGuard};
use crate::pending::PendingMessageQueue;
use crate::resource::{build_resource_reply, ResourceLoader};
use log::{debug, error, info, warn};
use shared::command_name::{device_name_prefix, is_command_device_name, parse_uid};
use shared::{
    Message, MessageBody, MessageHeader, MessageKind, RtsBody, StatusBody, HEADER_SIZE,
    HEADER_VERSION_1, MAX_BODY_SIZE, MAX_HEADER_VERSION,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

const SKIP_CHUNK_SIZE: usize = 64 * 1024;

/// Shared collaborators every receive loop talks to.
#[derive(Clone)]
pub struct ReceiveContext {
    pub registry: SharedRegistry,
    pub pending: Arc<PendingMessageQueue>,
    pub commands: CommandQueue,
    pub resources: Arc<dyn ResourceLoader>,
    pub crc_check: bool,
}

/// Why the loop must end in the middle of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupted {
    /// The peer closed the socket or it failed. The session is removed.
    Closed,
    /// The owner requested a stop. The session stays registered.
    Stopped,
}

type Step<T> = Result<T, Interrupted>;

enum BodyRead {
    Complete(Vec<u8>),
    /// Timed out after this many bytes
    Partial(usize),
}

/// Runs until `control` is stopped or the peer goes away. On a closed socket
/// the session removes itself from the registry.
pub async fn run_receive_loop<R>(
    client_id: u32,
    reader: R,
    receive_timeout: Duration,
    control: Arc<LoopControl>,
    guard: StoppedGuard,
    context: ReceiveContext,
) where
    R: AsyncRead + Unpin + Send,
{
    let _guard = guard;
    let mut receiver = ClientReceiver {
        client_id,
        reader,
        receive_timeout,
        control,
        context,
        recent: RecentUids::default(),
        header_version: HEADER_VERSION_1,
    };

    let mut header = [0u8; HEADER_SIZE];
    let mut filled = 0;
    let mut closed = false;

    while receiver.control.is_running() {
        match timeout(receive_timeout, receiver.reader.read(&mut header[filled..])).await {
            Err(_) => continue,
            Ok(Ok(0)) => {
                info!("Client {} closed the connection", client_id);
                closed = true;
                break;
            }
            Ok(Ok(n)) => {
                filled += n;
                if filled < HEADER_SIZE {
                    continue;
                }
                filled = 0;
            }
            Ok(Err(e)) => {
                warn!("Client {}: socket read failed: {}", client_id, e);
                closed = true;
                break;
            }
        }

        let header = match MessageHeader::unpack(&header) {
            Ok(header) => header,
            Err(e) => {
                warn!("Client {}: could not decode header: {}", client_id, e);
                continue;
            }
        };
        match receiver.handle_message(header).await {
            Ok(()) => {}
            Err(Interrupted::Closed) => {
                closed = true;
                break;
            }
            Err(Interrupted::Stopped) => break,
        }
    }

    if closed {
        let session = receiver
            .context
            .registry
            .write()
            .await
            .remove_client(client_id);
        if let Some(session) = session {
            session.shutdown().await;
        }
        receiver.context.pending.forget(client_id).await;
        receiver.context.commands.forget_client(client_id);
    }
    debug!("Client {}: receive loop stopped", client_id);
}

struct ClientReceiver<R> {
    client_id: u32,
    reader: R,
    receive_timeout: Duration,
    control: Arc<LoopControl>,
    context: ReceiveContext,
    recent: RecentUids,
    header_version: u16,
}

impl<R> ClientReceiver<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn handle_message(&mut self, header: MessageHeader) -> Step<()> {
        self.negotiate_version(header.version).await;

        let Some(kind) = header.kind() else {
            warn!(
                "Client {}: unknown message type '{}', skipping {} bytes",
                self.client_id,
                header.type_name(),
                header.body_size
            );
            return self.skip(header.body_size).await;
        };
        debug!(
            "Client {}: received {} from '{}' ({} bytes)",
            self.client_id,
            kind.type_name(),
            header.device_name(),
            header.body_size
        );

        match kind {
            MessageKind::ClientInfo => self.on_client_info(&header).await,
            MessageKind::GetStatus => {
                self.skip(header.body_size).await?;
                self.queue_reply(Message::new("", MessageBody::Status(StatusBody::ok())))
                    .await;
                Ok(())
            }
            MessageKind::Status => self.skip(header.body_size).await,
            MessageKind::String if is_command_device_name(&header.device_name()) => {
                self.on_legacy_command(&header).await
            }
            MessageKind::Command => self.on_structured_command(&header).await,
            MessageKind::StartTrackingData => self.on_start_tracking(&header).await,
            MessageKind::StopTrackingData => {
                self.skip(header.body_size).await?;
                self.context
                    .registry
                    .write()
                    .await
                    .set_tracking(self.client_id, false, 0);
                info!("Client {}: tracking data stopped", self.client_id);
                self.queue_reply(Message::new(
                    header.device_name(),
                    MessageBody::RtsTrackingData(RtsBody { status: 1 }),
                ))
                .await;
                Ok(())
            }
            MessageKind::GetPolyData => self.on_resource_request(&header).await,
            other => {
                debug!(
                    "Client {}: ignoring {} message from '{}'",
                    self.client_id,
                    other.type_name(),
                    header.device_name()
                );
                self.skip(header.body_size).await
            }
        }
    }

    async fn negotiate_version(&mut self, declared: u16) {
        let version = declared.clamp(HEADER_VERSION_1, MAX_HEADER_VERSION);
        if version != self.header_version {
            self.header_version = version;
            self.context
                .registry
                .write()
                .await
                .set_header_version(self.client_id, version);
            debug!(
                "Client {}: header version {} negotiated",
                self.client_id, version
            );
        }
    }

    async fn on_client_info(&mut self, header: &MessageHeader) -> Step<()> {
        let Some(message) = self.read_message(header).await? else {
            return Ok(());
        };
        if let MessageBody::ClientInfo(info) = message.body {
            info!(
                "Client {}: subscribed to {} transforms, {} images, {} strings",
                self.client_id,
                info.transform_names.len(),
                info.image_streams.len(),
                info.string_names.len()
            );
            self.context
                .registry
                .write()
                .await
                .update_client_info(self.client_id, info);
        }
        Ok(())
    }

    async fn on_legacy_command(&mut self, header: &MessageHeader) -> Step<()> {
        let device_name = header.device_name();
        let Some(message) = self.read_message(header).await? else {
            return Ok(());
        };
        let Some(uid) = parse_uid(&device_name) else {
            warn!(
                "Client {}: malformed command device name '{}'",
                self.client_id, device_name
            );
            self.queue_reply(malformed_device_name_reply(self.header_version))
                .await;
            return Ok(());
        };
        let MessageBody::String(body) = message.body else {
            return Ok(());
        };

        let name = xml_attribute(&body.value, "Name").unwrap_or_default();
        self.submit(CommandRequest {
            client_id: self.client_id,
            uid,
            name,
            device_name: device_name_prefix(&device_name).to_string(),
            content: body.value,
            style: CommandStyle::Legacy,
        });
        Ok(())
    }

    async fn on_structured_command(&mut self, header: &MessageHeader) -> Step<()> {
        let Some(message) = self.read_message(header).await? else {
            return Ok(());
        };
        if let MessageBody::Command(body) = message.body {
            self.submit(CommandRequest {
                client_id: self.client_id,
                uid: body.command_id,
                name: body.command_name,
                device_name: message.device_name,
                content: body.content,
                style: CommandStyle::Structured,
            });
        }
        Ok(())
    }

    fn submit(&mut self, request: CommandRequest) {
        if !self.recent.insert(request.uid) {
            warn!(
                "Client {}: dropping duplicate command uid {} ('{}')",
                self.client_id, request.uid, request.name
            );
            return;
        }
        debug!(
            "Client {}: queuing command '{}' (uid {})",
            self.client_id, request.name, request.uid
        );
        if !self.context.commands.submit(request) {
            error!(
                "Client {}: command processor is not running",
                self.client_id
            );
        }
    }

    async fn on_start_tracking(&mut self, header: &MessageHeader) -> Step<()> {
        let Some(message) = self.read_message(header).await? else {
            return Ok(());
        };
        if let MessageBody::StartTrackingData(body) = message.body {
            self.context.registry.write().await.set_tracking(
                self.client_id,
                true,
                body.resolution_ms,
            );
            info!(
                "Client {}: tracking data started, resolution {} ms",
                self.client_id, body.resolution_ms
            );
            self.queue_reply(Message::new(
                message.device_name,
                MessageBody::RtsTrackingData(RtsBody { status: 1 }),
            ))
            .await;
        }
        Ok(())
    }

    async fn on_resource_request(&mut self, header: &MessageHeader) -> Step<()> {
        let Some(request) = self.read_message(header).await? else {
            return Ok(());
        };
        let loader = Arc::clone(&self.context.resources);
        let version = self.header_version;
        let fallback = request.device_name.clone();
        let loaded =
            tokio::task::spawn_blocking(move || build_resource_reply(&*loader, &request, version))
                .await;

        let reply = match loaded {
            Ok((reply, Ok(()))) => {
                debug!("Client {}: serving '{}'", self.client_id, fallback);
                reply
            }
            Ok((reply, Err(e))) => {
                warn!("Client {}: resource request failed: {}", self.client_id, e);
                reply
            }
            Err(e) => {
                error!("Client {}: resource loader failed: {}", self.client_id, e);
                Message::new(fallback, MessageBody::RtsPolyData(RtsBody { status: 0 }))
            }
        };
        self.queue_reply(reply).await;
        Ok(())
    }

    async fn queue_reply(&mut self, message: Message) {
        let message = message.with_version(self.header_version);
        if let Err(e) = self.context.pending.push(self.client_id, &message).await {
            error!(
                "Client {}: failed to queue {} reply: {}",
                self.client_id,
                message.kind().type_name(),
                e
            );
        }
    }

    /// Reads and decodes the body announced by `header`. `Ok(None)` means the
    /// message was dropped.
    async fn read_message(&mut self, header: &MessageHeader) -> Step<Option<Message>> {
        if header.body_size > MAX_BODY_SIZE {
            warn!(
                "Client {}: {} body of {} bytes is too large, skipping",
                self.client_id,
                header.type_name(),
                header.body_size
            );
            self.skip(header.body_size).await?;
            return Ok(None);
        }

        let size = header.body_size as usize;
        match self.read_body(size).await? {
            BodyRead::Complete(body) => {
                match Message::unpack_body(header, &body, self.context.crc_check) {
                    Ok(message) => Ok(Some(message)),
                    Err(e) => {
                        warn!(
                            "Client {}: could not unpack {} from '{}': {}",
                            self.client_id,
                            header.type_name(),
                            header.device_name(),
                            e
                        );
                        Ok(None)
                    }
                }
            }
            BodyRead::Partial(received) => {
                warn!(
                    "Client {}: {} body cut short ({} of {} bytes), dropping",
                    self.client_id,
                    header.type_name(),
                    received,
                    size
                );
                self.skip((size - received) as u64).await?;
                Ok(None)
            }
        }
    }

    async fn read_body(&mut self, size: usize) -> Step<BodyRead> {
        let mut body = vec![0u8; size];
        let mut filled = 0;
        while filled < size {
            self.check_running()?;
            match timeout(self.receive_timeout, self.reader.read(&mut body[filled..])).await {
                Err(_) => return Ok(BodyRead::Partial(filled)),
                Ok(Ok(0)) => return Err(Interrupted::Closed),
                Ok(Ok(n)) => filled += n,
                Ok(Err(e)) => {
                    debug!("Client {}: body read failed: {}", self.client_id, e);
                    return Err(Interrupted::Closed);
                }
            }
        }
        Ok(BodyRead::Complete(body))
    }

    /// Discards `remaining` bytes. Gives up quietly if the peer stalls.
    async fn skip(&mut self, mut remaining: u64) -> Step<()> {
        if remaining == 0 {
            return Ok(());
        }
        let mut scratch = vec![0u8; SKIP_CHUNK_SIZE.min(remaining as usize)];
        while remaining > 0 {
            self.check_running()?;
            let want = scratch.len().min(remaining as usize);
            match timeout(self.receive_timeout, self.reader.read(&mut scratch[..want])).await {
                Err(_) => {
                    debug!(
                        "Client {}: gave up skipping, {} bytes left",
                        self.client_id, remaining
                    );
                    return Ok(());
                }
                Ok(Ok(0)) => return Err(Interrupted::Closed),
                Ok(Ok(n)) => remaining -= n as u64,
                Ok(Err(_)) => return Err(Interrupted::Closed),
            }
        }
        Ok(())
    }

    fn check_running(&self) -> Step<()> {
        if self.control.is_running() {
            Ok(())
        } else {
            debug!(
                "Client {}: stop requested in the middle of a message",
                self.client_id
            );
            Err(Interrupted::Stopped)
        }
    }
}
