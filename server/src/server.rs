//! Composition root: owns the loops, the shared registry and the queues.

use crate::acceptor::run_acceptor;
use crate::broadcast::{BroadcastScheduler, BroadcastSettings};
use crate::client_registry::{disconnect_client, ClientRegistry, SharedRegistry};
use crate::command::{CommandProcessor, CommandRegistry};
use crate::config::ServerConfig;
use crate::control::LoopControl;
use crate::error::ServerError;
use crate::frame::FrameSource;
use crate::pending::PendingMessageQueue;
use crate::receiver::ReceiveContext;
use crate::resource::{FileResourceLoader, ResourceLoader};
use crate::session::{SessionDefaults, SessionSnapshot};
use log::{debug, info};
use shared::Message;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Streaming server. `start` and `stop` must not be called concurrently.
pub struct Server {
    resource_loader: Option<Arc<dyn ResourceLoader>>,
    running: Option<RunningServer>,
}

struct RunningServer {
    local_addr: SocketAddr,
    channel_id: String,
    registry: SharedRegistry,
    pending: Arc<PendingMessageQueue>,
    acceptor: Arc<LoopControl>,
    broadcaster: Arc<LoopControl>,
    processor: CommandProcessor,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub fn new() -> Self {
        Self {
            resource_loader: None,
            running: None,
        }
    }

    /// Replaces the loader used for `GET_POLYDATA` requests. Without one, a
    /// [`FileResourceLoader`] rooted at the configured resource directory is
    /// used.
    pub fn with_resource_loader(mut self, loader: Arc<dyn ResourceLoader>) -> Self {
        self.resource_loader = Some(loader);
        self
    }

    /// Validates `config`, binds the listening port and starts the accept and
    /// broadcast loops. Returns the bound address.
    pub async fn start(
        &mut self,
        source: Arc<dyn FrameSource>,
        commands: CommandRegistry,
        config: ServerConfig,
    ) -> Result<SocketAddr, ServerError> {
        if self.running.is_some() {
            return Err(ServerError::AlreadyRunning);
        }
        config.validate()?;
        if source.channel_id() != config.output_channel_id {
            return Err(ServerError::InvalidConfig(format!(
                "frame source provides channel '{}' but OutputChannelId is '{}'",
                source.channel_id(),
                config.output_channel_id
            )));
        }

        let listener = TcpListener::bind(("0.0.0.0", config.listening_port))
            .await
            .map_err(|source| ServerError::Bind {
                port: config.listening_port,
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let registry = ClientRegistry::shared();
        let pending = Arc::new(PendingMessageQueue::new());
        debug!("Registered commands: {:?}", commands.names());
        let (processor, queue, responses) = CommandProcessor::start(commands);

        let resources = match &self.resource_loader {
            Some(loader) => Arc::clone(loader),
            None => Arc::new(FileResourceLoader::new(config.resource_directory.clone())),
        };
        let context = ReceiveContext {
            registry: Arc::clone(&registry),
            pending: Arc::clone(&pending),
            commands: queue.clone(),
            resources,
            crc_check: config.crc_check_enabled,
        };
        let defaults = SessionDefaults {
            client_info: config.default_client_info(),
            send_timeout: config.client_send_timeout(),
            receive_timeout: config.client_receive_timeout(),
        };

        let scheduler = BroadcastScheduler::new(
            Arc::clone(&registry),
            Arc::clone(&pending),
            responses,
            queue,
            source,
            BroadcastSettings::from(&config),
        );

        let acceptor = LoopControl::new();
        let acceptor_guard = acceptor.stopped_guard();
        tokio::spawn(run_acceptor(
            listener,
            defaults,
            context,
            Arc::clone(&acceptor),
            acceptor_guard,
        ));

        let broadcaster = LoopControl::new();
        let broadcaster_guard = broadcaster.stopped_guard();
        tokio::spawn(scheduler.run(Arc::clone(&broadcaster), broadcaster_guard));

        info!(
            "Server started on {} for channel '{}'",
            local_addr, config.output_channel_id
        );
        self.running = Some(RunningServer {
            local_addr,
            channel_id: config.output_channel_id,
            registry,
            pending,
            acceptor,
            broadcaster,
            processor,
        });
        Ok(local_addr)
    }

    /// Stops accepting, stops broadcasting, then disconnects every client.
    /// Does nothing if the server is not running.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.acceptor.stop().await;
        running.broadcaster.stop().await;

        let ids = running.registry.read().await.ids();
        {
            // every receive loop starts winding down before we wait on any
            let registry = running.registry.read().await;
            for client_id in &ids {
                if let Some(receiver) = registry.receiver(*client_id) {
                    receiver.request_stop();
                }
            }
        }
        for client_id in ids {
            disconnect_client(&running.registry, client_id).await;
        }
        running.pending.take_all().await;
        running.processor.shutdown();
        info!("Server for channel '{}' stopped", running.channel_id);
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    pub async fn connected_client_count(&self) -> usize {
        match &self.running {
            Some(running) => running.registry.read().await.len(),
            None => 0,
        }
    }

    pub async fn client_ids(&self) -> Vec<u32> {
        match &self.running {
            Some(running) => running.registry.read().await.ids(),
            None => Vec::new(),
        }
    }

    pub async fn client_info(&self, client_id: u32) -> Option<SessionSnapshot> {
        let running = self.running.as_ref()?;
        running.registry.read().await.snapshot(client_id)
    }

    /// Queues `message` for delivery to `client_id` on the next broadcast
    /// tick, packed with the client's negotiated header version.
    pub async fn queue_message_response(
        &self,
        client_id: u32,
        message: &Message,
    ) -> Result<(), ServerError> {
        let running = self
            .running
            .as_ref()
            .ok_or(ServerError::UnknownClient(client_id))?;
        let version = running
            .registry
            .read()
            .await
            .header_version(client_id)
            .ok_or(ServerError::UnknownClient(client_id))?;
        let message = message.clone().with_version(version);
        running.pending.push(client_id, &message).await?;
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.acceptor.request_stop();
            running.broadcaster.request_stop();
            if let Ok(registry) = running.registry.try_read() {
                for client_id in registry.ids() {
                    if let Some(receiver) = registry.receiver(client_id) {
                        receiver.request_stop();
                    }
                }
            }
            running.processor.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameBuffer;
    use shared::{MessageBody, StatusBody};

    fn source(channel: &str) -> Arc<dyn FrameSource> {
        Arc::new(FrameBuffer::new(channel, 10))
    }

    #[tokio::test]
    async fn test_start_then_stop() {
        let mut server = Server::new();
        assert!(!server.is_running());

        let addr = server
            .start(
                source("Tracker"),
                CommandRegistry::new(),
                ServerConfig::new(0, "Tracker"),
            )
            .await
            .unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(server.local_addr(), Some(addr));
        assert_eq!(server.connected_client_count().await, 0);

        server.stop().await;
        assert!(!server.is_running());
        assert!(server.local_addr().is_none());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let mut server = Server::new();
        server
            .start(
                source("Tracker"),
                CommandRegistry::new(),
                ServerConfig::new(0, "Tracker"),
            )
            .await
            .unwrap();

        let again = server
            .start(
                source("Tracker"),
                CommandRegistry::new(),
                ServerConfig::new(0, "Tracker"),
            )
            .await;
        assert!(matches!(again, Err(ServerError::AlreadyRunning)));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_channel_mismatch_is_a_config_error() {
        let mut server = Server::new();
        let result = server
            .start(
                source("Video"),
                CommandRegistry::new(),
                ServerConfig::new(0, "Tracker"),
            )
            .await;
        assert!(matches!(result, Err(ServerError::InvalidConfig(_))));
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_queue_for_unknown_client_fails() {
        let mut server = Server::new();
        let message = Message::new("", MessageBody::Status(StatusBody::ok()));
        assert!(matches!(
            server.queue_message_response(7, &message).await,
            Err(ServerError::UnknownClient(7))
        ));

        server
            .start(
                source("Tracker"),
                CommandRegistry::new(),
                ServerConfig::new(0, "Tracker"),
            )
            .await
            .unwrap();
        assert!(matches!(
            server.queue_message_response(u32::MAX, &message).await,
            Err(ServerError::UnknownClient(_))
        ));
        assert!(server.client_info(u32::MAX).await.is_none());
        server.stop().await;
    }
}
