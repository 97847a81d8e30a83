//! Registry of connected client sessions.
//!
//! This module owns the connect/disconnect lifecycle of client sessions:
//! - Id assignment from a process-wide counter, never reused
//! - Per-session subscription and version updates from the receive loops
//! - Snapshots for the broadcast loop, which does its IO outside the lock
//!
//! The registry itself is a plain map; callers share it as [`SharedRegistry`]
//! and keep each lock span to a copy or a single field update.

use crate::control::LoopControl;
use crate::session::{ClientSession, ClientWriter, SendTarget, SessionDefaults, SessionSnapshot};
use log::info;
use shared::ClientInfo;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

pub type SharedRegistry = Arc<RwLock<ClientRegistry>>;

/// Shared across every registry in the process so that ids stay unique even
/// when a server is stopped and started again.
static NEXT_CLIENT_ID: AtomicU32 = AtomicU32::new(1);

fn next_client_id() -> u32 {
    NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed)
}

/// All connected clients, indexed by id.
#[derive(Default)]
pub struct ClientRegistry {
    clients: HashMap<u32, ClientSession>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedRegistry {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Registers a new connection and returns its id together with the
    /// control flags its receive loop must run under.
    pub fn add_client(
        &mut self,
        addr: SocketAddr,
        writer: ClientWriter,
        defaults: &SessionDefaults,
    ) -> (u32, Arc<LoopControl>) {
        let client_id = next_client_id();
        let receiver = LoopControl::new();
        let session = ClientSession::new(client_id, addr, writer, Arc::clone(&receiver), defaults);

        info!("Client {} connected from {}", client_id, addr);
        self.clients.insert(client_id, session);
        (client_id, receiver)
    }

    /// Removes a session and hands it back for socket cleanup. Returns `None`
    /// if it was already gone, so cleanup happens at most once.
    pub fn remove_client(&mut self, client_id: u32) -> Option<ClientSession> {
        let session = self.clients.remove(&client_id)?;
        info!(
            "Client {} disconnected ({} remaining)",
            client_id,
            self.clients.len()
        );
        Some(session)
    }

    pub fn contains(&self, client_id: u32) -> bool {
        self.clients.contains_key(&client_id)
    }

    pub fn snapshot(&self, client_id: u32) -> Option<SessionSnapshot> {
        self.clients.get(&client_id).map(ClientSession::snapshot)
    }

    pub fn receiver(&self, client_id: u32) -> Option<Arc<LoopControl>> {
        self.clients.get(&client_id).map(ClientSession::receiver)
    }

    pub fn header_version(&self, client_id: u32) -> Option<u16> {
        self.clients.get(&client_id).map(|s| s.header_version)
    }

    /// Sorted ids of every connected client.
    pub fn ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.clients.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Copies of everything needed to stream to each client, in id order.
    pub fn targets(&self) -> Vec<SendTarget> {
        let mut targets: Vec<SendTarget> =
            self.clients.values().map(ClientSession::send_target).collect();
        targets.sort_unstable_by_key(|t| t.id);
        targets
    }

    /// Replaces a client's subscription. Whether tracking data was requested
    /// is owned by the start/stop messages and survives the update.
    pub fn update_client_info(&mut self, client_id: u32, mut client_info: ClientInfo) -> bool {
        match self.clients.get_mut(&client_id) {
            Some(session) => {
                client_info.tdata_requested = session.client_info.tdata_requested;
                session.client_info = client_info;
                true
            }
            None => false,
        }
    }

    /// Turns tracking data on (with the requested resolution) or off.
    pub fn set_tracking(&mut self, client_id: u32, requested: bool, resolution_ms: u32) -> bool {
        match self.clients.get_mut(&client_id) {
            Some(session) => {
                session.client_info.tdata_requested = requested;
                if requested {
                    session.client_info.resolution_ms = resolution_ms;
                }
                true
            }
            None => false,
        }
    }

    pub fn set_header_version(&mut self, client_id: u32, version: u16) -> bool {
        match self.clients.get_mut(&client_id) {
            Some(session) => {
                session.header_version = version;
                true
            }
            None => false,
        }
    }

    /// Writes back the streaming watermarks the broadcast loop advanced.
    pub fn record_sent(&mut self, target: &SendTarget) {
        if let Some(session) = self.clients.get_mut(&target.id) {
            session.last_sent_timestamp = target.last_sent_timestamp;
            session.last_tracking_timestamp = target.last_tracking_timestamp;
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

/// Stops a client's receive loop, waits until it has observably exited,
/// then removes the session and closes its socket. The registry lock is never
/// held while waiting or doing socket IO. Returns false if the client was
/// already gone.
pub async fn disconnect_client(registry: &SharedRegistry, client_id: u32) -> bool {
    let receiver = registry.read().await.receiver(client_id);
    if let Some(receiver) = receiver {
        receiver.stop().await;
    }
    let session = registry.write().await.remove_client(client_id);
    match session {
        Some(session) => {
            session.shutdown().await;
            true
        }
        None => false,
    }
}

/// Removes a client right away and asks its receive loop to stop. The socket
/// is closed by a background task once the loop has exited, so the caller
/// never waits on a slow peer. Returns false if the client was already gone.
pub async fn drop_client(registry: &SharedRegistry, client_id: u32) -> bool {
    let session = registry.write().await.remove_client(client_id);
    let Some(session) = session else {
        return false;
    };
    let receiver = session.receiver();
    receiver.request_stop();
    tokio::spawn(async move {
        receiver.wait_stopped().await;
        session.shutdown().await;
    });
    true
}
