//! Registry of live client connections and control broadcasts.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::Utf8Bytes;
use dashmap::DashMap;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::auth::Identity;
use crate::protocol::server::ServerMessage;
use crate::restart::{RestartState, RestartTransition};

/// Size of the per-connection send buffer.
const CONNECTION_BUFFER_SIZE: usize = 64;

pub type ConnectionId = u64;

/// Pre-serialized text frames queued for one connection.
pub type OutboundSender = mpsc::Sender<Utf8Bytes>;

/// Sending side of one registered connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    identity: Identity,
    sender: OutboundSender,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, identity: Identity, sender: OutboundSender) -> Self {
        Self {
            id,
            identity,
            sender,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Queue a frame, waiting for buffer space. Returns false once the connection is gone.
    pub async fn send<T: Serialize>(&self, message: &T) -> bool {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to serialize frame for connection {}: {}", self.id, e);
                return true;
            }
        };
        self.sender.send(Utf8Bytes::from(text)).await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

#[derive(Debug)]
struct ConnectionEntry {
    identity: Identity,
    sender: OutboundSender,
}

/// All authenticated connections, keyed by connection id.
#[derive(Debug, Default)]
pub struct Gateway {
    connections: DashMap<ConnectionId, ConnectionEntry>,
    next_id: AtomicU64,
}

impl Gateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an authenticated connection.
    ///
    /// Returns its handle and the receiver the connection's writer drains.
    pub fn register(&self, identity: Identity) -> (ConnectionHandle, mpsc::Receiver<Utf8Bytes>) {
        let (tx, rx) = mpsc::channel(CONNECTION_BUFFER_SIZE);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            "Registered connection {} for user {} (role {})",
            id, identity.user_id, identity.user_role
        );
        self.connections.insert(
            id,
            ConnectionEntry {
                identity: identity.clone(),
                sender: tx.clone(),
            },
        );
        (ConnectionHandle::new(id, identity, tx), rx)
    }

    /// Remove a connection. Safe to call more than once.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        match self.connections.remove(&id) {
            Some((_, entry)) => {
                info!(
                    "Unregistered connection {} for user {}",
                    id, entry.identity.user_id
                );
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn identity(&self, id: ConnectionId) -> Option<Identity> {
        self.connections.get(&id).map(|entry| entry.identity.clone())
    }

    /// Offer a message to every connection without waiting.
    ///
    /// Serialized once. Connections whose buffer is full or closed are skipped.
    /// Returns how many connections accepted the frame.
    pub fn broadcast(&self, message: &ServerMessage) -> usize {
        let text = match serde_json::to_string(message) {
            Ok(text) => Utf8Bytes::from(text),
            Err(e) => {
                warn!("Failed to serialize broadcast: {}", e);
                return 0;
            }
        };

        let mut delivered = 0;
        for entry in self.connections.iter() {
            match entry.value().sender.try_send(text.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => debug!("Skipping connection {} for broadcast: {}", entry.key(), e),
            }
        }
        debug!(
            "Broadcast delivered to {}/{} connections",
            delivered,
            self.connections.len()
        );
        delivered
    }

    /// Forward restart transitions to every connection until the state is dropped.
    pub fn spawn_restart_relay(self: &Arc<Self>, restart: &RestartState) -> JoinHandle<()> {
        let gateway = Arc::clone(self);
        let mut transitions = restart.subscribe();
        tokio::spawn(async move {
            loop {
                let message = match transitions.recv().await {
                    Ok(RestartTransition::Restarting) => ServerMessage::RuntimeRestarting,
                    Ok(RestartTransition::Ready) => ServerMessage::RuntimeReady,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Restart relay lagged by {} transitions", n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                gateway.broadcast(&message);
            }
        })
    }
}
