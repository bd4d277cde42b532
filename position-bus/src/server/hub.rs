//! Connection registry and last-known-position cache.
//!
//! Both maps live behind one mutex so registration, snapshot replay and cache
//! updates for an identity never interleave.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
};

use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info};

use crate::{
    error::BusError,
    message::{Frame, WireMessage},
};

pub(crate) type ConnectionId = u64;

/// Server-side handle over one registered transport.
///
/// Frames pushed into `outbound` are written to the socket by that
/// connection's writer task. Dropping the handle closes the channel, which
/// ends the writer and with it the connection.
struct Connection {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    outbound: mpsc::UnboundedSender<Frame>,
}

#[derive(Default)]
struct HubState {
    connections: HashMap<String, Connection>,
    positions: HashMap<String, WireMessage>,
}

pub(crate) struct Hub {
    state: Mutex<HubState>,
    next_id: AtomicU64,
    debug_logs: bool,
}

impl Hub {
    pub(crate) fn new(debug_logs: bool) -> Self {
        Self {
            state: Mutex::new(HubState::default()),
            next_id: AtomicU64::new(1),
            debug_logs,
        }
    }

    pub(crate) fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers `identity` and replays the cached positions of every other
    /// identity into `outbound`. Returns the number of replayed records.
    pub(crate) async fn register(
        &self,
        identity: &str,
        id: ConnectionId,
        peer: Option<SocketAddr>,
        outbound: mpsc::UnboundedSender<Frame>,
    ) -> Result<usize, BusError> {
        let mut state = self.state.lock().await;

        if state.connections.contains_key(identity) {
            return Err(BusError::HandshakeConflict {
                identity: identity.to_string(),
            });
        }

        let mut replayed = 0;
        for (owner, message) in &state.positions {
            if owner == identity {
                continue;
            }
            if outbound.send(message.encode()).is_err() {
                break;
            }
            replayed += 1;
        }

        state.connections.insert(
            identity.to_string(),
            Connection {
                id,
                peer,
                outbound,
            },
        );
        Ok(replayed)
    }

    /// Caches `message` as the latest position of `identity`.
    pub(crate) async fn record_position(&self, identity: &str, message: &WireMessage) {
        let mut state = self.state.lock().await;
        state
            .positions
            .insert(identity.to_string(), message.clone());
    }

    /// Removes `identity` if it is still held by connection `id`.
    ///
    /// Returns `false` when the entry was already gone or belongs to a newer
    /// connection.
    pub(crate) async fn remove(&self, identity: &str, id: ConnectionId) -> bool {
        let mut state = self.state.lock().await;
        let held = state
            .connections
            .get(identity)
            .is_some_and(|connection| connection.id == id);
        if !held {
            return false;
        }

        if let Some(removed) = state.connections.remove(identity) {
            info!(peer = ?removed.peer, %identity, "connection removed from registry");
        }
        true
    }

    /// Hands `message` to every registered connection, sender included.
    ///
    /// Connections whose writer has gone away are dropped from the registry.
    /// Returns the number of connections the frame was handed to.
    pub(crate) async fn broadcast(&self, message: &WireMessage) -> usize {
        let frame = message.encode();
        let mut state = self.state.lock().await;

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (identity, connection) in &state.connections {
            if connection.outbound.send(frame).is_ok() {
                delivered += 1;
            } else {
                dead.push(identity.clone());
            }
        }

        for identity in dead {
            if let Some(removed) = state.connections.remove(&identity) {
                info!(peer = ?removed.peer, %identity, "dropping connection after failed write");
            }
        }

        if self.debug_logs {
            debug!(
                identity = message.identity(),
                position = message.position(),
                timestamp = message.timestamp(),
                delivered,
                "broadcast sent"
            );
        }
        delivered
    }

    /// Drops every connection handle, closing their transports.
    pub(crate) async fn close_all(&self) -> usize {
        let mut state = self.state.lock().await;
        let closed = state.connections.len();
        state.connections.clear();
        closed
    }

    pub(crate) async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.connections.clear();
        state.positions.clear();
    }

    pub(crate) async fn identities(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut identities: Vec<String> = state.connections.keys().cloned().collect();
        identities.sort();
        identities
    }

    pub(crate) async fn positions(&self) -> HashMap<String, WireMessage> {
        self.state.lock().await.positions.clone()
    }
}
