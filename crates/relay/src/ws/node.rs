// Per-node registry of live connections and peer sessions.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use quire_common::protocol::ws::ServerMessage;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::RelayConfig,
    metrics::RelayMetrics,
    sync::{
        peer::{LocalUpdateSender, PeerAdapter, PeerError, PeerKey},
        repository::{DocumentRepository, PresenceSubscription},
    },
};

pub type ConnectionId = Uuid;
pub type OutboundSender = mpsc::UnboundedSender<ServerMessage>;

struct PeerSlot {
    owner: ConnectionId,
    adapter: Box<dyn PeerAdapter>,
}

/// One relay process. Owns the connection registry and the peer sessions
/// opened on behalf of its connections; several nodes may share one presence
/// backend.
pub struct RelayNode {
    id: String,
    config: RelayConfig,
    repository: Arc<DocumentRepository>,
    metrics: Arc<RelayMetrics>,
    connections: Mutex<HashMap<ConnectionId, OutboundSender>>,
    peers: Mutex<HashMap<PeerKey, PeerSlot>>,
    presence_subscription: Mutex<Option<PresenceSubscription>>,
}

impl RelayNode {
    /// Builds the node and starts forwarding presence deltas from the bus to
    /// every connection it holds.
    pub fn new(
        config: RelayConfig,
        repository: Arc<DocumentRepository>,
        metrics: Arc<RelayMetrics>,
    ) -> Arc<Self> {
        let node = Arc::new(Self {
            id: format!("ws-node-{}", Uuid::new_v4()),
            config,
            repository,
            metrics,
            connections: Mutex::new(HashMap::new()),
            peers: Mutex::new(HashMap::new()),
            presence_subscription: Mutex::new(None),
        });

        let weak = Arc::downgrade(&node);
        let subscription = node.repository.add_presence_listener(move |delta| {
            if let Some(node) = weak.upgrade() {
                node.broadcast(&ServerMessage::from(delta.clone()));
            }
        });
        *node.presence_subscription.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(subscription);

        info!(node_id = %node.id, "relay node ready");
        node
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn repository(&self) -> &Arc<DocumentRepository> {
        &self.repository
    }

    pub fn metrics(&self) -> &Arc<RelayMetrics> {
        &self.metrics
    }

    pub fn register_connection(&self, connection_id: ConnectionId, outbound: OutboundSender) {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(connection_id, outbound);
        self.metrics.connection_opened();
    }

    /// Returns `false` when the connection was already gone.
    pub fn deregister_connection(&self, connection_id: ConnectionId) -> bool {
        let removed = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&connection_id)
            .is_some();
        if removed {
            self.metrics.connection_closed();
        }
        removed
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Queues `message` for every connection on this node, the sender
    /// included. Connections whose writer is gone are skipped.
    pub fn broadcast(&self, message: &ServerMessage) -> usize {
        let connections = self.connections.lock().unwrap_or_else(PoisonError::into_inner);
        connections.values().filter(|outbound| outbound.send(message.clone()).is_ok()).count()
    }

    /// Opens the peer session for `key` on behalf of `owner`.
    ///
    /// A session already held by another connection is closed first: the most
    /// recent connection for a (document, agent) pair wins. Re-opening a key
    /// the owner already holds is a no-op.
    pub fn open_peer(
        &self,
        owner: ConnectionId,
        key: PeerKey,
        updates: LocalUpdateSender,
    ) -> Result<(), PeerError> {
        let mut peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(slot) = peers.get(&key) {
            if slot.owner == owner && slot.adapter.is_open() {
                return Ok(());
            }
        }
        if let Some(mut previous) = peers.remove(&key) {
            debug!(peer = %key, previous_owner = %previous.owner, "taking over peer session");
            self.close_slot(&mut previous);
        }

        let mut adapter = self.repository.peer_registry().attach(key.clone(), updates);
        adapter.open()?;
        self.metrics.peer_session_opened();
        peers.insert(key, PeerSlot { owner, adapter });
        Ok(())
    }

    /// Hands an inbound sync message to the session `owner` holds for `key`.
    /// Returns `Ok(false)` when the connection holds no such session.
    pub fn deliver_to_peer(
        &self,
        owner: ConnectionId,
        key: &PeerKey,
        message: &Value,
    ) -> Result<bool, PeerError> {
        let mut peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
        match peers.get_mut(key) {
            Some(slot) if slot.owner == owner => {
                slot.adapter.receive_remote_update(message)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Closes the session for `key` if `owner` holds it.
    pub fn close_peer(&self, owner: ConnectionId, key: &PeerKey) -> bool {
        let mut peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
        if !peers.get(key).is_some_and(|slot| slot.owner == owner) {
            return false;
        }
        match peers.remove(key) {
            Some(mut slot) => {
                self.close_slot(&mut slot);
                true
            }
            None => false,
        }
    }

    /// Closes every session `owner` holds and returns how many were closed.
    pub fn close_peers_owned_by(&self, owner: ConnectionId) -> usize {
        let mut peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
        let owned: Vec<PeerKey> =
            peers.iter().filter(|(_, slot)| slot.owner == owner).map(|(key, _)| key.clone()).collect();
        for key in &owned {
            if let Some(mut slot) = peers.remove(key) {
                self.close_slot(&mut slot);
            }
        }
        owned.len()
    }

    pub fn peer_owner(&self, key: &PeerKey) -> Option<ConnectionId> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner).get(key).map(|slot| slot.owner)
    }

    pub fn peer_session_count(&self) -> usize {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn close_slot(&self, slot: &mut PeerSlot) {
        if let Err(error) = slot.adapter.close() {
            warn!(peer = %slot.adapter.key(), error = %error, "peer session close failed");
        }
        self.metrics.peer_session_closed();
    }
}
