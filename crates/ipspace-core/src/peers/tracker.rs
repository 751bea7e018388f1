//! Peer tracker
//!
//! Keeps the [`PeerTree`] in step with peer events published on the
//! message bus under `g/peers/*`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{PeerContext, PeerDirectory, PeerTree};
use crate::pubsub::key::{key_peer_added, key_peer_did_modified, key_peer_logout, key_peer_modified};
use crate::pubsub::{Delivery, DispatchTable, KeyListener, TopicKey};

/// Payload of a `g/peers/*` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEvent {
    pub peer_id: String,
    /// For DID modifications: whether the DID document actually changed
    #[serde(default)]
    pub modified: bool,
}

impl PeerEvent {
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            modified: false,
        }
    }

    pub fn did_modified(peer_id: impl Into<String>, modified: bool) -> Self {
        Self {
            peer_id: peer_id.into(),
            modified,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({ "peer_id": self.peer_id, "modified": self.modified })
    }
}

pub struct PeersTracker {
    directory: Arc<dyn PeerDirectory>,
    tree: Arc<PeerTree>,
}

impl PeersTracker {
    pub fn new(directory: Arc<dyn PeerDirectory>, tree: Arc<PeerTree>) -> Self {
        Self { directory, tree }
    }

    pub fn tree(&self) -> &Arc<PeerTree> {
        &self.tree
    }

    /// Look the peer up in the directory and add it to the tree.
    pub async fn on_peer_added(&self, peer_id: &str) {
        match self.directory.get_by_peer_id(peer_id).await {
            Some(ctx) => self.add_peer_to_model(ctx).await,
            None => debug!(peer = %peer_id, "Unknown peer, not tracked"),
        }
    }

    pub async fn on_peer_modified(&self, peer_id: &str) {
        debug!(peer = %peer_id, "Peer modified");
    }

    /// Rediscover the services of a peer whose DID document changed.
    pub async fn on_peer_did_modified(&self, peer_id: &str, modified: bool) {
        if !modified {
            return;
        }
        if self.tree.refresh_peer(peer_id).await.is_none() {
            debug!(peer = %peer_id, "DID modified for a peer not in the tree");
        }
    }

    pub async fn on_peer_logout(&self, peer_id: &str) {
        self.tree.remove_peer(peer_id).await;
    }

    pub async fn add_peer_to_model(&self, ctx: PeerContext) {
        self.tree.add_peer(ctx).await;
    }

    fn decode(delivery: &Delivery) -> Option<PeerEvent> {
        match serde_json::from_value::<PeerEvent>((*delivery.payload).clone()) {
            Ok(event) => Some(event),
            Err(e) => {
                debug!(key = %delivery.key, error = %e, "Malformed peer event");
                None
            }
        }
    }

    async fn event_peers_added(self: Arc<Self>, delivery: Delivery) {
        if let Some(event) = Self::decode(&delivery) {
            self.on_peer_added(&event.peer_id).await;
        }
    }

    async fn event_peers_modified(self: Arc<Self>, delivery: Delivery) {
        if let Some(event) = Self::decode(&delivery) {
            self.on_peer_modified(&event.peer_id).await;
        }
    }

    async fn event_peers_did_modified(self: Arc<Self>, delivery: Delivery) {
        if let Some(event) = Self::decode(&delivery) {
            self.on_peer_did_modified(&event.peer_id, event.modified).await;
        }
    }

    async fn event_peers_logout(self: Arc<Self>, delivery: Delivery) {
        if let Some(event) = Self::decode(&delivery) {
            self.on_peer_logout(&event.peer_id).await;
        }
    }
}

impl KeyListener for PeersTracker {
    fn dispatch_table() -> DispatchTable<Self> {
        DispatchTable::new()
            .on(&key_peer_added(), Self::event_peers_added)
            .on(&key_peer_modified(), Self::event_peers_modified)
            .on(&key_peer_did_modified(), Self::event_peers_did_modified)
            .on(&key_peer_logout(), Self::event_peers_logout)
    }

    fn listen_keys(&self) -> Vec<TopicKey> {
        vec![
            key_peer_added(),
            key_peer_modified(),
            key_peer_did_modified(),
            key_peer_logout(),
        ]
    }
}
