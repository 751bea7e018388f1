//! Peer directory
//!
//! Known peers, the services they advertise and the objects those services
//! contain, kept in a three-level [`PeerTree`]. The [`PeersTracker`] feeds
//! the tree from peer events on the message bus.
//!
//! Peer identities and service discovery are external collaborators,
//! reached through [`PeerDirectory`] and [`ServiceDiscovery`].

pub mod did;
mod tracker;
mod tree;

pub use tracker::{PeerEvent, PeersTracker};
pub use tree::{NodeId, PeerTree, RowKind, TreeEvent, TreeRow};

use std::collections::HashMap;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identity of a known peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerContext {
    pub peer_id: String,
    pub did: String,
    /// Short space handle; empty when unknown
    #[serde(default)]
    pub handle: String,
    #[serde(default)]
    pub validated: bool,
}

impl PeerContext {
    pub fn new(peer_id: impl Into<String>, did: impl Into<String>, handle: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            did: did.into(),
            handle: handle.into(),
            validated: false,
        }
    }
}

/// A service advertised by a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceEntry {
    /// Service DID URL
    pub id: String,
    /// Whether the service holds objects of its own
    #[serde(default)]
    pub container: bool,
    #[serde(rename = "type", default)]
    pub service_type: Option<String>,
}

/// An object held by a container service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainedObject {
    pub id: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Peer id to peer identity.
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    async fn get_by_peer_id(&self, peer_id: &str) -> Option<PeerContext>;
}

/// Streams of what peers currently advertise.
///
/// Entries are raw JSON; malformed ones are skipped by the consumer.
pub trait ServiceDiscovery: Send + Sync {
    fn discover_services(&self, peer: &PeerContext) -> BoxStream<'static, Value>;

    fn contained(&self, peer: &PeerContext, service: &ServiceEntry) -> BoxStream<'static, Value>;
}

/// In-memory directory and discovery source.
#[derive(Default)]
pub struct MemoryDirectory {
    peers: RwLock<HashMap<String, PeerContext>>,
    services: RwLock<HashMap<String, Vec<Value>>>,
    objects: RwLock<HashMap<String, Vec<Value>>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_peer(&self, peer: PeerContext) {
        self.peers.write().insert(peer.peer_id.clone(), peer);
    }

    pub fn remove_peer(&self, peer_id: &str) -> Option<PeerContext> {
        self.services.write().remove(peer_id);
        self.peers.write().remove(peer_id)
    }

    /// Replace what `peer_id` advertises.
    pub fn set_services(&self, peer_id: &str, services: Vec<Value>) {
        self.services.write().insert(peer_id.to_string(), services);
    }

    /// Replace the objects held by service `service_id`.
    pub fn set_contained(&self, service_id: &str, objects: Vec<Value>) {
        self.objects.write().insert(service_id.to_string(), objects);
    }
}

#[async_trait]
impl PeerDirectory for MemoryDirectory {
    async fn get_by_peer_id(&self, peer_id: &str) -> Option<PeerContext> {
        self.peers.read().get(peer_id).cloned()
    }
}

impl ServiceDiscovery for MemoryDirectory {
    fn discover_services(&self, peer: &PeerContext) -> BoxStream<'static, Value> {
        let entries = self
            .services
            .read()
            .get(&peer.peer_id)
            .cloned()
            .unwrap_or_default();
        stream::iter(entries).boxed()
    }

    fn contained(&self, _peer: &PeerContext, service: &ServiceEntry) -> BoxStream<'static, Value> {
        let entries = self.objects.read().get(&service.id).cloned().unwrap_or_default();
        stream::iter(entries).boxed()
    }
}
