//! Peer tree
//!
//! Three levels: peers, the services each peer advertises, and the objects
//! held by container services. Nodes live in an arena and are addressed by
//! [`NodeId`]; a removed node's id never resolves again, even once its slot
//! is reused.
//!
//! One lock guards the whole arena and is held for structural reads and
//! writes only. Discovery streams are consumed outside of it, so every
//! discovered entry is re-validated against the current tree before it is
//! inserted.

use std::sync::Arc;

use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use super::did::display_path;
use super::{ContainedObject, PeerContext, ServiceDiscovery, ServiceEntry};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Stable handle of a tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

/// Structural change notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeEvent {
    /// Content changed; views should be rebuilt
    Reset,
    /// A peer and everything under it were removed
    PeerRemoved(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowKind {
    Peer,
    Service,
    ServiceObject,
}

/// One node of a flattened tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeRow {
    pub id: NodeId,
    pub depth: usize,
    pub kind: RowKind,
    /// Peer handle, or service path under the peer handle
    pub display: Option<String>,
    /// DID of a peer, id of a service or object
    pub ident: String,
}

#[derive(Debug, Clone)]
enum Item {
    Peer(PeerContext),
    Service(ServiceEntry),
    Object(ContainedObject),
}

impl Item {
    fn key(&self) -> &str {
        match self {
            Item::Peer(ctx) => &ctx.peer_id,
            Item::Service(service) => &service.id,
            Item::Object(obj) => &obj.id,
        }
    }
}

#[derive(Debug)]
struct Node {
    item: Item,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    node: Option<Node>,
}

// ═══════════════════════════════════════════════════════════════════════
// Arena
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct Arena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    peers: Vec<NodeId>,
}

impl Arena {
    fn get(&self, id: NodeId) -> Option<&Node> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_ref())
    }

    fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_mut())
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.node = Some(node);
                NodeId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                NodeId {
                    index,
                    generation: 0,
                }
            }
        }
    }

    fn children(&self, parent: Option<NodeId>) -> &[NodeId] {
        match parent {
            None => &self.peers,
            Some(id) => self.get(id).map(|n| n.children.as_slice()).unwrap_or(&[]),
        }
    }

    fn child_by_key(&self, parent: Option<NodeId>, key: &str) -> Option<NodeId> {
        self.children(parent)
            .iter()
            .copied()
            .find(|id| self.get(*id).is_some_and(|n| n.item.key() == key))
    }

    fn add_peer(&mut self, ctx: PeerContext) -> NodeId {
        let id = self.alloc(Node {
            item: Item::Peer(ctx),
            parent: None,
            children: Vec::new(),
        });
        self.peers.push(id);
        id
    }

    fn append(&mut self, parent: NodeId, item: Item) -> Option<NodeId> {
        self.get(parent)?;
        let id = self.alloc(Node {
            item,
            parent: Some(parent),
            children: Vec::new(),
        });
        if let Some(node) = self.get_mut(parent) {
            node.children.push(id);
        }
        Some(id)
    }

    /// Detach `id` and free its whole subtree.
    fn remove(&mut self, id: NodeId) -> bool {
        let Some(parent) = self.get(id).map(|n| n.parent) else {
            return false;
        };
        match parent {
            None => self.peers.retain(|p| *p != id),
            Some(parent) => {
                if let Some(node) = self.get_mut(parent) {
                    node.children.retain(|c| *c != id);
                }
            }
        }

        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            let slot = &mut self.slots[id.index as usize];
            if let Some(node) = slot.node.take() {
                stack.extend(node.children);
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(id.index);
            }
        }
        true
    }

    fn peer(&self, id: NodeId) -> Option<&PeerContext> {
        match &self.get(id)?.item {
            Item::Peer(ctx) => Some(ctx),
            _ => None,
        }
    }

    fn service_with_peer(&self, id: NodeId) -> Option<(PeerContext, ServiceEntry)> {
        let node = self.get(id)?;
        let Item::Service(service) = &node.item else {
            return None;
        };
        let peer = self.peer(node.parent?)?;
        Some((peer.clone(), service.clone()))
    }

    fn keys(&self, parent: Option<NodeId>) -> Vec<String> {
        self.children(parent)
            .iter()
            .filter_map(|id| self.get(*id))
            .map(|n| n.item.key().to_string())
            .collect()
    }

    fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.node.is_some()).count()
    }

    fn rows(&self) -> Vec<TreeRow> {
        let mut rows = Vec::new();
        for peer in &self.peers {
            self.collect_rows(*peer, 0, "", &mut rows);
        }
        rows
    }

    fn collect_rows(&self, id: NodeId, depth: usize, handle: &str, rows: &mut Vec<TreeRow>) {
        let Some(node) = self.get(id) else {
            return;
        };
        let (kind, display, ident, handle) = match &node.item {
            Item::Peer(ctx) => {
                let display = if ctx.handle.is_empty() {
                    "Unknown".to_string()
                } else {
                    ctx.handle.clone()
                };
                (RowKind::Peer, Some(display), ctx.did.clone(), ctx.handle.as_str())
            }
            Item::Service(service) => (
                RowKind::Service,
                display_path(handle, &service.id),
                service.id.clone(),
                handle,
            ),
            Item::Object(obj) => (
                RowKind::ServiceObject,
                display_path(handle, &obj.id),
                obj.id.clone(),
                handle,
            ),
        };
        rows.push(TreeRow {
            id,
            depth,
            kind,
            display,
            ident,
        });
        for child in &node.children {
            self.collect_rows(*child, depth + 1, handle, rows);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// PeerTree
// ═══════════════════════════════════════════════════════════════════════

/// Concurrent tree of known peers and their services.
pub struct PeerTree {
    arena: Mutex<Arena>,
    discovery: Arc<dyn ServiceDiscovery>,
    events: broadcast::Sender<TreeEvent>,
}

impl PeerTree {
    pub fn new(discovery: Arc<dyn ServiceDiscovery>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            arena: Mutex::new(Arena::default()),
            discovery,
            events,
        }
    }

    /// Subscribe to structural change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<TreeEvent> {
        self.events.subscribe()
    }

    fn notify(&self, event: TreeEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    /// Find a peer node by peer id.
    pub async fn peer_lookup(&self, peer_id: &str) -> Option<NodeId> {
        self.arena.lock().await.child_by_key(None, peer_id)
    }

    pub async fn peer_context(&self, id: NodeId) -> Option<PeerContext> {
        self.arena.lock().await.peer(id).cloned()
    }

    pub async fn peer_count(&self) -> usize {
        self.arena.lock().await.peers.len()
    }

    /// Number of live nodes at every level.
    pub async fn node_count(&self) -> usize {
        self.arena.lock().await.live()
    }

    /// Ids of the services known for `peer_id`.
    pub async fn service_ids(&self, peer_id: &str) -> Vec<String> {
        let arena = self.arena.lock().await;
        match arena.child_by_key(None, peer_id) {
            Some(peer) => arena.keys(Some(peer)),
            None => Vec::new(),
        }
    }

    /// Ids of the objects known for a service of `peer_id`.
    pub async fn object_ids(&self, peer_id: &str, service_id: &str) -> Vec<String> {
        let arena = self.arena.lock().await;
        let service = arena
            .child_by_key(None, peer_id)
            .and_then(|peer| arena.child_by_key(Some(peer), service_id));
        match service {
            Some(service) => arena.keys(Some(service)),
            None => Vec::new(),
        }
    }

    /// Insert a peer (or find the existing node for its id), then discover
    /// its services.
    pub async fn add_peer(&self, ctx: PeerContext) -> NodeId {
        let peer_id = ctx.peer_id.clone();
        let id = {
            let mut arena = self.arena.lock().await;
            match arena.child_by_key(None, &peer_id) {
                Some(id) => {
                    debug!(peer = %peer_id, "Peer already in tree");
                    id
                }
                None => arena.add_peer(ctx),
            }
        };

        let added = self.update_services(id).await;
        debug!(peer = %peer_id, services = added, "Peer added to tree");
        self.notify(TreeEvent::Reset);
        id
    }

    /// Remove a peer and everything under it.
    pub async fn remove_peer(&self, peer_id: &str) -> bool {
        let removed = {
            let mut arena = self.arena.lock().await;
            match arena.child_by_key(None, peer_id) {
                Some(id) => arena.remove(id),
                None => false,
            }
        };

        if removed {
            debug!(peer = %peer_id, "Peer removed from tree");
            self.notify(TreeEvent::PeerRemoved(peer_id.to_string()));
        }
        removed
    }

    /// Rediscover the services of a known peer. Returns `None` if the peer
    /// is not in the tree.
    pub async fn refresh_peer(&self, peer_id: &str) -> Option<usize> {
        let id = self.peer_lookup(peer_id).await?;
        let added = self.update_services(id).await;
        self.notify(TreeEvent::Reset);
        Some(added)
    }

    /// Append newly discovered services under `peer`, refreshing the
    /// objects of container services. Returns the number of new services.
    pub async fn update_services(&self, peer: NodeId) -> usize {
        let Some(ctx) = self.peer_context(peer).await else {
            return 0;
        };

        let mut stream = self.discovery.discover_services(&ctx);
        let mut added = 0;

        while let Some(raw) = stream.next().await {
            let Some(service) = parse_entry::<ServiceEntry>(raw, &ctx.peer_id) else {
                continue;
            };

            let target = {
                let mut arena = self.arena.lock().await;
                if arena.get(peer).is_none() {
                    debug!(peer = %ctx.peer_id, "Peer gone, discarding discovered services");
                    return added;
                }
                match arena.child_by_key(Some(peer), &service.id) {
                    Some(existing) => existing,
                    None => match arena.append(peer, Item::Service(service.clone())) {
                        Some(id) => {
                            added += 1;
                            id
                        }
                        None => return added,
                    },
                }
            };

            if service.container {
                self.update_contained(target).await;
            }
        }
        added
    }

    /// Append newly discovered objects under a container service. Returns
    /// the number of new objects.
    pub async fn update_contained(&self, service: NodeId) -> usize {
        let Some((ctx, entry)) = self.arena.lock().await.service_with_peer(service) else {
            return 0;
        };

        let mut stream = self.discovery.contained(&ctx, &entry);
        let mut added = 0;

        while let Some(raw) = stream.next().await {
            let Some(obj) = parse_entry::<ContainedObject>(raw, &ctx.peer_id) else {
                continue;
            };

            let mut arena = self.arena.lock().await;
            if arena.get(service).is_none() {
                debug!(service = %entry.id, "Service gone, discarding contained objects");
                return added;
            }
            if arena.child_by_key(Some(service), &obj.id).is_some() {
                continue;
            }
            if arena.append(service, Item::Object(obj)).is_some() {
                added += 1;
            }
        }
        added
    }

    /// Depth-first snapshot of the tree.
    pub async fn rows(&self) -> Vec<TreeRow> {
        self.arena.lock().await.rows()
    }

    /// Services and objects whose display path contains `query`, ignoring
    /// case.
    pub async fn search(&self, query: &str) -> Vec<TreeRow> {
        let query = query.to_lowercase();
        self.rows()
            .await
            .into_iter()
            .filter(|row| row.kind != RowKind::Peer)
            .filter(|row| {
                row.display
                    .as_ref()
                    .is_some_and(|d| d.to_lowercase().contains(&query))
            })
            .collect()
    }
}

fn parse_entry<T: DeserializeOwned>(raw: Value, peer_id: &str) -> Option<T> {
    match serde_json::from_value(raw) {
        Ok(entry) => Some(entry),
        Err(e) => {
            debug!(peer = %peer_id, error = %e, "Skipping malformed discovered entry");
            None
        }
    }
}
