//! Peer Directory and Message Bus Integration Tests
//!
//! ## What These Tests Verify
//!
//! - `g/42` reaches exact and wildcard subscribers, never unrelated ones
//! - Peer events on the bus drive the peer tree through the tracker
//! - Duplicate announcements never create sibling nodes
//! - Logout removes exactly one peer with one notification

use std::sync::Arc;
use std::time::Duration;

use ipspace_core::pubsub::key::{key_42, key_peer_added, key_peer_logout};
use ipspace_core::pubsub::{Delivery, DispatchTable, KeyListener, Listener, WILDCARD};
use ipspace_core::{
    make_key, MemoryDirectory, MessageBus, PeerContext, PeerEvent, PeerTree, PeersTracker,
    TopicKey, TreeEvent,
};
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap()
}

async fn next_event(events: &mut broadcast::Receiver<TreeEvent>) -> TreeEvent {
    timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap()
}

#[tokio::test]
async fn test_g42_routing() {
    let bus = MessageBus::new();
    let (tx, mut rx) = mpsc::unbounded_channel::<&'static str>();

    for (name, pattern) in [
        ("exact", key_42()),
        ("wildcard", make_key(&["g", WILDCARD])),
        ("unrelated", make_key(&["g", "43"])),
        ("other-root", make_key(&["h", WILDCARD])),
    ] {
        let tx = tx.clone();
        bus.subscribe(pattern, move |_delivery: Delivery| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(name);
            }
        });
    }

    assert_eq!(bus.publish(&key_42(), json!({ "answer": 42 })), 2);

    let mut got = vec![recv(&mut rx).await, recv(&mut rx).await];
    got.sort_unstable();
    assert_eq!(got, vec!["exact", "wildcard"]);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_publisher_order_is_kept_per_subscriber() {
    let bus = MessageBus::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.subscribe(make_key(&["g", "pubsub", WILDCARD]), move |delivery: Delivery| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(delivery.payload["n"].as_u64().unwrap_or(0));
        }
    });

    let key = make_key(&["g", "pubsub", "chat"]);
    for n in 0..20u64 {
        bus.publish(&key, json!({ "n": n }));
    }
    for n in 0..20u64 {
        assert_eq!(recv(&mut rx).await, n);
    }
}

struct Ping {
    seen: mpsc::UnboundedSender<String>,
}

impl Ping {
    async fn event_g_42(self: Arc<Self>, delivery: Delivery) {
        let _ = self.seen.send(delivery.payload.to_string());
    }
}

impl KeyListener for Ping {
    fn dispatch_table() -> DispatchTable<Self> {
        DispatchTable::new().on(&key_42(), Ping::event_g_42)
    }
}

#[tokio::test]
async fn test_default_keys_bound_by_listener() {
    let bus = MessageBus::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let listener = Listener::start(bus.clone(), Arc::new(Ping { seen: tx }));

    assert_eq!(listener.bound_keys(), vec![key_42()]);
    bus.publish(&key_42(), json!("ping"));
    assert_eq!(recv(&mut rx).await, "\"ping\"");

    drop(listener);
    assert_eq!(bus.publish(&key_42(), json!("gone")), 0);
}

#[tokio::test]
async fn test_peer_lifecycle_over_the_bus() {
    let bus = MessageBus::new();
    let directory = Arc::new(MemoryDirectory::new());
    directory.insert_peer(PeerContext::new("QmAlice", "did:ipid:QmAlice", "alice"));
    directory.insert_peer(PeerContext::new("QmBob", "did:ipid:QmBob", "bob"));
    directory.set_services(
        "QmAlice",
        vec![
            json!({ "id": "did:ipid:QmAlice/blog", "container": true }),
            json!({ "id": "did:ipid:QmAlice/blog", "container": true }),
        ],
    );
    directory.set_contained(
        "did:ipid:QmAlice/blog",
        vec![json!({ "id": "did:ipid:QmAlice/blog/post-1" })],
    );

    let tree = Arc::new(PeerTree::new(directory.clone()));
    let tracker = Arc::new(PeersTracker::new(directory.clone(), tree.clone()));
    let _listener = Listener::start(bus.clone(), tracker);
    let mut events = tree.subscribe();

    for peer in ["QmAlice", "QmBob", "QmAlice"] {
        bus.publish(&key_peer_added(), PeerEvent::new(peer).to_value());
        assert_eq!(next_event(&mut events).await, TreeEvent::Reset);
    }

    assert_eq!(tree.peer_count().await, 2);
    assert_eq!(tree.service_ids("QmAlice").await, vec!["did:ipid:QmAlice/blog"]);
    assert_eq!(
        tree.object_ids("QmAlice", "did:ipid:QmAlice/blog").await,
        vec!["did:ipid:QmAlice/blog/post-1"]
    );

    let found = tree.search("alice/blog").await;
    assert_eq!(found.len(), 2);

    bus.publish(&key_peer_logout(), PeerEvent::new("QmAlice").to_value());
    assert_eq!(
        next_event(&mut events).await,
        TreeEvent::PeerRemoved("QmAlice".to_string())
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_err());
    assert_eq!(tree.peer_count().await, 1);
    assert!(tree.peer_lookup("QmAlice").await.is_none());
    assert!(tree.peer_lookup("QmBob").await.is_some());
}

#[test]
fn test_key_parsing_matches_builders() {
    let parsed = TopicKey::parse("g/peers/added").unwrap();
    assert_eq!(parsed, key_peer_added());
    assert_eq!(parsed.handler_name(), "event_g_peers_added");
    assert!(TopicKey::parse("").is_err());
}
