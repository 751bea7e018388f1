//! Message bus
//!
//! Explicitly constructed and passed around (clones share state). Each
//! subscription owns an unbounded queue drained by its own task, so
//! messages from one publisher reach one subscriber in publish order.
//! Ordering across subscribers is unspecified.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::key::TopicKey;

/// Handle returned by [`MessageBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// A published message as seen by a subscriber
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Key the message was published under
    pub key: TopicKey,
    /// Message body
    pub payload: Arc<Value>,
}

struct Subscription {
    id: SubscriptionId,
    pattern: TopicKey,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct BusInner {
    subscriptions: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
}

/// Topic-key routed publish/subscribe hub.
#[derive(Clone, Default)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for every key matched by `pattern`.
    ///
    /// Must be called from within a tokio runtime: the delivery task is
    /// spawned here.
    pub fn subscribe<F, Fut>(&self, pattern: TopicKey, handler: F) -> SubscriptionId
    where
        F: Fn(Delivery) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();

        let task_pattern = pattern.clone();
        tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                trace!(pattern = %task_pattern, key = %delivery.key, "Delivering");
                handler(delivery).await;
            }
            trace!(pattern = %task_pattern, "Subscription closed");
        });

        debug!(%pattern, ?id, "Subscribed");
        self.inner
            .subscriptions
            .write()
            .push(Subscription { id, pattern, tx });
        id
    }

    /// Drop a subscription. Messages already queued are still delivered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.inner.subscriptions.write();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        before != subs.len()
    }

    /// Publish `payload` under `key`; returns the number of subscriptions
    /// it was queued for.
    pub fn publish(&self, key: &TopicKey, payload: Value) -> usize {
        let payload = Arc::new(payload);
        let subs = self.inner.subscriptions.read();

        let mut delivered = 0;
        for sub in subs.iter().filter(|s| s.pattern.matches(key)) {
            let delivery = Delivery {
                key: key.clone(),
                payload: payload.clone(),
            };
            if sub.tx.send(delivery).is_ok() {
                delivered += 1;
            }
        }

        debug!(%key, delivered, "Published");
        delivered
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::key::{key_42, make_key, WILDCARD};
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    fn collector(bus: &MessageBus, pattern: TopicKey) -> mpsc::UnboundedReceiver<Delivery> {
        let (tx, rx) = mpsc::unbounded_channel();
        bus.subscribe(pattern, move |d| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(d);
            }
        });
        rx
    }

    #[tokio::test]
    async fn test_exact_and_wildcard_routing() {
        let bus = MessageBus::new();
        let mut exact = collector(&bus, key_42());
        let mut wild = collector(&bus, make_key(&["g", WILDCARD]));
        let mut other = collector(&bus, make_key(&["g", "43"]));

        assert_eq!(bus.publish(&key_42(), json!({ "answer": 42 })), 2);

        let d = timeout(Duration::from_secs(1), exact.recv()).await.unwrap().unwrap();
        assert_eq!(d.key, key_42());
        assert_eq!(*d.payload, json!({ "answer": 42 }));
        let d = timeout(Duration::from_secs(1), wild.recv()).await.unwrap().unwrap();
        assert_eq!(d.key, key_42());
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_per_subscriber_order() {
        let bus = MessageBus::new();
        let mut rx = collector(&bus, key_42());

        for i in 0..100 {
            bus.publish(&key_42(), json!(i));
        }
        for i in 0..100 {
            let d = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
            assert_eq!(*d.payload, json!(i));
        }
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let bus = MessageBus::new();
        let (tx, _rx) = mpsc::unbounded_channel::<Delivery>();
        let id = bus.subscribe(key_42(), move |d| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(d);
            }
        });

        assert_eq!(bus.subscription_count(), 1);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.publish(&key_42(), json!(null)), 0);
    }
}
