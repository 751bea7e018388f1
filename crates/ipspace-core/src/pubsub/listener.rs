//! Key listeners
//!
//! A receiver type declares its handlers once in a [`DispatchTable`], keyed
//! by the canonical handler name of a topic key (see
//! [`TopicKey::handler_name`]). Binding a key looks the name up in the
//! table and subscribes the handler on the bus; a key with no handler is
//! rejected at bind time with [`SpaceError::UnboundKey`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::debug;

use super::bus::{Delivery, MessageBus, SubscriptionId};
use super::key::{key_42, key_service, TopicKey};
use crate::error::{SpaceError, SpaceResult};

type Handler<T> = Arc<dyn Fn(Arc<T>, Delivery) -> BoxFuture<'static, ()> + Send + Sync>;

/// Handler name to handler mapping for a receiver type.
pub struct DispatchTable<T> {
    handlers: HashMap<String, Handler<T>>,
}

impl<T: Send + Sync + 'static> DispatchTable<T> {
    /// Empty table.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register the handler for `key`'s canonical name.
    pub fn on<F, Fut>(mut self, key: &TopicKey, handler: F) -> Self
    where
        F: Fn(Arc<T>, Delivery) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: Handler<T> = Arc::new(move |receiver, delivery| handler(receiver, delivery).boxed());
        self.handlers.insert(key.handler_name(), handler);
        self
    }

    fn get(&self, name: &str) -> Option<Handler<T>> {
        self.handlers.get(name).cloned()
    }

    /// Registered handler names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl<T: Send + Sync + 'static> Default for DispatchTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Keys bound by every listener: `g/services/app` and `g/42`.
pub fn default_listen_keys() -> Vec<TopicKey> {
    vec![key_service(&["app"]), key_42()]
}

/// A receiver of bus messages.
pub trait KeyListener: Send + Sync + Sized + 'static {
    /// Handlers of this receiver type.
    fn dispatch_table() -> DispatchTable<Self>;

    /// Keys bound in addition to [`default_listen_keys`].
    fn listen_keys(&self) -> Vec<TopicKey> {
        Vec::new()
    }
}

/// Bindings of one receiver on one bus.
pub struct Listener<T: KeyListener> {
    bus: MessageBus,
    receiver: Arc<T>,
    table: DispatchTable<T>,
    bound: Vec<(TopicKey, SubscriptionId)>,
}

impl<T: KeyListener> Listener<T> {
    /// Prepare bindings without subscribing anything yet.
    pub fn new(bus: MessageBus, receiver: Arc<T>) -> Self {
        Self {
            bus,
            receiver,
            table: T::dispatch_table(),
            bound: Vec::new(),
        }
    }

    /// Bind the default keys and the receiver's own keys; failures are
    /// logged and skipped.
    pub fn start(bus: MessageBus, receiver: Arc<T>) -> Self {
        let mut listener = Self::new(bus, receiver);
        listener.listen_all(&default_listen_keys());
        let own = listener.receiver.listen_keys();
        listener.listen_all(&own);
        listener
    }

    /// Bind `key` to its handler.
    ///
    /// The delivery task keeps only a weak reference to the receiver;
    /// messages arriving after it is dropped are ignored.
    pub fn listen(&mut self, key: &TopicKey) -> SpaceResult<SubscriptionId> {
        let handler = self
            .table
            .get(&key.handler_name())
            .ok_or_else(|| SpaceError::UnboundKey(key.to_string()))?;

        let weak = Arc::downgrade(&self.receiver);
        let id = self.bus.subscribe(key.clone(), move |delivery| {
            let handler = handler.clone();
            let receiver = weak.upgrade();
            async move {
                if let Some(receiver) = receiver {
                    handler(receiver, delivery).await;
                }
            }
        });

        debug!(%key, handler = %key.handler_name(), "Key listener bound");
        self.bound.push((key.clone(), id));
        Ok(id)
    }

    /// Bind several keys; failures are logged and skipped.
    pub fn listen_all(&mut self, keys: &[TopicKey]) -> usize {
        keys.iter()
            .filter(|key| match self.listen(key) {
                Ok(_) => true,
                Err(e) => {
                    debug!(%key, error = %e, "Could not bind key");
                    false
                }
            })
            .count()
    }

    /// Bind keys given as `a/b/c` strings; malformed or unbound keys are
    /// logged and skipped.
    pub fn listen_from_config(&mut self, paths: &[String]) -> usize {
        let keys: Vec<TopicKey> = paths
            .iter()
            .filter_map(|path| match TopicKey::parse(path) {
                Ok(key) => Some(key),
                Err(e) => {
                    debug!(%path, error = %e, "Could not parse listener key");
                    None
                }
            })
            .collect();
        self.listen_all(&keys)
    }

    /// Keys currently bound.
    pub fn bound_keys(&self) -> Vec<TopicKey> {
        self.bound.iter().map(|(key, _)| key.clone()).collect()
    }

    /// Remove every binding.
    pub fn stop(&mut self) {
        for (_, id) in self.bound.drain(..) {
            self.bus.unsubscribe(id);
        }
    }
}

impl<T: KeyListener> Drop for Listener<T> {
    fn drop(&mut self) {
        self.stop();
    }
}
