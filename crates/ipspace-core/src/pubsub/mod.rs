//! Publish/subscribe key router
//!
//! - [`key`]: hierarchical topic keys with wildcards, interned through a
//!   bounded cache, plus the predefined key namespace
//! - [`bus`]: the message bus, one ordered queue per subscription
//! - [`listener`]: dispatch tables binding keys to typed handlers

pub mod bus;
pub mod key;
pub mod listener;

pub use bus::{Delivery, MessageBus, SubscriptionId};
pub use key::{make_key, TopicKey, WILDCARD};
pub use listener::{default_listen_keys, DispatchTable, KeyListener, Listener};
