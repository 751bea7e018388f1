//! ipspace Core Library
//!
//! User profiles and a peer directory over a content-addressed network.
//!
//! ## Overview
//!
//! Each local user owns a profile: an encrypted user information document
//! and a mutable DAG of named links, rooted at a CID and published under a
//! named key. Edits to either one flow through a per-profile worker that
//! saves, relinks the home page and republishes, one step at a time.
//! Known peers, their services and the objects those services hold are
//! tracked in a concurrent tree fed by message bus events.
//!
//! ## Core Principles
//!
//! - **Content-addressed**: the DAG root CID is the hash of its content
//! - **Encrypted at rest**: user information never touches storage in clear
//! - **Degrade, don't fail**: only a crypto bootstrap failure is fatal
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use ipspace_core::{LocalNode, SpaceConfig, UserProfile};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let node = Arc::new(LocalNode::open("~/.ipspace/node.redb")?);
//!     let profile = UserProfile::new("alice", node, SpaceConfig::default(), "~/.ipspace/crypto");
//!     profile.init().await?;
//!
//!     if let Some(userinfo) = profile.userinfo() {
//!         userinfo.set_avatar_cid("bafy...");
//!     }
//!     profile.sync().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod content;
pub mod crypto;
pub mod dag;
pub mod document;
pub mod error;
pub mod logging;
pub mod node;
pub mod peers;
pub mod profile;
pub mod pubsub;

// Re-exports
pub use config::{CryptoConfig, PublishConfig, SpaceConfig};
pub use crypto::{CryptoAgent, RsaExecutor, RsaKeyPem};
pub use dag::{mk_link, DagEvent, DagTransaction, EvolvingDag};
pub use document::{CipheredDocument, DocumentEvent, DocumentSchema, DocumentStatus};
pub use error::{SpaceError, SpaceResult};
pub use node::{KeyInfo, LocalNode, LocalNodeOptions, NodeHandle, PublishResult, StorageNode};
pub use peers::{
    MemoryDirectory, NodeId, PeerContext, PeerDirectory, PeerEvent, PeerTree, PeersTracker,
    ServiceDiscovery, ServiceEntry, TreeEvent,
};
pub use profile::{ProfileState, StatsSnapshot, UserInfo, UserProfile};
pub use pubsub::{make_key, KeyListener, Listener, MessageBus, TopicKey};
