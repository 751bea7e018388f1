//! Storage network capability
//!
//! The profile core never talks to a particular daemon or wire protocol. It
//! depends on [`StorageNode`], a narrow async interface covering the
//! mutable filesystem namespace, named publishing keys, content storage,
//! DAG nodes and name publication.
//!
//! [`LocalNode`] is a single-process implementation on top of redb, used by
//! the CLI and the test suite.

mod local;

pub use local::{LocalNode, LocalNodeOptions};

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SpaceResult;

/// A named publishing key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInfo {
    /// Local key name, e.g. `galacteek.alice.root`
    pub name: String,
    /// Network-wide key id (the name under which records are resolved)
    pub id: String,
}

/// Result of a successful name publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishResult {
    /// Key id the record was published under
    pub name: String,
    /// Published path, `/ipfs/<cid>`
    pub value: String,
}

/// Async interface to the content-addressed storage network.
#[async_trait]
pub trait StorageNode: Send + Sync {
    /// Identifier of the local peer.
    fn node_id(&self) -> String;

    /// Create a directory in the mutable namespace, including parents.
    async fn files_mkdir(&self, path: &str) -> SpaceResult<()>;

    /// Whether a file or directory exists in the mutable namespace.
    async fn files_exists(&self, path: &str) -> SpaceResult<bool>;

    /// Atomically replace the content of a file in the mutable namespace.
    async fn files_write(&self, path: &str, data: &[u8]) -> SpaceResult<()>;

    /// Read a file from the mutable namespace, `None` if absent.
    async fn files_read(&self, path: &str) -> SpaceResult<Option<Bytes>>;

    /// Generate a named publishing key.
    async fn key_gen(&self, name: &str) -> SpaceResult<KeyInfo>;

    /// Look up a named key.
    async fn key_find(&self, name: &str) -> SpaceResult<Option<KeyInfo>>;

    /// Names of all local keys.
    async fn keys_names(&self) -> SpaceResult<Vec<String>>;

    /// Store raw content.
    async fn add_bytes(&self, data: &[u8]) -> SpaceResult<Cid>;

    /// Store a local file, or a directory when `recursive` is set.
    async fn add_path(&self, path: &Path, recursive: bool) -> SpaceResult<Cid>;

    /// Fetch raw content.
    async fn cat(&self, cid: &Cid) -> SpaceResult<Bytes>;

    /// Store a DAG node.
    async fn dag_put(&self, node: &Value) -> SpaceResult<Cid>;

    /// Fetch a DAG node.
    async fn dag_get(&self, cid: &Cid) -> SpaceResult<Value>;

    /// Bind the named key to `/ipfs/<cid>`. Returns `None` when the
    /// publication did not go through.
    async fn publish(&self, cid: &Cid, key: &str) -> Option<PublishResult>;

    /// Current binding of a key id.
    async fn resolve(&self, key_id: &str) -> SpaceResult<Option<String>>;

    /// Whether the DAG API is available.
    async fn has_dag_command(&self) -> bool;
}

/// Shared handle to a storage node
pub type NodeHandle = Arc<dyn StorageNode>;

/// Join mutable-namespace path segments.
pub fn join_path(base: &str, segment: &str) -> String {
    let base = base.trim_end_matches('/');
    let segment = segment.trim_start_matches('/');
    if base.is_empty() {
        format!("/{}", segment)
    } else {
        format!("{}/{}", base, segment)
    }
}
