//! Evolving DAG
//!
//! A mutable tree of named entries whose committed state is always a
//! content-addressed dag-json node. Readers get the last committed
//! snapshot; writers go through a [`DagTransaction`] that holds the writer
//! lock until it is committed or dropped.
//!
//! ```text
//! edit() ──▶ DagTransaction (working copy) ──▶ commit()
//!                       │                         │
//!                       │ drop                    ├─ validate links
//!                       ▼                         ├─ dag_put → new CID
//!              previous CID stays                 ├─ record CID in dag.main
//!                                                 └─ swap snapshot, emit Changed
//! ```
//!
//! The metadata file (`dag.main`) stores the latest root CID and a bounded
//! history of previous roots.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use chrono::Utc;
use cid::Cid;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, watch, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::content;
use crate::error::{SpaceError, SpaceResult};
use crate::node::NodeHandle;

/// Maximum number of entries kept in the root history
pub const HISTORY_LIMIT: usize = 64;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Initial tree of a user DAG.
pub fn default_skeleton() -> Value {
    json!({
        "index.html": "Blank",
        "media": { "images": {} },
        "board": { "messages": [] }
    })
}

/// One previous root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagHistoryEntry {
    /// Root CID
    pub cid: String,
    /// RFC 3339 commit time
    pub date: String,
}

/// Content of the metadata file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagMeta {
    /// Latest committed root
    pub latest: Option<String>,
    /// Previous roots, newest last
    #[serde(default)]
    pub history: Vec<DagHistoryEntry>,
}

impl DagMeta {
    fn record(&mut self, cid: &Cid) {
        let cid = cid.to_string();
        self.latest = Some(cid.clone());
        self.history.push(DagHistoryEntry {
            cid,
            date: Utc::now().to_rfc3339(),
        });
        if self.history.len() > HISTORY_LIMIT {
            let excess = self.history.len() - HISTORY_LIMIT;
            self.history.drain(..excess);
        }
    }
}

/// Committed state
#[derive(Debug, Clone)]
pub struct DagState {
    /// Root CID, `None` until the first commit
    pub cid: Option<Cid>,
    /// Root tree
    pub root: Value,
}

/// DAG notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DagEvent {
    /// A commit produced a new root CID
    Changed(Cid),
}

/// Mutable tree of links rooted at a CID.
pub struct EvolvingDag {
    node: NodeHandle,
    meta_path: String,
    state: RwLock<Arc<DagState>>,
    writer: Mutex<DagMeta>,
    loaded: watch::Sender<bool>,
    events: broadcast::Sender<DagEvent>,
    skeleton: fn() -> Value,
}

/// Check that every link in `root` targets a valid CID.
pub fn validate_links(root: &Value) -> SpaceResult<()> {
    let mut invalid = None;
    content::walk_links(root, &mut Vec::new(), &mut |path, target| {
        if invalid.is_none() {
            let (cid, _) = content::split_ipfs_path(target);
            if !content::is_valid_cid(cid) {
                invalid = Some(SpaceError::InvalidLink {
                    path: path.to_string(),
                    link: target.to_string(),
                });
            }
        }
    });
    match invalid {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Build a link from a CID, `/ipfs/<cid>` or `/ipfs/<cid>/sub/path`.
pub fn mk_link(cid_or_path: &str) -> SpaceResult<Value> {
    let (cid, sub) = content::split_ipfs_path(cid_or_path);
    let cid = content::parse_cid(cid)?;
    Ok(match sub {
        Some(sub) => content::link(&format!("{}/{}", cid, sub)),
        None => content::link(&cid.to_string()),
    })
}

/// Set `value` at `path`, creating intermediate objects.
///
/// Returns `false`, leaving the tree untouched, when a non-object value is
/// in the way.
pub fn set_path(root: &mut Value, path: &[&str], value: Value) -> bool {
    let Some((last, parents)) = path.split_last() else {
        return false;
    };

    let mut cursor = root;
    for segment in parents {
        if cursor.is_null() {
            *cursor = json!({});
        }
        let Some(map) = cursor.as_object_mut() else {
            return false;
        };
        cursor = map.entry(segment.to_string()).or_insert(Value::Null);
    }

    if cursor.is_null() {
        *cursor = json!({});
    }
    match cursor.as_object_mut() {
        Some(map) => {
            map.insert(last.to_string(), value);
            true
        }
        None => false,
    }
}

impl EvolvingDag {
    /// Create a DAG whose metadata lives at `meta_path`.
    pub fn new(node: NodeHandle, meta_path: impl Into<String>) -> Self {
        Self::with_skeleton(node, meta_path, default_skeleton)
    }

    /// Create a DAG with a custom initial tree.
    pub fn with_skeleton(
        node: NodeHandle,
        meta_path: impl Into<String>,
        skeleton: fn() -> Value,
    ) -> Self {
        let (loaded, _) = watch::channel(false);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            node,
            meta_path: meta_path.into(),
            state: RwLock::new(Arc::new(DagState {
                cid: None,
                root: skeleton(),
            })),
            writer: Mutex::new(DagMeta::default()),
            loaded,
            events,
            skeleton,
        }
    }

    /// Metadata file location.
    pub fn meta_path(&self) -> &str {
        &self.meta_path
    }

    /// Read metadata and fetch the latest root.
    ///
    /// Missing metadata or an unreachable root starts over from the
    /// skeleton, which is committed right away.
    pub async fn load(&self) -> SpaceResult<Cid> {
        let mut meta = self.writer.lock().await;
        *meta = self.read_meta().await;

        let fetched = match meta.latest.as_deref() {
            Some(latest) => match self.fetch_root(latest).await {
                Ok(state) => Some(state),
                Err(e) => {
                    warn!(meta = %self.meta_path, %latest, error = %e, "Cannot fetch DAG root, starting over");
                    None
                }
            },
            None => None,
        };

        let cid = match fetched {
            Some((cid, root)) => {
                *self.state.write() = Arc::new(DagState {
                    cid: Some(cid),
                    root,
                });
                info!(%cid, "Loaded DAG");
                cid
            }
            None => {
                let tx = DagTransaction {
                    dag: self,
                    meta,
                    root: (self.skeleton)(),
                };
                let cid = tx.commit().await?;
                info!(%cid, "Initialized DAG");
                cid
            }
        };

        self.loaded.send_replace(true);
        Ok(cid)
    }

    async fn read_meta(&self) -> DagMeta {
        match self.node.files_read(&self.meta_path).await {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(meta = %self.meta_path, error = %e, "Corrupt DAG metadata");
                DagMeta::default()
            }),
            Ok(None) => DagMeta::default(),
            Err(e) => {
                warn!(meta = %self.meta_path, error = %e, "Cannot read DAG metadata");
                DagMeta::default()
            }
        }
    }

    async fn fetch_root(&self, latest: &str) -> SpaceResult<(Cid, Value)> {
        let cid = content::parse_cid(latest)?;
        let root = self.node.dag_get(&cid).await?;
        Ok((cid, root))
    }

    /// Wait until [`EvolvingDag::load`] has completed.
    pub async fn wait_loaded(&self) {
        let mut rx = self.loaded.subscribe();
        let _ = rx.wait_for(|loaded| *loaded).await;
    }

    /// Whether the DAG has been loaded.
    pub fn is_loaded(&self) -> bool {
        *self.loaded.borrow()
    }

    /// Committed snapshot.
    pub fn snapshot(&self) -> Arc<DagState> {
        self.state.read().clone()
    }

    /// Committed root tree.
    pub fn root(&self) -> Value {
        self.state.read().root.clone()
    }

    /// Committed root CID.
    pub fn dag_cid(&self) -> Option<Cid> {
        self.state.read().cid
    }

    /// Committed snapshot taken while holding the writer lock, so it is
    /// never interleaved with an open transaction.
    pub async fn snapshot_exclusive(&self) -> Arc<DagState> {
        let _meta = self.writer.lock().await;
        self.snapshot()
    }

    /// Root history, oldest first.
    pub async fn history(&self) -> Vec<DagHistoryEntry> {
        self.writer.lock().await.history.clone()
    }

    /// Open a scoped mutation on a copy of the committed root.
    pub async fn edit(&self) -> DagTransaction<'_> {
        let meta = self.writer.lock().await;
        let root = self.state.read().root.clone();
        DagTransaction {
            dag: self,
            meta,
            root,
        }
    }

    /// Apply `f` in a scoped mutation and commit.
    pub async fn mutate(&self, f: impl FnOnce(&mut Value)) -> SpaceResult<Cid> {
        let mut tx = self.edit().await;
        f(&mut tx.root);
        tx.commit().await
    }

    /// Subscribe to root changes.
    pub fn subscribe(&self) -> broadcast::Receiver<DagEvent> {
        self.events.subscribe()
    }
}

/// Exclusive working copy of the DAG root.
///
/// Dereferences to the root [`Value`]. Nothing is published unless
/// [`DagTransaction::commit`] succeeds.
pub struct DagTransaction<'a> {
    dag: &'a EvolvingDag,
    meta: MutexGuard<'a, DagMeta>,
    root: Value,
}

impl DagTransaction<'_> {
    /// Validate, store and record the working copy.
    pub async fn commit(self) -> SpaceResult<Cid> {
        let DagTransaction {
            dag,
            mut meta,
            root,
        } = self;

        validate_links(&root)?;
        let cid = dag.node.dag_put(&root).await?;

        let previous = dag.state.read().cid;
        if previous == Some(cid) {
            debug!(%cid, "DAG unchanged");
            return Ok(cid);
        }

        let mut next_meta = meta.clone();
        next_meta.record(&cid);
        let bytes = serde_json::to_vec(&next_meta)?;
        dag.node.files_write(&dag.meta_path, &bytes).await?;
        *meta = next_meta;

        *dag.state.write() = Arc::new(DagState {
            cid: Some(cid),
            root,
        });
        debug!(%cid, "Committed DAG");
        let _ = dag.events.send(DagEvent::Changed(cid));
        Ok(cid)
    }
}

impl Deref for DagTransaction<'_> {
    type Target = Value;

    fn deref(&self) -> &Value {
        &self.root
    }
}

impl DerefMut for DagTransaction<'_> {
    fn deref_mut(&mut self) -> &mut Value {
        &mut self.root
    }
}
