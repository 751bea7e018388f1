//! Ciphered JSON documents
//!
//! A [`CipheredDocument`] is a JSON root object persisted in the node's
//! mutable namespace as a single encrypted blob. The schema type supplies
//! the default content, the lock rule and the modification stamp.
//!
//! ## Lifecycle
//!
//! ```text
//! new() ──▶ load() ──▶ [loaded gate open] ──▶ mutate()* ──▶ save()
//!              │
//!              ├── no file          → defaults, status Fresh
//!              ├── decrypt/parse ok → content, status Loaded
//!              └── decrypt fails    → defaults, status Recovered
//! ```
//!
//! Mutations emit [`DocumentEvent::Changed`] on a broadcast channel; the
//! owner decides when to save.

use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, warn};

use crate::crypto::CryptoAgent;
use crate::error::SpaceResult;
use crate::node::NodeHandle;

/// Capacity of the change notification channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Per-document behavior.
pub trait DocumentSchema: Send + Sync + 'static {
    /// Default content for a fresh document.
    fn init_obj() -> Value;

    /// Whether mutation methods must be refused.
    fn is_locked(_root: &Value) -> bool {
        false
    }

    /// Record the modification time after a mutation.
    fn touch(_root: &mut Value) {}

    /// Whether decrypted content is usable.
    fn valid(_root: &Value) -> bool {
        true
    }
}

/// How the current content was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentStatus {
    /// Not loaded yet
    Pending,
    /// No backing file; defaults in use
    Fresh,
    /// Backing file decrypted successfully
    Loaded,
    /// Backing file present but unreadable; defaults in use
    Recovered,
}

/// Change notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentEvent {
    /// The root mapping was mutated
    Changed,
    /// The document was written to the node
    Saved,
}

/// Encrypted JSON document stored at `path` in the mutable namespace.
pub struct CipheredDocument<S: DocumentSchema> {
    path: String,
    node: NodeHandle,
    agent: Arc<CryptoAgent>,
    root: RwLock<Value>,
    status: RwLock<DocumentStatus>,
    loaded: watch::Sender<bool>,
    events: broadcast::Sender<DocumentEvent>,
    save_lock: Mutex<()>,
    _schema: PhantomData<fn() -> S>,
}

fn dotted_pointer(path: &str) -> String {
    path.split('.')
        .filter(|p| !p.is_empty())
        .fold(String::new(), |mut acc, part| {
            acc.push('/');
            acc.push_str(part);
            acc
        })
}

impl<S: DocumentSchema> CipheredDocument<S> {
    /// Create a document holding the schema defaults.
    pub fn new(node: NodeHandle, agent: Arc<CryptoAgent>, path: impl Into<String>) -> Self {
        let (loaded, _) = watch::channel(false);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            path: path.into(),
            node,
            agent,
            root: RwLock::new(S::init_obj()),
            status: RwLock::new(DocumentStatus::Pending),
            loaded,
            events,
            save_lock: Mutex::new(()),
            _schema: PhantomData,
        }
    }

    /// Location in the mutable namespace.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Load and decrypt the backing file.
    ///
    /// Never fails: unreadable content is logged and the defaults are kept.
    /// The loaded gate opens in every case.
    pub async fn load(&self) -> DocumentStatus {
        let status = match self.node.files_read(&self.path).await {
            Ok(None) => {
                debug!(path = %self.path, "No document yet, using defaults");
                DocumentStatus::Fresh
            }
            Ok(Some(data)) => match self.agent.decrypt_json(&data).await {
                Ok(value) if S::valid(&value) => {
                    *self.root.write() = value;
                    DocumentStatus::Loaded
                }
                Ok(_) => {
                    warn!(path = %self.path, "Document failed validation, using defaults");
                    DocumentStatus::Recovered
                }
                Err(e) => {
                    warn!(path = %self.path, error = %e, "Cannot decrypt document, using defaults");
                    DocumentStatus::Recovered
                }
            },
            Err(e) => {
                warn!(path = %self.path, error = %e, "Cannot read document, using defaults");
                DocumentStatus::Recovered
            }
        };

        *self.status.write() = status;
        self.loaded.send_replace(true);
        status
    }

    /// Wait until [`CipheredDocument::load`] has completed.
    pub async fn wait_loaded(&self) {
        let mut rx = self.loaded.subscribe();
        // The sender lives as long as self, so this cannot fail
        let _ = rx.wait_for(|loaded| *loaded).await;
    }

    /// Whether the loaded gate is open.
    pub fn is_loaded(&self) -> bool {
        *self.loaded.borrow()
    }

    /// How the current content was obtained.
    pub fn status(&self) -> DocumentStatus {
        *self.status.read()
    }

    /// Encrypt and write the document.
    pub async fn save(&self) -> SpaceResult<()> {
        let _guard = self.save_lock.lock().await;
        let snapshot = self.root.read().clone();
        let sealed = self.agent.encrypt_json(&snapshot).await?;
        self.node.files_write(&self.path, &sealed).await?;
        debug!(path = %self.path, bytes = sealed.len(), "Saved document");
        let _ = self.events.send(DocumentEvent::Saved);
        Ok(())
    }

    /// Clone of the root mapping.
    pub fn root(&self) -> Value {
        self.root.read().clone()
    }

    /// Run `f` against the root mapping.
    pub fn read<R>(&self, f: impl FnOnce(&Value) -> R) -> R {
        f(&self.root.read())
    }

    /// Value at a dotted path, e.g. `userinfo.avatar.cid`.
    pub fn traverse(&self, path: &str) -> Option<Value> {
        self.root.read().pointer(&dotted_pointer(path)).cloned()
    }

    /// String at a dotted path, empty when absent or not a string.
    pub fn traverse_str(&self, path: &str) -> String {
        self.traverse(path)
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default()
    }

    /// Whether the schema lock is set.
    pub fn is_locked(&self) -> bool {
        S::is_locked(&self.root.read())
    }

    /// Apply a mutation unless the document is locked.
    ///
    /// Returns `false` (and emits nothing) when locked. Otherwise stamps the
    /// modification time and emits [`DocumentEvent::Changed`].
    pub fn mutate(&self, f: impl FnOnce(&mut Value)) -> bool {
        {
            let mut root = self.root.write();
            if S::is_locked(&root) {
                debug!(path = %self.path, "Document locked, mutation ignored");
                return false;
            }
            f(&mut root);
            S::touch(&mut root);
        }
        let _ = self.events.send(DocumentEvent::Changed);
        true
    }

    /// Apply a mutation regardless of the lock, without stamping.
    ///
    /// `f` returns whether anything changed; a change event is emitted only
    /// in that case.
    pub fn mutate_unlocked(&self, f: impl FnOnce(&mut Value) -> bool) -> bool {
        let changed = f(&mut self.root.write());
        if changed {
            let _ = self.events.send(DocumentEvent::Changed);
        }
        changed
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<DocumentEvent> {
        self.events.subscribe()
    }
}
