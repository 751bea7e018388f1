//! Single-process storage node backed by redb.
//!
//! Tables:
//!
//! | table | key | value |
//! |-------|-----|-------|
//! | `blocks` | CID string | content bytes |
//! | `mfs` | absolute path | postcard [`MfsEntry`] |
//! | `keys` | key name | postcard [`StoredKey`] |
//! | `names` | key id | published `/ipfs/<cid>` path |
//! | `meta` | setting name | value bytes |

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use ed25519_dalek::SigningKey;
use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::{KeyInfo, PublishResult, StorageNode};
use crate::content;
use crate::error::{SpaceError, SpaceResult};

const BLOCKS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("blocks");
const MFS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("mfs");
const KEYS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("keys");
const NAMES_TABLE: TableDefinition<&str, &str> = TableDefinition::new("names");
const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

const NODE_KEY: &str = "node_key";

/// Entry of the mutable namespace
#[derive(Debug, Clone, Serialize, Deserialize)]
enum MfsEntry {
    Directory,
    File { data: Vec<u8> },
}

/// Persisted publishing key
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredKey {
    name: String,
    id: String,
    secret: [u8; 32],
}

/// Options for [`LocalNode`]
#[derive(Debug, Clone)]
pub struct LocalNodeOptions {
    /// Whether the DAG API is offered
    pub dag_enabled: bool,
}

impl Default for LocalNodeOptions {
    fn default() -> Self {
        Self { dag_enabled: true }
    }
}

/// Storage node keeping blocks, the mutable namespace, keys and name
/// records in a single redb database.
#[derive(Clone)]
pub struct LocalNode {
    db: Arc<RwLock<Database>>,
    node_id: String,
    options: LocalNodeOptions,
}

fn random_seed() -> SpaceResult<[u8; 32]> {
    let mut seed = [0u8; 32];
    getrandom::getrandom(&mut seed)
        .map_err(|e| SpaceError::Crypto(format!("Failed to get random bytes: {}", e)))?;
    Ok(seed)
}

fn key_id(secret: &[u8; 32]) -> String {
    let public = SigningKey::from_bytes(secret).verifying_key();
    bs58::encode(public.as_bytes()).into_string()
}

fn normalize(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    format!("/{}", parts.join("/"))
}

fn ancestors(path: &str) -> Vec<String> {
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    (1..=parts.len())
        .map(|n| format!("/{}", parts[..n].join("/")))
        .collect()
}

impl LocalNode {
    /// Open (or create) a node database at `path`.
    pub fn open(path: impl AsRef<Path>) -> SpaceResult<Self> {
        Self::open_with(path, LocalNodeOptions::default())
    }

    /// Open a node database with explicit options.
    pub fn open_with(path: impl AsRef<Path>, options: LocalNodeOptions) -> SpaceResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        let node_secret = {
            let _ = write_txn.open_table(BLOCKS_TABLE)?;
            let _ = write_txn.open_table(MFS_TABLE)?;
            let _ = write_txn.open_table(KEYS_TABLE)?;
            let _ = write_txn.open_table(NAMES_TABLE)?;
            let mut meta = write_txn.open_table(META_TABLE)?;

            let existing = meta.get(NODE_KEY)?.map(|v| v.value().to_vec());
            match existing {
                Some(bytes) if bytes.len() == 32 => {
                    let mut secret = [0u8; 32];
                    secret.copy_from_slice(&bytes);
                    secret
                }
                _ => {
                    let secret = random_seed()?;
                    meta.insert(NODE_KEY, &secret[..])?;
                    secret
                }
            }
        };
        write_txn.commit()?;

        let node_id = key_id(&node_secret);
        info!(?path, %node_id, dag = options.dag_enabled, "Opened local storage node");

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
            node_id,
            options,
        })
    }

    fn get_block(&self, cid: &Cid) -> SpaceResult<Option<Vec<u8>>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(BLOCKS_TABLE)?;
        let key = cid.to_string();
        Ok(table.get(key.as_str())?.map(|v| v.value().to_vec()))
    }

    fn put_block(&self, cid: &Cid, data: &[u8]) -> SpaceResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(BLOCKS_TABLE)?;
            let key = cid.to_string();
            table.insert(key.as_str(), data)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn get_entry(&self, path: &str) -> SpaceResult<Option<MfsEntry>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(MFS_TABLE)?;
        match table.get(path)? {
            Some(v) => Ok(Some(postcard::from_bytes(v.value())?)),
            None => Ok(None),
        }
    }

    /// Write an entry and create any missing ancestor directories in the
    /// same transaction.
    fn put_entry(&self, path: &str, entry: &MfsEntry) -> SpaceResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(MFS_TABLE)?;
            let dir = postcard::to_allocvec(&MfsEntry::Directory)?;

            let chain = ancestors(path);
            let parents = chain.len().saturating_sub(1);
            for ancestor in &chain[..parents] {
                let existing = table
                    .get(ancestor.as_str())?
                    .map(|v| postcard::from_bytes::<MfsEntry>(v.value()))
                    .transpose()?;
                match existing {
                    Some(MfsEntry::Directory) => {}
                    Some(MfsEntry::File { .. }) => {
                        return Err(SpaceError::Node(format!(
                            "{} is a file, cannot create {}",
                            ancestor, path
                        )));
                    }
                    None => {
                        table.insert(ancestor.as_str(), dir.as_slice())?;
                    }
                }
            }

            let data = postcard::to_allocvec(entry)?;
            table.insert(path, data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn load_key(&self, name: &str) -> SpaceResult<Option<StoredKey>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(KEYS_TABLE)?;
        match table.get(name)? {
            Some(v) => Ok(Some(postcard::from_bytes(v.value())?)),
            None => Ok(None),
        }
    }

    fn add_path_sync(&self, path: &Path, recursive: bool) -> SpaceResult<Cid> {
        let metadata = std::fs::metadata(path)?;

        if metadata.is_file() {
            let data = std::fs::read(path)?;
            let cid = content::raw_cid(&data);
            self.put_block(&cid, &data)?;
            return Ok(cid);
        }

        if !recursive {
            return Err(SpaceError::InvalidOperation(format!(
                "{} is a directory, recursive add required",
                path.display()
            )));
        }

        let mut links = Map::new();
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let child_path = entry.path();
            // Links are never followed inside a walk
            if std::fs::symlink_metadata(&child_path)?.file_type().is_symlink() {
                debug!(path = %child_path.display(), "Skipping symlink");
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let child = self.add_path_sync(&child_path, true)?;
            links.insert(name, content::link(&child.to_string()));
        }

        let node = Value::Object(links);
        let cid = content::json_cid(&node)?;
        self.put_block(&cid, &content::canonical_json(&node)?)?;
        Ok(cid)
    }
}

#[async_trait]
impl StorageNode for LocalNode {
    fn node_id(&self) -> String {
        self.node_id.clone()
    }

    async fn files_mkdir(&self, path: &str) -> SpaceResult<()> {
        let path = normalize(path);
        match self.get_entry(&path)? {
            Some(MfsEntry::Directory) => Ok(()),
            Some(MfsEntry::File { .. }) => Err(SpaceError::Node(format!("{} is a file", path))),
            None => {
                debug!(%path, "mkdir");
                self.put_entry(&path, &MfsEntry::Directory)
            }
        }
    }

    async fn files_exists(&self, path: &str) -> SpaceResult<bool> {
        Ok(self.get_entry(&normalize(path))?.is_some())
    }

    async fn files_write(&self, path: &str, data: &[u8]) -> SpaceResult<()> {
        let path = normalize(path);
        if let Some(MfsEntry::Directory) = self.get_entry(&path)? {
            return Err(SpaceError::Node(format!("{} is a directory", path)));
        }
        self.put_entry(
            &path,
            &MfsEntry::File {
                data: data.to_vec(),
            },
        )
    }

    async fn files_read(&self, path: &str) -> SpaceResult<Option<Bytes>> {
        let path = normalize(path);
        match self.get_entry(&path)? {
            Some(MfsEntry::File { data }) => Ok(Some(Bytes::from(data))),
            Some(MfsEntry::Directory) => Err(SpaceError::Node(format!("{} is a directory", path))),
            None => Ok(None),
        }
    }

    async fn key_gen(&self, name: &str) -> SpaceResult<KeyInfo> {
        if let Some(existing) = self.load_key(name)? {
            return Ok(KeyInfo {
                name: existing.name,
                id: existing.id,
            });
        }

        let secret = random_seed()?;
        let stored = StoredKey {
            name: name.to_string(),
            id: key_id(&secret),
            secret,
        };

        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(KEYS_TABLE)?;
            let data = postcard::to_allocvec(&stored)?;
            table.insert(name, data.as_slice())?;
        }
        write_txn.commit()?;

        info!(key = %name, id = %stored.id, "Generated key");
        Ok(KeyInfo {
            name: stored.name,
            id: stored.id,
        })
    }

    async fn key_find(&self, name: &str) -> SpaceResult<Option<KeyInfo>> {
        Ok(self.load_key(name)?.map(|k| KeyInfo {
            name: k.name,
            id: k.id,
        }))
    }

    async fn keys_names(&self) -> SpaceResult<Vec<String>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(KEYS_TABLE)?;

        let mut names = Vec::new();
        for entry in table.iter()? {
            let (key, _) = entry?;
            names.push(key.value().to_string());
        }
        Ok(names)
    }

    async fn add_bytes(&self, data: &[u8]) -> SpaceResult<Cid> {
        let cid = content::raw_cid(data);
        self.put_block(&cid, data)?;
        Ok(cid)
    }

    async fn add_path(&self, path: &Path, recursive: bool) -> SpaceResult<Cid> {
        let node = self.clone();
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || node.add_path_sync(&path, recursive))
            .await
            .map_err(|e| SpaceError::Node(format!("add worker failed: {}", e)))?
    }

    async fn cat(&self, cid: &Cid) -> SpaceResult<Bytes> {
        self.get_block(cid)?
            .map(Bytes::from)
            .ok_or_else(|| SpaceError::NotFound(cid.to_string()))
    }

    async fn dag_put(&self, node: &Value) -> SpaceResult<Cid> {
        if !self.options.dag_enabled {
            return Err(SpaceError::DagUnavailable);
        }
        let cid = content::json_cid(node)?;
        self.put_block(&cid, &content::canonical_json(node)?)?;
        Ok(cid)
    }

    async fn dag_get(&self, cid: &Cid) -> SpaceResult<Value> {
        if !self.options.dag_enabled {
            return Err(SpaceError::DagUnavailable);
        }
        let data = self
            .get_block(cid)?
            .ok_or_else(|| SpaceError::NotFound(cid.to_string()))?;
        Ok(serde_json::from_slice(&data)?)
    }

    async fn publish(&self, cid: &Cid, key: &str) -> Option<PublishResult> {
        let stored = match self.load_key(key) {
            Ok(Some(k)) => k,
            Ok(None) => {
                warn!(%key, "Publish: unknown key");
                return None;
            }
            Err(e) => {
                warn!(%key, error = %e, "Publish: key lookup failed");
                return None;
            }
        };

        match self.get_block(cid) {
            Ok(Some(_)) => {}
            Ok(None) => {
                warn!(%cid, "Publish: content not available locally");
                return None;
            }
            Err(e) => {
                warn!(%cid, error = %e, "Publish: block lookup failed");
                return None;
            }
        }

        let value = format!("/ipfs/{}", cid);
        let result: SpaceResult<()> = (|| {
            let db = self.db.read();
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(NAMES_TABLE)?;
                table.insert(stored.id.as_str(), value.as_str())?;
            }
            write_txn.commit()?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                debug!(key = %key, %value, "Published");
                Some(PublishResult {
                    name: stored.id,
                    value,
                })
            }
            Err(e) => {
                warn!(%key, error = %e, "Publish: failed to record name");
                None
            }
        }
    }

    async fn resolve(&self, key_id: &str) -> SpaceResult<Option<String>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(NAMES_TABLE)?;
        Ok(table.get(key_id)?.map(|v| v.value().to_string()))
    }

    async fn has_dag_command(&self) -> bool {
        self.options.dag_enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn open_node(dir: &TempDir) -> LocalNode {
        LocalNode::open(dir.path().join("node.redb")).unwrap()
    }

    #[tokio::test]
    async fn test_node_id_is_stable_across_reopen() {
        let dir = TempDir::new().unwrap();
        let id = open_node(&dir).node_id();
        let reopened = open_node(&dir);
        assert_eq!(id, reopened.node_id());
    }

    #[tokio::test]
    async fn test_mkdir_creates_parents() {
        let dir = TempDir::new().unwrap();
        let node = open_node(&dir);

        node.files_mkdir("/alice/files/home").await.unwrap();

        assert!(node.files_exists("/alice").await.unwrap());
        assert!(node.files_exists("/alice/files").await.unwrap());
        assert!(node.files_exists("/alice/files/home/").await.unwrap());
        assert!(!node.files_exists("/bob").await.unwrap());
    }

    #[tokio::test]
    async fn test_files_write_and_read() {
        let dir = TempDir::new().unwrap();
        let node = open_node(&dir);

        assert!(node.files_read("/alice/data/x").await.unwrap().is_none());

        node.files_write("/alice/data/x", b"one").await.unwrap();
        node.files_write("/alice/data/x", b"two").await.unwrap();

        let data = node.files_read("/alice/data/x").await.unwrap().unwrap();
        assert_eq!(&data[..], b"two");
        assert!(node.files_exists("/alice/data").await.unwrap());

        // Writing over a directory is refused
        assert!(node.files_write("/alice/data", b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_key_gen_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let node = open_node(&dir);

        let first = node.key_gen("galacteek.alice.root").await.unwrap();
        let second = node.key_gen("galacteek.alice.root").await.unwrap();
        assert_eq!(first, second);

        let found = node.key_find("galacteek.alice.root").await.unwrap();
        assert_eq!(found, Some(first));
        assert!(node.key_find("missing").await.unwrap().is_none());
        assert_eq!(
            node.keys_names().await.unwrap(),
            vec!["galacteek.alice.root".to_string()]
        );
    }

    #[tokio::test]
    async fn test_add_and_cat() {
        let dir = TempDir::new().unwrap();
        let node = open_node(&dir);

        let cid = node.add_bytes(b"hello").await.unwrap();
        assert_eq!(cid, content::raw_cid(b"hello"));
        assert_eq!(&node.cat(&cid).await.unwrap()[..], b"hello");

        let missing = content::raw_cid(b"missing");
        assert!(matches!(
            node.cat(&missing).await,
            Err(SpaceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_add_path_directory() {
        let dir = TempDir::new().unwrap();
        let node = open_node(&dir);

        let assets = dir.path().join("css");
        std::fs::create_dir_all(&assets).unwrap();
        std::fs::write(assets.join("main.css"), "body {}").unwrap();

        assert!(node.add_path(&assets, false).await.is_err());

        let cid = node.add_path(&assets, true).await.unwrap();
        let listing = node.dag_get(&cid).await.unwrap();
        let file_cid = content::raw_cid(b"body {}").to_string();
        assert_eq!(listing, json!({ "main.css": { "/": file_cid } }));
    }

    #[tokio::test]
    async fn test_add_path_nested_directories() {
        let dir = TempDir::new().unwrap();
        let node = open_node(&dir);

        let assets = dir.path().join("assets");
        std::fs::create_dir_all(assets.join("css")).unwrap();
        std::fs::write(assets.join("css/main.css"), "body {}").unwrap();
        std::fs::write(assets.join("ipfs-cube.png"), [0x89, b'P', b'N', b'G']).unwrap();

        let cid = node.add_path(&assets, true).await.unwrap();
        let listing = node.dag_get(&cid).await.unwrap();
        let css_cid = Cid::try_from(listing["css"]["/"].as_str().unwrap()).unwrap();
        assert_eq!(
            node.dag_get(&css_cid).await.unwrap(),
            json!({ "main.css": { "/": content::raw_cid(b"body {}").to_string() } })
        );
        assert!(listing.get("ipfs-cube.png").is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_add_path_skips_symlinks() {
        let dir = TempDir::new().unwrap();
        let node = open_node(&dir);

        let assets = dir.path().join("assets");
        std::fs::create_dir_all(&assets).unwrap();
        std::fs::write(assets.join("main.css"), "body {}").unwrap();
        // Loop back to the directory itself
        std::os::unix::fs::symlink(&assets, assets.join("loop")).unwrap();

        let cid = node.add_path(&assets, true).await.unwrap();
        let file_cid = content::raw_cid(b"body {}").to_string();
        assert_eq!(
            node.dag_get(&cid).await.unwrap(),
            json!({ "main.css": { "/": file_cid } })
        );
    }

    #[tokio::test]
    async fn test_dag_put_get() {
        let dir = TempDir::new().unwrap();
        let node = open_node(&dir);

        let tree = json!({ "index.html": "Blank", "media": { "images": {} } });
        let cid = node.dag_put(&tree).await.unwrap();
        assert_eq!(cid, content::json_cid(&tree).unwrap());
        assert_eq!(node.dag_get(&cid).await.unwrap(), tree);
    }

    #[tokio::test]
    async fn test_dag_disabled() {
        let dir = TempDir::new().unwrap();
        let node = LocalNode::open_with(
            dir.path().join("node.redb"),
            LocalNodeOptions { dag_enabled: false },
        )
        .unwrap();

        assert!(!node.has_dag_command().await);
        assert!(matches!(
            node.dag_put(&json!({})).await,
            Err(SpaceError::DagUnavailable)
        ));
    }

    #[tokio::test]
    async fn test_publish_and_resolve() {
        let dir = TempDir::new().unwrap();
        let node = open_node(&dir);

        let cid = node.dag_put(&json!({ "a": 1 })).await.unwrap();

        // Unknown key
        assert!(node.publish(&cid, "nokey").await.is_none());

        let key = node.key_gen("galacteek.alice.root").await.unwrap();

        // Content must be available
        let absent = content::raw_cid(b"absent");
        assert!(node.publish(&absent, &key.name).await.is_none());

        let result = node.publish(&cid, &key.name).await.unwrap();
        assert_eq!(result.name, key.id);
        assert_eq!(result.value, format!("/ipfs/{}", cid));
        assert_eq!(
            node.resolve(&key.id).await.unwrap(),
            Some(format!("/ipfs/{}", cid))
        );
    }
}
