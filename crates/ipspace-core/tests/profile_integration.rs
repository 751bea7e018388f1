//! User Profile Integration Tests
//!
//! End-to-end runs of the profile lifecycle against a local storage node.
//!
//! ## What These Tests Verify
//!
//! - Initialization provisions the filesystem tree, keys and root key
//! - User information edits save, relink and republish exactly once
//! - Locked documents ignore setters
//! - The published DAG root is the content hash of the tree
//! - Degraded mode without DAG support, fatal crypto failures
//! - Publish retries against a flaky node
//! - At most one publication in flight, ending on the newest root

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use ipspace_core::content::{json_cid, raw_cid};
use ipspace_core::crypto::rsa::generate_pem;
use ipspace_core::profile::{KeyPaths, ProfileState};
use ipspace_core::{
    KeyInfo, LocalNode, LocalNodeOptions, NodeHandle, PublishResult, RsaKeyPem, SpaceConfig,
    SpaceError, SpaceResult, StorageNode, UserProfile,
};
use serde_json::{json, Value};
use tempfile::{tempdir, TempDir};

fn test_config() -> SpaceConfig {
    let mut config = SpaceConfig::default();
    config.crypto.key_bits = 1024;
    config.publish.backoff_ms = 1;
    config
}

fn shared_keys() -> &'static RsaKeyPem {
    static KEYS: OnceLock<RsaKeyPem> = OnceLock::new();
    KEYS.get_or_init(|| generate_pem(1024).unwrap())
}

/// Write a keypair so init skips generation.
fn preseed_keys(crypto_dir: &Path, name: &str) {
    let paths = KeyPaths::new(crypto_dir, name);
    std::fs::create_dir_all(crypto_dir).unwrap();
    std::fs::write(&paths.private, &shared_keys().private_pem).unwrap();
    std::fs::write(&paths.public, &shared_keys().public_pem).unwrap();
}

fn open_node(dir: &TempDir) -> NodeHandle {
    Arc::new(LocalNode::open(dir.path().join("node.redb")).unwrap())
}

async fn init_profile(dir: &TempDir, node: NodeHandle, name: &str) -> UserProfile {
    let crypto_dir = dir.path().join("crypto");
    preseed_keys(&crypto_dir, name);
    let profile = UserProfile::new(name, node, test_config(), crypto_dir);
    profile.init().await.unwrap();
    profile.sync().await.unwrap();
    profile
}

// ═══════════════════════════════════════════════════════════════════════
// Initialization
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_alice_init_with_fresh_directories() {
    let dir = tempdir().unwrap();
    let node = open_node(&dir);
    let crypto_dir = dir.path().join("crypto");

    let profile = UserProfile::new("alice", node.clone(), test_config(), &crypto_dir);
    assert_eq!(profile.state(), ProfileState::Uninitialized);

    profile.init().await.unwrap();

    let tree = profile.paths().tree();
    assert_eq!(tree.len(), 10);
    for path in &tree {
        assert!(node.files_exists(path).await.unwrap(), "missing {}", path);
    }

    // Keypair generated since none existed
    assert!(profile.key_paths().private.exists());
    assert!(profile.key_paths().public.exists());

    assert!(node
        .keys_names()
        .await
        .unwrap()
        .contains(&"galacteek.alice.root".to_string()));
    assert_eq!(profile.root_key().unwrap().name, "galacteek.alice.root");

    assert!(profile.is_initialized());
    assert!(!profile.is_degraded());

    let userinfo = profile.userinfo().unwrap();
    assert_eq!(userinfo.peer_id(), node.node_id());
    assert_eq!(
        userinfo.rsa_public_pem().as_deref(),
        Some(std::fs::read_to_string(&profile.key_paths().public).unwrap().as_str())
    );

    profile.shutdown().await;
}

#[tokio::test]
async fn test_reinit_keeps_keys_and_userinfo() {
    let dir = tempdir().unwrap();
    let node = open_node(&dir);

    let (uid, key_id) = {
        let profile = init_profile(&dir, node.clone(), "alice").await;
        let mut infos = serde_json::Map::new();
        infos.insert("username".into(), json!("alice"));
        infos.insert("bio".into(), json!("gardener"));
        assert!(profile.userinfo().unwrap().set_infos(&infos));
        profile.sync().await.unwrap();
        profile.shutdown().await;
        (
            profile.userinfo().unwrap().uid(),
            profile.root_key().unwrap().id.clone(),
        )
    };

    let profile = init_profile(&dir, node.clone(), "alice").await;
    let userinfo = profile.userinfo().unwrap();
    assert_eq!(userinfo.uid(), uid);
    assert_eq!(userinfo.username(), "alice");
    assert_eq!(userinfo.bio(), "gardener");
    assert_eq!(profile.root_key().unwrap().id, key_id);

    profile.shutdown().await;
}

#[tokio::test]
async fn test_crypto_failure_is_fatal() {
    let dir = tempdir().unwrap();
    let node = open_node(&dir);

    let mut config = test_config();
    config.crypto.key_bits = 0;
    let profile = UserProfile::new("alice", node, config, dir.path().join("crypto"));

    let err = profile.init().await.unwrap_err();
    assert!(matches!(err, SpaceError::Profile(_)), "got {:?}", err);
    assert_eq!(profile.state(), ProfileState::FsProvisioned);
    assert!(!profile.is_initialized());
    assert!(profile.sync().await.is_err());
}

#[tokio::test]
async fn test_degraded_mode_without_dag() {
    let dir = tempdir().unwrap();
    let node: NodeHandle = Arc::new(
        LocalNode::open_with(
            dir.path().join("node.redb"),
            LocalNodeOptions { dag_enabled: false },
        )
        .unwrap(),
    );

    let profile = init_profile(&dir, node, "alice").await;
    assert!(profile.is_initialized());
    assert!(profile.is_degraded());
    assert!(profile.dag().is_none());

    profile.userinfo().unwrap().set_avatar_cid("bafy123");
    profile.sync().await.unwrap();

    assert!(matches!(
        profile.post_message("hello", "world").await,
        Err(SpaceError::DagUnavailable)
    ));
    assert_eq!(profile.stats().publishes, 0);

    profile.shutdown().await;
}

// ═══════════════════════════════════════════════════════════════════════
// Update / publish cycle
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_avatar_change_republishes_once() {
    let dir = tempdir().unwrap();
    let profile = init_profile(&dir, open_node(&dir), "alice").await;
    let userinfo = profile.userinfo().unwrap();
    let before = profile.stats();
    assert!(before.publishes >= 1);

    // Modification dates have one second resolution
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    let modified = userinfo.date_modified();

    assert!(userinfo.set_avatar_cid("bafy123"));
    profile.sync().await.unwrap();

    assert_eq!(userinfo.avatar_cid(), "bafy123");
    assert_ne!(userinfo.date_modified(), modified);

    let after = profile.stats();
    assert_eq!(after.publishes, before.publishes + 1);
    assert_eq!(after.updates, before.updates + 1);

    profile.shutdown().await;
}

#[tokio::test]
async fn test_media_images_linked_in_dag() {
    let dir = tempdir().unwrap();
    let crypto_dir = dir.path().join("crypto");
    preseed_keys(&crypto_dir, "alice");

    let cube = dir.path().join("ipfs-cube-64.png");
    std::fs::write(&cube, b"cube pixels").unwrap();

    let mut config = test_config();
    config.media_images.insert("ipfs-cube.png".to_string(), cube);
    config
        .media_images
        .insert("missing.png".to_string(), dir.path().join("missing.png"));

    let profile = UserProfile::new("alice", open_node(&dir), config, crypto_dir);
    profile.init().await.unwrap();
    profile.sync().await.unwrap();

    let root = profile.dag().unwrap().root();
    let images = &root["media"]["images"];
    assert_eq!(
        images["ipfs-cube.png"],
        json!({ "/": raw_cid(b"cube pixels").to_string() })
    );
    assert!(images.get("missing.png").is_none());

    profile.shutdown().await;
}

#[tokio::test]
async fn test_locked_userinfo_ignores_setters() {
    let dir = tempdir().unwrap();
    let profile = init_profile(&dir, open_node(&dir), "alice").await;
    let userinfo = profile.userinfo().unwrap();

    assert!(userinfo.set_lock(true));
    profile.sync().await.unwrap();

    let snapshot = userinfo.root();
    let publishes = profile.stats().publishes;
    let mut events = userinfo.subscribe();

    assert!(!userinfo.set_avatar_cid("bafy123"));
    assert!(!userinfo.set_country_info("France", "FR"));
    profile.sync().await.unwrap();

    assert_eq!(userinfo.root(), snapshot);
    assert!(events.try_recv().is_err());
    assert_eq!(profile.stats().publishes, publishes);

    profile.shutdown().await;
}

#[tokio::test]
async fn test_published_root_is_content_hash() {
    let dir = tempdir().unwrap();
    let profile = init_profile(&dir, open_node(&dir), "alice").await;
    profile.post_message("hello", "first post").await.unwrap();
    profile.post_message("again", "second post").await.unwrap();
    profile.sync().await.unwrap();

    let dag = profile.dag().unwrap();
    let cid = dag.dag_cid().unwrap();
    assert_eq!(cid, json_cid(&dag.root()).unwrap());

    let messages = dag.root()["board"]["messages"].as_array().unwrap().len();
    assert_eq!(messages, 2);

    assert_eq!(profile.resolve().await.unwrap(), Some(format!("/ipfs/{}", cid)));

    profile.shutdown().await;
}

#[tokio::test]
async fn test_encrypt_self_roundtrip() {
    let dir = tempdir().unwrap();
    let profile = init_profile(&dir, open_node(&dir), "alice").await;

    let cid = profile.encrypt_self(b"only for me").await.unwrap();
    assert_eq!(profile.decrypt_object(&cid).await.unwrap(), b"only for me");

    profile.shutdown().await;
}

// ═══════════════════════════════════════════════════════════════════════
// Flaky publication
// ═══════════════════════════════════════════════════════════════════════

/// Local node whose first `failures` publications fail, each one taking
/// `delay`. Tracks the peak number of concurrent publications.
struct FlakyNode {
    inner: LocalNode,
    failures: AtomicU32,
    attempts: AtomicU32,
    delay: Duration,
    in_flight: AtomicU32,
    peak_in_flight: AtomicU32,
}

#[async_trait]
impl StorageNode for FlakyNode {
    fn node_id(&self) -> String {
        self.inner.node_id()
    }
    async fn files_mkdir(&self, path: &str) -> SpaceResult<()> {
        self.inner.files_mkdir(path).await
    }
    async fn files_exists(&self, path: &str) -> SpaceResult<bool> {
        self.inner.files_exists(path).await
    }
    async fn files_write(&self, path: &str, data: &[u8]) -> SpaceResult<()> {
        self.inner.files_write(path, data).await
    }
    async fn files_read(&self, path: &str) -> SpaceResult<Option<Bytes>> {
        self.inner.files_read(path).await
    }
    async fn key_gen(&self, name: &str) -> SpaceResult<KeyInfo> {
        self.inner.key_gen(name).await
    }
    async fn key_find(&self, name: &str) -> SpaceResult<Option<KeyInfo>> {
        self.inner.key_find(name).await
    }
    async fn keys_names(&self) -> SpaceResult<Vec<String>> {
        self.inner.keys_names().await
    }
    async fn add_bytes(&self, data: &[u8]) -> SpaceResult<Cid> {
        self.inner.add_bytes(data).await
    }
    async fn add_path(&self, path: &Path, recursive: bool) -> SpaceResult<Cid> {
        self.inner.add_path(path, recursive).await
    }
    async fn cat(&self, cid: &Cid) -> SpaceResult<Bytes> {
        self.inner.cat(cid).await
    }
    async fn dag_put(&self, node: &Value) -> SpaceResult<Cid> {
        self.inner.dag_put(node).await
    }
    async fn dag_get(&self, cid: &Cid) -> SpaceResult<Value> {
        self.inner.dag_get(cid).await
    }
    async fn publish(&self, cid: &Cid, key: &str) -> Option<PublishResult> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let left = self.failures.load(Ordering::SeqCst);
        let result = if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            None
        } else {
            self.inner.publish(cid, key).await
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
    async fn resolve(&self, key_id: &str) -> SpaceResult<Option<String>> {
        self.inner.resolve(key_id).await
    }
    async fn has_dag_command(&self) -> bool {
        self.inner.has_dag_command().await
    }
}

fn flaky_node(dir: &TempDir, failures: u32) -> Arc<FlakyNode> {
    slow_node(dir, failures, Duration::ZERO)
}

fn slow_node(dir: &TempDir, failures: u32, delay: Duration) -> Arc<FlakyNode> {
    Arc::new(FlakyNode {
        inner: LocalNode::open(dir.path().join("node.redb")).unwrap(),
        failures: AtomicU32::new(failures),
        attempts: AtomicU32::new(0),
        delay,
        in_flight: AtomicU32::new(0),
        peak_in_flight: AtomicU32::new(0),
    })
}

#[tokio::test]
async fn test_publish_retries_until_success() {
    let dir = tempdir().unwrap();
    let node = flaky_node(&dir, 2);
    let profile = init_profile(&dir, node.clone(), "alice").await;

    let stats = profile.stats();
    assert_eq!(stats.publishes, 1);
    assert_eq!(stats.publish_failures, 0);
    assert_eq!(node.attempts.load(Ordering::SeqCst), 3);

    profile.shutdown().await;
}

#[tokio::test]
async fn test_publish_gives_up_after_retries() {
    let dir = tempdir().unwrap();
    let node = flaky_node(&dir, 100);
    let profile = init_profile(&dir, node.clone(), "alice").await;

    let stats = profile.stats();
    assert_eq!(stats.publishes, 0);
    assert_eq!(stats.publish_failures, 1);
    // First attempt plus the configured retries
    assert_eq!(node.attempts.load(Ordering::SeqCst), 4);
    assert!(profile.resolve().await.unwrap().is_none());

    profile.shutdown().await;
}

#[tokio::test]
async fn test_single_publication_in_flight() {
    let dir = tempdir().unwrap();
    let node = slow_node(&dir, 1, Duration::from_millis(50));
    let profile = init_profile(&dir, node.clone(), "alice").await;

    // Scheduled, triggered by a DAG change and direct publications overlap
    profile.schedule_publish().unwrap();
    profile.post_message("Hello", "First message").await.unwrap();
    let (first, second) = tokio::join!(profile.publish_dag(), profile.publish_dag());
    profile.userinfo().unwrap().set_avatar_cid("bafy123");
    profile.sync().await.unwrap();

    assert_eq!(node.peak_in_flight.load(Ordering::SeqCst), 1);
    assert!(first.unwrap().is_some());
    assert!(second.unwrap().is_some());

    // The name ends up bound to the newest root
    let newest = profile.dag().unwrap().dag_cid().unwrap();
    assert_eq!(
        profile.resolve().await.unwrap(),
        Some(format!("/ipfs/{}", newest))
    );

    profile.shutdown().await;
}

#[tokio::test]
async fn test_publish_dag_reports_result() {
    let dir = tempdir().unwrap();
    let node = flaky_node(&dir, 0);
    let profile = init_profile(&dir, node.clone(), "alice").await;

    let result = profile.publish_dag().await.unwrap().unwrap();
    let root = profile.dag().unwrap().dag_cid().unwrap();
    assert_eq!(result.value, format!("/ipfs/{}", root));
    assert_eq!(result.name, profile.root_key().unwrap().id);

    profile.shutdown().await;
}
