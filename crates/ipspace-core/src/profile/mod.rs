//! User profile orchestrator
//!
//! A profile ties together its filesystem tree in the node's mutable
//! namespace, an RSA identity, the encrypted [`UserInfo`] document, the
//! user DAG and the named key the DAG is published under.
//!
//! ## Initialization
//!
//! ```text
//! Uninitialized
//!   │ mkdir root + fixed tree
//!   ▼
//! FsProvisioned
//!   │ RSA keypair present (generated when neither file exists)   ✗ fatal
//!   ▼
//! CryptoReady
//!   │ agent built, UserInfo loaded, root key ensured             ✗ fatal
//!   ▼
//! KeyRegistered
//!   │ DAG loaded, user app ready                                 ✗ degraded
//!   ▼
//! DagAttached
//!   │ worker spawned, first update scheduled
//!   ▼
//! Initialized
//! ```
//!
//! After init, changes flow through a single worker task: a UserInfo
//! change saves the document and runs `update()`, a DAG change publishes
//! the new root.

mod app;
mod paths;
mod userinfo;
mod worker;

pub use app::{BasicHomeRenderer, HomeContext, HomeRenderer, UserApp};
pub use paths::{profile_root, KeyPaths, ProfilePaths};
pub use userinfo::{UserInfo, UserInfoSchema, GENDER_FEMALE, GENDER_MALE, GENDER_UNSPECIFIED, SCHEMA_VERSION};
pub use worker::{ProfileStats, StatsSnapshot};

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use cid::Cid;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::SpaceConfig;
use crate::crypto::{CryptoAgent, RsaExecutor};
use crate::dag::EvolvingDag;
use crate::error::{SpaceError, SpaceResult};
use crate::node::{KeyInfo, NodeHandle, PublishResult};
use worker::{ProfileCore, WorkerCommand, WorkerHandle};

/// Initialization progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProfileState {
    Uninitialized,
    FsProvisioned,
    CryptoReady,
    KeyRegistered,
    DagAttached,
    Initialized,
}

struct Running {
    core: Arc<ProfileCore>,
    worker: WorkerHandle,
}

/// A local user profile.
pub struct UserProfile {
    name: String,
    paths: ProfilePaths,
    key_paths: KeyPaths,
    node: NodeHandle,
    config: SpaceConfig,
    executor: RsaExecutor,
    renderer: Arc<dyn HomeRenderer>,
    state: watch::Sender<ProfileState>,
    stats: Arc<ProfileStats>,
    running: OnceLock<Running>,
}

impl UserProfile {
    /// Create a profile rooted at [`profile_root`], with its RSA keys in
    /// `crypto_dir`.
    pub fn new(
        name: impl Into<String>,
        node: NodeHandle,
        config: SpaceConfig,
        crypto_dir: impl AsRef<Path>,
    ) -> Self {
        let name = name.into();
        let (state, _) = watch::channel(ProfileState::Uninitialized);
        Self {
            paths: ProfilePaths::new(profile_root(&name)),
            key_paths: KeyPaths::new(crypto_dir, &name),
            executor: RsaExecutor::new(config.crypto.workers, config.crypto.key_bits),
            renderer: Arc::new(BasicHomeRenderer),
            stats: Arc::new(ProfileStats::default()),
            running: OnceLock::new(),
            name,
            node,
            config,
            state,
        }
    }

    /// Use another mutable-namespace root.
    pub fn with_root(mut self, root: impl Into<String>) -> Self {
        self.paths = ProfilePaths::new(root);
        self
    }

    /// Use another home page renderer.
    pub fn with_renderer(mut self, renderer: Arc<dyn HomeRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    /// Share an RSA executor between profiles.
    pub fn with_executor(mut self, executor: RsaExecutor) -> Self {
        self.executor = executor;
        self
    }

    /// Profile name, as given to [`UserProfile::new`].
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Paths of the profile tree in the node's mutable namespace.
    pub fn paths(&self) -> &ProfilePaths {
        &self.paths
    }

    /// On-disk locations of the RSA keypair.
    pub fn key_paths(&self) -> &KeyPaths {
        &self.key_paths
    }

    /// Local name of the key the DAG is published under.
    pub fn root_key_name(&self) -> String {
        format!("{}.{}.root", self.config.key_namespace, self.name)
    }

    /// Root key, once registered.
    pub fn root_key(&self) -> Option<&KeyInfo> {
        self.running.get().map(|r| &r.core.root_key)
    }

    /// Current initialization state.
    pub fn state(&self) -> ProfileState {
        *self.state.borrow()
    }

    /// Watch initialization progress.
    pub fn subscribe_state(&self) -> watch::Receiver<ProfileState> {
        self.state.subscribe()
    }

    /// Whether [`UserProfile::init`] ran to completion.
    pub fn is_initialized(&self) -> bool {
        self.state() == ProfileState::Initialized
    }

    /// Initialized without DAG capability.
    pub fn is_degraded(&self) -> bool {
        self.running
            .get()
            .map(|r| r.core.dag.is_none())
            .unwrap_or(false)
    }

    /// User information document, once initialized.
    pub fn userinfo(&self) -> Option<&Arc<UserInfo>> {
        self.running.get().map(|r| &r.core.userinfo)
    }

    /// User DAG; `None` before init and in degraded mode.
    pub fn dag(&self) -> Option<&Arc<EvolvingDag>> {
        self.running.get().and_then(|r| r.core.dag.as_ref())
    }

    /// Crypto agent bound to the profile's RSA keys, once initialized.
    pub fn crypto(&self) -> Option<&Arc<CryptoAgent>> {
        self.running.get().map(|r| &r.core.agent)
    }

    /// Worker counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn set_state(&self, state: ProfileState) {
        debug!(profile = %self.name, ?state, "Profile state");
        self.state.send_replace(state);
    }

    fn running(&self) -> SpaceResult<&Running> {
        self.running.get().ok_or_else(|| {
            SpaceError::InvalidOperation(format!("Profile {} is not initialized", self.name))
        })
    }

    /// Run the initialization sequence.
    ///
    /// Crypto failures are fatal ([`SpaceError::Profile`]). A node without
    /// DAG capability leaves the profile initialized in degraded mode.
    pub async fn init(&self) -> SpaceResult<()> {
        if self.running.get().is_some() {
            return Ok(());
        }

        info!(profile = %self.name, root = %self.paths.root(), "Initializing filesystem");
        self.node.files_mkdir(self.paths.root()).await?;
        for dir in self.paths.tree() {
            self.node.files_mkdir(&dir).await?;
        }
        self.set_state(ProfileState::FsProvisioned);

        info!(profile = %self.name, "Initializing crypto");
        self.ensure_keypair().await.map_err(|e| {
            warn!(profile = %self.name, error = %e, "Crypto init failed");
            SpaceError::Profile(format!("Crypto init failed: {}", e))
        })?;
        self.set_state(ProfileState::CryptoReady);

        let (agent, userinfo) = self.register_keys().await.map_err(|e| {
            warn!(profile = %self.name, error = %e, "Key registration failed");
            SpaceError::Profile(format!("Key registration failed: {}", e))
        })?;
        let root_key = self.ensure_root_key().await?;
        self.set_state(ProfileState::KeyRegistered);

        if userinfo.avatar_cid().is_empty() {
            if let Some(avatar) = &self.config.default_avatar {
                userinfo.set_avatar_cid(avatar);
            }
        }
        if userinfo.peer_id().is_empty() {
            userinfo.set_peer_id(&self.node.node_id());
        }
        userinfo.save().await?;

        let (dag, app) = self.attach_dag().await;
        if dag.is_some() {
            self.set_state(ProfileState::DagAttached);
        }

        let core = Arc::new(ProfileCore {
            name: self.name.clone(),
            node: self.node.clone(),
            agent,
            userinfo,
            dag,
            app,
            root_key,
            publish: self.config.publish.clone(),
            stats: self.stats.clone(),
        });
        let worker = WorkerHandle::spawn(core.clone());
        worker.send(WorkerCommand::Update)?;

        if let Err(running) = self.running.set(Running { core, worker }) {
            running.worker.shutdown().await;
            return Err(SpaceError::InvalidOperation(format!(
                "Profile {} initialized concurrently",
                self.name
            )));
        }

        self.set_state(ProfileState::Initialized);
        info!(profile = %self.name, degraded = self.is_degraded(), "Initialization complete");
        Ok(())
    }

    async fn ensure_keypair(&self) -> SpaceResult<()> {
        let KeyPaths { private, public } = &self.key_paths;
        let have_private = tokio::fs::try_exists(private).await.unwrap_or(false);
        let have_public = tokio::fs::try_exists(public).await.unwrap_or(false);
        if have_private || have_public {
            debug!(profile = %self.name, "RSA keypair present");
            return Ok(());
        }

        info!(profile = %self.name, bits = self.executor.key_bits(), "Creating RSA keypair");
        let keys = self
            .executor
            .gen_keys()
            .await
            .ok_or_else(|| SpaceError::Crypto("RSA keygen failed".to_string()))?;

        if let Some(dir) = private.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(private, keys.private_pem.as_bytes()).await?;
        tokio::fs::write(public, keys.public_pem.as_bytes()).await?;
        info!(profile = %self.name, "Created RSA keypair");
        Ok(())
    }

    async fn register_keys(&self) -> SpaceResult<(Arc<CryptoAgent>, Arc<UserInfo>)> {
        info!(profile = %self.name, "Registering keys");
        let public_pem = tokio::fs::read_to_string(&self.key_paths.public).await?;
        let agent = Arc::new(CryptoAgent::new(
            self.node.clone(),
            self.executor.clone(),
            &public_pem,
            self.key_paths.private.clone(),
        )?);

        let userinfo = Arc::new(UserInfo::new(
            self.node.clone(),
            agent.clone(),
            self.paths.userinfo(),
        ));
        let status = userinfo.load().await;
        debug!(profile = %self.name, ?status, "Loaded user information");

        userinfo.update_ident_token();
        userinfo.set_rsa_public_pem(agent.public_pem());
        Ok((agent, userinfo))
    }

    async fn ensure_root_key(&self) -> SpaceResult<KeyInfo> {
        let name = self.root_key_name();
        let names = self.node.keys_names().await?;
        if !names.contains(&name) {
            info!(profile = %self.name, key = %name, "Generating root key");
            self.node.key_gen(&name).await?;
        }
        let key = self
            .node
            .key_find(&name)
            .await?
            .ok_or_else(|| SpaceError::NotFound(format!("key {}", name)))?;
        debug!(profile = %self.name, key = %key.name, id = %key.id, "Root key");
        Ok(key)
    }

    async fn attach_dag(&self) -> (Option<Arc<EvolvingDag>>, Option<UserApp>) {
        if !self.node.has_dag_command().await {
            warn!(profile = %self.name, "DAG capability unavailable, running without DAG");
            return (None, None);
        }

        info!(profile = %self.name, "Loading DAG");
        let dag = Arc::new(EvolvingDag::new(self.node.clone(), self.paths.dag_meta()));
        if let Err(e) = dag.load().await {
            warn!(profile = %self.name, error = %e, "Cannot load DAG, running without DAG");
            return (None, None);
        }

        let assets = self.config.assets_dir.as_deref();
        let images = &self.config.media_images;
        match UserApp::init(self.node.clone(), self.renderer.clone(), assets, images).await {
            Ok(app) => (Some(dag), Some(app)),
            Err(e) => {
                warn!(profile = %self.name, error = %e, "Cannot initialize user app");
                (Some(dag), None)
            }
        }
    }

    /// Schedule a home page update.
    pub fn schedule_update(&self) -> SpaceResult<()> {
        self.running()?.worker.send(WorkerCommand::Update)
    }

    /// Schedule a DAG publication.
    pub fn schedule_publish(&self) -> SpaceResult<()> {
        self.running()?.worker.send(WorkerCommand::Publish)
    }

    /// Wait until queued saves, updates and publications are done.
    pub async fn sync(&self) -> SpaceResult<()> {
        self.running()?.worker.sync().await
    }

    /// Publish the current DAG root and wait for the outcome.
    ///
    /// Runs on the profile worker: concurrent calls and scheduled
    /// publications coalesce into one run against the latest root.
    pub async fn publish_dag(&self) -> SpaceResult<Option<PublishResult>> {
        self.running()?.worker.publish().await
    }

    /// Append a message to the board and schedule an update.
    pub async fn post_message(&self, title: &str, text: &str) -> SpaceResult<Cid> {
        let running = self.running()?;
        let (Some(dag), Some(app)) = (&running.core.dag, &running.core.app) else {
            return Err(SpaceError::DagUnavailable);
        };
        let cid = app.post_message(dag, title, text).await?;
        running.worker.send(WorkerCommand::Update)?;
        Ok(cid)
    }

    /// Encrypt `data` for this profile and store it.
    pub async fn encrypt_self(&self, data: &[u8]) -> SpaceResult<Cid> {
        self.running()?.core.agent.store_self(data).await
    }

    /// Fetch and decrypt an object stored with [`UserProfile::encrypt_self`].
    pub async fn decrypt_object(&self, cid: &Cid) -> SpaceResult<Vec<u8>> {
        self.running()?.core.agent.decrypt_object(cid).await
    }

    /// Current binding of the root key.
    pub async fn resolve(&self) -> SpaceResult<Option<String>> {
        let running = self.running()?;
        self.node.resolve(&running.core.root_key.id).await
    }

    /// Drain pending work and stop the worker.
    pub async fn shutdown(&self) {
        if let Some(running) = self.running.get() {
            running.worker.shutdown().await;
            info!(profile = %self.name, "Profile shut down");
        }
    }
}

/// Default crypto directory under a data directory.
pub fn crypto_dir(data_dir: impl AsRef<Path>) -> PathBuf {
    data_dir.as_ref().join("crypto")
}
