//! Per-profile update/publish worker
//!
//! One task per profile consumes, in priority order:
//!
//! 1. user information changes → save the document, then `update()`
//! 2. DAG changes → `publish_dag()`
//! 3. commands (`Update`, `Publish`, `PublishNow`, `Sync`, `Shutdown`)
//!
//! Work is single flight: the task runs one job at a time, and bursts of
//! triggers collapse into pending flags, so the next run always works on
//! the latest state. The worker is the only caller of `publish_dag()`, so
//! at most one publication per profile is ever in flight.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cid::Cid;
use parking_lot::Mutex;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::app::UserApp;
use super::userinfo::UserInfo;
use crate::config::PublishConfig;
use crate::crypto::CryptoAgent;
use crate::dag::{DagEvent, EvolvingDag};
use crate::document::DocumentEvent;
use crate::error::{SpaceError, SpaceResult};
use crate::node::{KeyInfo, NodeHandle, PublishResult};

/// Counters of a profile worker
#[derive(Debug, Default)]
pub struct ProfileStats {
    updates: AtomicU64,
    publishes: AtomicU64,
    publish_failures: AtomicU64,
}

/// Point-in-time copy of [`ProfileStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Completed `update()` runs
    pub updates: u64,
    /// Successful name publications
    pub publishes: u64,
    /// Publications that failed after every retry
    pub publish_failures: u64,
}

impl ProfileStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            updates: self.updates.load(Ordering::Relaxed),
            publishes: self.publishes.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
        }
    }
}

/// Everything an initialized profile is made of.
pub(crate) struct ProfileCore {
    pub name: String,
    pub node: NodeHandle,
    pub agent: Arc<CryptoAgent>,
    pub userinfo: Arc<UserInfo>,
    pub dag: Option<Arc<EvolvingDag>>,
    pub app: Option<UserApp>,
    pub root_key: KeyInfo,
    pub publish: PublishConfig,
    pub stats: Arc<ProfileStats>,
}

impl ProfileCore {
    /// Regenerate the home page and relink it into the DAG.
    pub async fn update(&self) -> SpaceResult<Option<Cid>> {
        let (Some(dag), Some(app)) = (&self.dag, &self.app) else {
            debug!(profile = %self.name, "No DAG, nothing to update");
            return Ok(None);
        };
        let cid = app.update(dag, &self.userinfo).await?;
        self.stats.updates.fetch_add(1, Ordering::Relaxed);
        debug!(profile = %self.name, %cid, "Updated DAG");
        Ok(Some(cid))
    }

    /// Bind the root key to the current DAG root, retrying with
    /// exponential backoff.
    pub async fn publish_dag(&self) -> Option<PublishResult> {
        let dag = self.dag.as_ref()?;
        let mut delay = self.publish.backoff();

        for attempt in 0..=self.publish.retries {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }

            // Never publish a tree that is being edited
            let Some(cid) = dag.snapshot_exclusive().await.cid else {
                debug!(profile = %self.name, "DAG has no root yet");
                return None;
            };

            match self.node.publish(&cid, &self.root_key.name).await {
                Some(result) => {
                    self.stats.publishes.fetch_add(1, Ordering::Relaxed);
                    info!(profile = %self.name, key = %result.name, value = %result.value, "Published DAG");
                    return Some(result);
                }
                None => {
                    warn!(profile = %self.name, %cid, attempt, "DAG publish failed");
                }
            }
        }

        self.stats.publish_failures.fetch_add(1, Ordering::Relaxed);
        None
    }
}

pub(crate) enum WorkerCommand {
    Update,
    Publish,
    /// Publish and report the outcome of the run that served the request
    PublishNow(oneshot::Sender<Option<PublishResult>>),
    Sync(oneshot::Sender<()>),
    Shutdown,
}

#[derive(Default)]
struct Pending {
    save: bool,
    update: bool,
    publish: bool,
    waiters: Vec<oneshot::Sender<()>>,
    publish_waiters: Vec<oneshot::Sender<Option<PublishResult>>>,
    shutdown: bool,
}

impl Pending {
    fn has_work(&self) -> bool {
        self.save || self.update || self.publish
    }
}

enum Incoming {
    UserInfo(Result<DocumentEvent, RecvError>),
    Dag(Result<DagEvent, RecvError>),
    Command(Option<WorkerCommand>),
}

async fn recv_dag(rx: &mut Option<broadcast::Receiver<DagEvent>>) -> Result<DagEvent, RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Handle to a running worker.
pub(crate) struct WorkerHandle {
    tx: mpsc::UnboundedSender<WorkerCommand>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerHandle {
    pub fn spawn(core: Arc<ProfileCore>) -> Self {
        let (tx, commands) = mpsc::unbounded_channel();
        let worker = ProfileWorker {
            userinfo_rx: Some(core.userinfo.subscribe()),
            dag_rx: core.dag.as_ref().map(|dag| dag.subscribe()),
            core,
            commands,
            pending: Pending::default(),
        };
        let task = tokio::spawn(worker.run());
        Self {
            tx,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn send(&self, command: WorkerCommand) -> SpaceResult<()> {
        self.tx
            .send(command)
            .map_err(|_| SpaceError::InvalidOperation("Profile worker stopped".to_string()))
    }

    /// Queue a publication and wait for its result.
    pub async fn publish(&self) -> SpaceResult<Option<PublishResult>> {
        let (ack, done) = oneshot::channel();
        self.send(WorkerCommand::PublishNow(ack))?;
        done.await
            .map_err(|_| SpaceError::InvalidOperation("Profile worker stopped".to_string()))
    }

    /// Wait until all work queued so far, and everything it triggers, is done.
    pub async fn sync(&self) -> SpaceResult<()> {
        let (ack, done) = oneshot::channel();
        self.send(WorkerCommand::Sync(ack))?;
        done.await
            .map_err(|_| SpaceError::InvalidOperation("Profile worker stopped".to_string()))
    }

    /// Finish pending work and stop. Later calls return immediately.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(WorkerCommand::Shutdown);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Profile worker panicked");
            }
        }
    }
}

struct ProfileWorker {
    core: Arc<ProfileCore>,
    userinfo_rx: Option<broadcast::Receiver<DocumentEvent>>,
    dag_rx: Option<broadcast::Receiver<DagEvent>>,
    commands: mpsc::UnboundedReceiver<WorkerCommand>,
    pending: Pending,
}

impl ProfileWorker {
    async fn run(mut self) {
        debug!(profile = %self.core.name, "Profile worker started");

        while !self.pending.shutdown {
            let incoming = tokio::select! {
                biased;
                ev = recv_userinfo(&mut self.userinfo_rx) => Incoming::UserInfo(ev),
                ev = recv_dag(&mut self.dag_rx) => Incoming::Dag(ev),
                cmd = self.commands.recv() => Incoming::Command(cmd),
            };
            self.handle(incoming);

            loop {
                self.collect_ready();
                if !self.pending.has_work() {
                    break;
                }
                self.run_pending().await;
            }

            for waiter in self.pending.waiters.drain(..) {
                let _ = waiter.send(());
            }
        }

        debug!(profile = %self.core.name, "Profile worker stopped");
    }

    fn handle(&mut self, incoming: Incoming) {
        match incoming {
            Incoming::UserInfo(Ok(DocumentEvent::Changed)) | Incoming::UserInfo(Err(RecvError::Lagged(_))) => {
                self.pending.save = true;
                self.pending.update = true;
            }
            Incoming::UserInfo(Ok(DocumentEvent::Saved)) => {}
            Incoming::UserInfo(Err(RecvError::Closed)) => self.userinfo_rx = None,
            Incoming::Dag(Ok(DagEvent::Changed(_))) | Incoming::Dag(Err(RecvError::Lagged(_))) => {
                self.pending.publish = true;
            }
            Incoming::Dag(Err(RecvError::Closed)) => self.dag_rx = None,
            Incoming::Command(Some(WorkerCommand::Update)) => self.pending.update = true,
            Incoming::Command(Some(WorkerCommand::Publish)) => self.pending.publish = true,
            Incoming::Command(Some(WorkerCommand::PublishNow(ack))) => {
                self.pending.publish = true;
                self.pending.publish_waiters.push(ack);
            }
            Incoming::Command(Some(WorkerCommand::Sync(ack))) => self.pending.waiters.push(ack),
            Incoming::Command(Some(WorkerCommand::Shutdown)) | Incoming::Command(None) => {
                self.pending.shutdown = true;
            }
        }
    }

    /// Fold everything already queued into the pending flags.
    fn collect_ready(&mut self) {
        loop {
            let ev = match self.userinfo_rx.as_mut() {
                Some(rx) => rx.try_recv(),
                None => break,
            };
            match ev {
                Ok(ev) => self.handle(Incoming::UserInfo(Ok(ev))),
                Err(TryRecvError::Lagged(n)) => self.handle(Incoming::UserInfo(Err(RecvError::Lagged(n)))),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Closed) => self.handle(Incoming::UserInfo(Err(RecvError::Closed))),
            }
        }
        loop {
            let ev = match self.dag_rx.as_mut() {
                Some(rx) => rx.try_recv(),
                None => break,
            };
            match ev {
                Ok(ev) => self.handle(Incoming::Dag(Ok(ev))),
                Err(TryRecvError::Lagged(n)) => self.handle(Incoming::Dag(Err(RecvError::Lagged(n)))),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Closed) => self.handle(Incoming::Dag(Err(RecvError::Closed))),
            }
        }
        while let Ok(cmd) = self.commands.try_recv() {
            self.handle(Incoming::Command(Some(cmd)));
        }
    }

    async fn run_pending(&mut self) {
        if std::mem::take(&mut self.pending.save) {
            if let Err(e) = self.core.userinfo.save().await {
                warn!(profile = %self.core.name, error = %e, "Cannot save user information");
            }
        }

        if std::mem::take(&mut self.pending.update) {
            if let Err(e) = self.core.update().await {
                warn!(profile = %self.core.name, error = %e, "Profile update failed");
            }
            // The commit above may have queued a DAG change; pick it up
            // before deciding whether to publish.
            return;
        }

        if std::mem::take(&mut self.pending.publish) {
            let result = self.core.publish_dag().await;
            for waiter in self.pending.publish_waiters.drain(..) {
                let _ = waiter.send(result.clone());
            }
        }
    }
}

async fn recv_userinfo(
    rx: &mut Option<broadcast::Receiver<DocumentEvent>>,
) -> Result<DocumentEvent, RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
