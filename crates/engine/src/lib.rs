pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod listener;
pub mod notice;
pub mod offline;
pub mod recovery;
pub mod registry;
pub mod remote;

pub use cache::{CacheStore, ChangeOp, Checkpoint, ScopeSnapshot};
pub use config::{ConfigError, SyncConfig};
pub use coordinator::{Coordinator, MutationState};
pub use error::SyncError;
pub use executor::{ExecutionOutcome, MutationExecutor};
pub use listener::{FoldOutcome, ListenerStatus, RemoteChangeListener};
pub use notice::SyncNotice;
pub use offline::{OfflineQueue, ReplayHandler, ReplayReport};
pub use recovery::{ErrorTracker, TrackedError};
pub use registry::PendingRegistry;
pub use remote::{QueryFilter, RemoteError, RemoteEvent, RemoteOp, RemoteStore};

use std::collections::HashMap;
use std::sync::Arc;

use blocksync_core::{ActorId, Block, BlockDraft, BlockId, BlockPatch, Placement, PendingMutation, Scope};
use blocksync_storage::{MutationLog, QuarantinedEntry, SqliteMutationLog};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

const NOTICE_CAPACITY: usize = 256;

/// Point-in-time view of the engine's health.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    pub online: bool,
    /// Mutations issued but not yet confirmed, queued or in flight.
    pub pending: usize,
    pub listeners_degraded: Vec<Scope>,
    pub tracked_errors: usize,
}

struct ListenerHandle {
    listener: Arc<RemoteChangeListener>,
    task: JoinHandle<()>,
}

/// The sync engine as upstream views see it: open a scope, read and
/// subscribe to it, and issue create/update/delete.
pub struct SyncEngine {
    config: SyncConfig,
    cache: Arc<CacheStore>,
    remote: Arc<dyn RemoteStore>,
    registry: Arc<PendingRegistry>,
    queue: Arc<OfflineQueue>,
    coordinator: Arc<Coordinator>,
    tracker: Arc<ErrorTracker>,
    notices: broadcast::Sender<SyncNotice>,
    listeners: Mutex<HashMap<Scope, ListenerHandle>>,
}

impl SyncEngine {
    /// Open the durable log named by `config.log_path`, or an in-memory one.
    pub fn open_log(config: &SyncConfig) -> Result<Box<dyn MutationLog>, SyncError> {
        let log = match &config.log_path {
            Some(path) => SqliteMutationLog::open(path)?,
            None => SqliteMutationLog::open_in_memory()?,
        };
        Ok(Box::new(log))
    }

    /// Build an engine over `log`. Entries left in the log by an earlier run
    /// are picked up and replayed on the next [`SyncEngine::replay`] or
    /// transition to online.
    pub fn new(
        config: SyncConfig,
        actor: ActorId,
        remote: Arc<dyn RemoteStore>,
        log: Box<dyn MutationLog>,
        online: bool,
    ) -> Result<Self, SyncError> {
        config::validate(&config)?;

        let cache = Arc::new(CacheStore::new());
        let registry = Arc::new(PendingRegistry::new());
        let tracker = Arc::new(ErrorTracker::new());
        let (notices, _rx) = broadcast::channel(NOTICE_CAPACITY);
        let executor = MutationExecutor::new(remote.clone(), config.request_timeout());
        let queue = Arc::new(OfflineQueue::open(
            log,
            registry.clone(),
            executor.clone(),
            config.replay.clone(),
            online,
        )?);
        let coordinator = Arc::new(Coordinator::new(
            actor,
            cache.clone(),
            queue.clone(),
            executor,
            registry.clone(),
            tracker.clone(),
            notices.clone(),
            config.positions.clone(),
        ));
        for entry in queue.take_quarantined()? {
            coordinator.quarantined(&entry);
        }

        Ok(Self {
            config,
            cache,
            remote,
            registry,
            queue,
            coordinator,
            tracker,
            notices,
            listeners: Mutex::new(HashMap::new()),
        })
    }

    /// Build an engine from `config` alone, opening its log.
    pub fn from_config(config: SyncConfig, actor: ActorId, remote: Arc<dyn RemoteStore>) -> Result<Self, SyncError> {
        let log = Self::open_log(&config)?;
        Self::new(config, actor, remote, log, true)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn actor(&self) -> ActorId {
        self.coordinator.actor()
    }

    // ========================================================================
    // Scope lifecycle
    // ========================================================================

    /// Start caching `scope`: fetch it when online and start its listener.
    /// Unconfirmed local mutations are visible either way; a failed initial
    /// fetch leaves only those.
    pub async fn open(&self, scope: Scope) -> Result<(), SyncError> {
        if !self.cache.open(scope) {
            return Ok(());
        }
        self.coordinator.overlay_local(scope);
        if self.queue.is_online()
            && let Err(err) = self.coordinator.reconcile(scope).await
        {
            warn!(?scope, %err, "initial fetch failed");
        }
        self.spawn_listener(scope);
        info!(?scope, "scope opened");
        Ok(())
    }

    pub fn close(&self, scope: Scope) {
        if let Some(handle) = self.listeners.lock().remove(&scope) {
            handle.task.abort();
            handle.listener.stop();
        }
        if self.cache.close(scope) {
            info!(?scope, "scope closed");
        }
    }

    fn spawn_listener(&self, scope: Scope) {
        let mut listeners = self.listeners.lock();
        let listener = match listeners.remove(&scope) {
            Some(old) => {
                old.task.abort();
                old.listener
            }
            None => Arc::new(RemoteChangeListener::new(
                scope,
                self.cache.clone(),
                self.registry.clone(),
                self.notices.clone(),
                self.config.request_timeout(),
            )),
        };
        let task = tokio::spawn(listener.clone().run(self.remote.clone()));
        listeners.insert(scope, ListenerHandle { listener, task });
    }

    pub fn listener_status(&self, scope: Scope) -> Option<ListenerStatus> {
        self.listeners.lock().get(&scope).map(|h| h.listener.status())
    }

    pub fn watch_listener(&self, scope: Scope) -> Option<watch::Receiver<ListenerStatus>> {
        self.listeners.lock().get(&scope).map(|h| h.listener.watch_status())
    }

    /// Restart the change feed of an open scope.
    pub fn reconnect_listener(&self, scope: Scope) -> Result<(), SyncError> {
        if !self.cache.is_open(scope) {
            return Err(SyncError::ScopeNotOpen(scope));
        }
        self.spawn_listener(scope);
        Ok(())
    }

    fn reconnect_degraded(&self) {
        let degraded: Vec<Scope> = self
            .listeners
            .lock()
            .iter()
            .filter(|(_, h)| h.listener.status().is_degraded())
            .map(|(scope, _)| *scope)
            .collect();
        for scope in degraded {
            self.spawn_listener(scope);
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub fn read(&self, scope: Scope) -> Vec<Block> {
        self.cache.get(scope)
    }

    pub fn subscribe(&self, scope: Scope) -> Result<watch::Receiver<ScopeSnapshot>, SyncError> {
        self.cache.subscribe(scope)
    }

    pub fn notices(&self) -> broadcast::Receiver<SyncNotice> {
        self.notices.subscribe()
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    pub async fn create_block(
        &self,
        scope: Scope,
        draft: BlockDraft,
        placement: Placement,
    ) -> Result<BlockId, SyncError> {
        let (id, state) = self.coordinator.create(scope, draft, placement).await?;
        self.after(state).await?;
        Ok(self.registry.resolve(id))
    }

    pub async fn update_block(&self, id: BlockId, patch: BlockPatch) -> Result<MutationState, SyncError> {
        let state = self.coordinator.update(id, patch).await?;
        self.after(state).await?;
        Ok(state)
    }

    pub async fn delete_block(&self, id: BlockId) -> Result<MutationState, SyncError> {
        let state = self.coordinator.delete(id).await?;
        self.after(state).await?;
        Ok(state)
    }

    /// A mutation queued behind a backlog while online is delivered now.
    async fn after(&self, state: MutationState) -> Result<(), SyncError> {
        if state == MutationState::OptimisticallyApplied && self.queue.is_online() {
            self.replay().await?;
        }
        Ok(())
    }

    // ========================================================================
    // Connectivity and recovery
    // ========================================================================

    pub fn is_online(&self) -> bool {
        self.queue.is_online()
    }

    pub fn connectivity(&self) -> watch::Receiver<bool> {
        self.queue.connectivity()
    }

    /// Record a connectivity change. Going online replays the log and
    /// reconnects degraded listeners; the replay report is returned.
    pub async fn set_online(&self, online: bool) -> Result<Option<ReplayReport>, SyncError> {
        if !self.queue.set_online(online) || !online {
            return Ok(None);
        }
        let report = self.replay().await?;
        self.reconnect_degraded();
        Ok(Some(report))
    }

    /// Drain the log now, then reconcile every open scope.
    pub async fn replay(&self) -> Result<ReplayReport, SyncError> {
        let report = self.queue.replay(self.coordinator.as_ref()).await?;
        if !report.busy && self.queue.is_online() {
            self.reconcile_all().await;
        }
        Ok(report)
    }

    pub async fn reconcile(&self, scope: Scope) -> Result<(), SyncError> {
        self.coordinator.reconcile(scope).await
    }

    async fn reconcile_all(&self) {
        for scope in self.cache.scopes() {
            if let Err(err) = self.coordinator.reconcile(scope).await {
                warn!(?scope, %err, "reconciliation failed");
            }
        }
    }

    /// Clear every tracked error and re-fetch every open scope. In-flight
    /// work is left alone.
    pub async fn retry_all(&self) -> Result<(), SyncError> {
        let cleared = self.tracker.clear_all();
        info!(cleared = cleared.len(), "retrying all");
        let mut first_err = None;
        for scope in self.cache.scopes() {
            if let Err(err) = self.coordinator.reconcile(scope).await {
                warn!(?scope, %err, "reconciliation failed");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Track a failure that happened outside the mutation path, e.g. a block
    /// that could not be rendered.
    pub fn report_error(&self, id: BlockId, message: impl Into<String>) -> Result<(), SyncError> {
        let now = self.coordinator.now()?;
        self.tracker.report(self.registry.resolve(id), message, now);
        Ok(())
    }

    pub fn tracker(&self) -> &ErrorTracker {
        &self.tracker
    }

    pub fn pending(&self) -> Vec<PendingMutation> {
        self.registry.pending()
    }

    pub fn pending_count(&self) -> usize {
        self.registry.len()
    }

    pub fn queued_count(&self) -> Result<u64, SyncError> {
        self.queue.len()
    }

    /// Log entries set aside as corrupt, including ones from earlier runs.
    pub fn quarantined(&self) -> Result<Vec<QuarantinedEntry>, SyncError> {
        self.queue.quarantined()
    }

    /// The id a block is known by remotely, following create redirects.
    pub fn resolve(&self, id: BlockId) -> BlockId {
        self.registry.resolve(id)
    }

    pub fn status(&self) -> SyncStatus {
        let mut listeners_degraded: Vec<Scope> = self
            .listeners
            .lock()
            .iter()
            .filter(|(_, h)| h.listener.status().is_degraded())
            .map(|(scope, _)| *scope)
            .collect();
        listeners_degraded.sort();
        SyncStatus {
            online: self.queue.is_online(),
            pending: self.registry.len(),
            listeners_degraded,
            tracked_errors: self.tracker.len(),
        }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        for (_, handle) in self.listeners.lock().drain() {
            handle.task.abort();
        }
    }
}
