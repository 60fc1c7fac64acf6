//! Offline Queue Manager.
//!
//! Decides whether a mutation goes straight to the remote or into the
//! durable log, and drains the log in FIFO order once connectivity returns.
//! The log is owned here; nothing else in the engine writes to it.

use std::sync::Arc;

use blocksync_core::{BlockId, MutationId, MutationKind, PendingMutation};
use blocksync_storage::{MutationLog, QuarantinedEntry};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::Replay;
use crate::error::SyncError;
use crate::executor::{ExecutionOutcome, MutationExecutor};
use crate::registry::PendingRegistry;
use crate::remote::RemoteError;

/// Receives the result of each replayed entry after it has left the log.
pub trait ReplayHandler: Send + Sync {
    fn confirmed(&self, mutation: &PendingMutation, outcome: ExecutionOutcome) -> Result<(), SyncError>;

    /// An update or delete whose target no longer exists remotely.
    fn not_found(&self, mutation: &PendingMutation);

    /// Rejected outright, or out of attempts.
    fn abandoned(&self, mutation: &PendingMutation, error: &RemoteError);

    /// A log entry failed its integrity check and was set aside.
    fn quarantined(&self, entry: &QuarantinedEntry);
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub delivered: usize,
    pub not_found: usize,
    pub abandoned: usize,
    pub quarantined: usize,
    /// Connectivity dropped before the log was drained.
    pub interrupted: bool,
    /// Another replay already held the log.
    pub busy: bool,
}

enum Step {
    Delivered(PendingMutation, ExecutionOutcome),
    NotFound(PendingMutation),
    Retry(PendingMutation),
    Abandoned(PendingMutation, RemoteError),
}

pub struct OfflineQueue {
    log: Mutex<Box<dyn MutationLog>>,
    online: watch::Sender<bool>,
    registry: Arc<PendingRegistry>,
    executor: MutationExecutor,
    replay_lock: tokio::sync::Mutex<()>,
    replay: Replay,
    /// How many quarantined entries have been handed out already.
    quarantine_seen: Mutex<usize>,
}

impl OfflineQueue {
    /// Wrap `log`, registering everything it still holds from a previous run.
    pub fn open(
        log: Box<dyn MutationLog>,
        registry: Arc<PendingRegistry>,
        executor: MutationExecutor,
        replay: Replay,
        online: bool,
    ) -> Result<Self, SyncError> {
        // Only entries set aside from here on are reported.
        let quarantine_seen = log.quarantined()?.len();
        let queued = log.get_all()?;
        if !queued.is_empty() {
            info!(entries = queued.len(), "recovered queued mutations");
        }
        for mutation in queued {
            registry.register(mutation);
        }
        let (online, _rx) = watch::channel(online);
        Ok(Self {
            log: Mutex::new(log),
            online,
            registry,
            executor,
            replay_lock: tokio::sync::Mutex::new(()),
            replay,
            quarantine_seen: Mutex::new(quarantine_seen),
        })
    }

    /// Reject mutations that would write a kind the remote cannot store.
    /// Such a mutation reaching this point is a caller bug.
    pub fn admit(&self, mutation: &PendingMutation) -> Result<(), SyncError> {
        match mutation.written_kind() {
            Some(kind) if !kind.is_persistable() => Err(SyncError::UnsupportedKind {
                kind: kind.as_str(),
                mutation_id: mutation.mutation_id.to_string(),
            }),
            _ => Ok(()),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    pub fn connectivity(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }

    /// Returns true if this call changed the connectivity state.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.online.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });
        if changed {
            info!(online, "connectivity changed");
        }
        changed
    }

    /// Whether a new mutation must go through the log: always while offline,
    /// and while online as long as earlier entries are still waiting.
    pub fn should_defer(&self) -> Result<bool, SyncError> {
        if !self.is_online() {
            return Ok(true);
        }
        Ok(!self.log.lock().is_empty()?)
    }

    /// Durably append `mutation`. Returns once the write is on disk.
    pub fn enqueue(&self, mutation: &PendingMutation) -> Result<(), SyncError> {
        self.admit(mutation)?;
        self.log.lock().put(mutation)?;
        debug!(
            mutation_id = %mutation.mutation_id,
            target_id = %mutation.target_id,
            kind = mutation.kind().as_str(),
            "mutation queued"
        );
        Ok(())
    }

    pub fn len(&self) -> Result<u64, SyncError> {
        Ok(self.log.lock().len()?)
    }

    pub fn is_empty(&self) -> Result<bool, SyncError> {
        Ok(self.log.lock().is_empty()?)
    }

    /// Queued entries in replay order.
    pub fn queued(&self) -> Result<Vec<PendingMutation>, SyncError> {
        Ok(self.log.lock().get_all()?)
    }

    /// Point every queued and in-flight reference to `old` at `new`.
    pub fn redirect(&self, old: BlockId, new: BlockId) -> Result<usize, SyncError> {
        self.registry.redirect(old, new);
        let touched = self.log.lock().retarget(old, new)?;
        if touched > 0 {
            debug!(%old, %new, touched, "queued entries retargeted");
        }
        Ok(touched)
    }

    pub fn quarantined(&self) -> Result<Vec<QuarantinedEntry>, SyncError> {
        Ok(self.log.lock().quarantined()?)
    }

    /// Entries quarantined since the last call. Their mutations are no
    /// longer pending.
    pub fn take_quarantined(&self) -> Result<Vec<QuarantinedEntry>, SyncError> {
        let all = self.log.lock().quarantined()?;
        let mut seen = self.quarantine_seen.lock();
        let fresh = all.get(*seen..).map(<[_]>::to_vec).unwrap_or_default();
        *seen = all.len();
        drop(seen);
        for entry in &fresh {
            if let Some(mutation_id) = entry.mutation_id {
                self.registry.complete(mutation_id);
            }
        }
        Ok(fresh)
    }

    fn head(&self) -> Result<Option<PendingMutation>, SyncError> {
        Ok(self.log.lock().get_all()?.into_iter().next())
    }

    fn finish(&self, mutation_id: MutationId) -> Result<(), SyncError> {
        self.log.lock().delete(mutation_id)?;
        self.registry.complete(mutation_id);
        Ok(())
    }

    fn persist_attempt(&self, mutation: &PendingMutation) -> Result<(), SyncError> {
        self.log.lock().put(mutation)?;
        self.registry.update(mutation);
        Ok(())
    }

    /// Drain the log one entry at a time, oldest first. A failing head entry
    /// blocks everything behind it until it succeeds or is abandoned.
    pub async fn replay(&self, handler: &dyn ReplayHandler) -> Result<ReplayReport, SyncError> {
        let mut report = ReplayReport::default();
        loop {
            let Ok(guard) = self.replay_lock.try_lock() else {
                report.busy = true;
                return Ok(report);
            };
            self.drain(handler, &mut report).await?;
            drop(guard);

            // An entry may have been appended after the drain saw an empty log
            // but before the lock was released.
            if report.interrupted || !self.is_online() || self.is_empty()? {
                break;
            }
        }
        Ok(report)
    }

    async fn drain(&self, handler: &dyn ReplayHandler, report: &mut ReplayReport) -> Result<(), SyncError> {
        let queued = self.len()?;
        if queued > 0 {
            info!(queued, "replay started");
        }
        loop {
            if !self.is_online() {
                report.interrupted = true;
                info!(remaining = self.len()?, "replay interrupted by connectivity loss");
                return Ok(());
            }
            let head = self.head()?;
            for entry in self.take_quarantined()? {
                report.quarantined += 1;
                handler.quarantined(&entry);
            }
            let Some(head) = head else {
                break;
            };
            if self.registry.blocked(head.mutation_id) {
                debug!(mutation_id = %head.mutation_id, "replay waiting for in-flight create");
                self.registry.wait_unblocked(head.mutation_id).await;
                continue;
            }

            match self.attempt(head).await {
                Step::Delivered(mutation, outcome) => {
                    report.delivered += 1;
                    // The entry stays registered until any new id is recorded.
                    let confirmed = handler.confirmed(&mutation, outcome);
                    self.finish(mutation.mutation_id)?;
                    confirmed?;
                }
                Step::NotFound(mutation) => {
                    self.finish(mutation.mutation_id)?;
                    report.not_found += 1;
                    warn!(
                        mutation_id = %mutation.mutation_id,
                        target_id = %mutation.target_id,
                        "replayed mutation target no longer exists"
                    );
                    handler.not_found(&mutation);
                }
                Step::Retry(mutation) => {
                    self.persist_attempt(&mutation)?;
                    let delay = self.replay.backoff(mutation.retry_count);
                    debug!(
                        mutation_id = %mutation.mutation_id,
                        retry_count = mutation.retry_count,
                        ?delay,
                        "replay attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Step::Abandoned(mutation, error) => {
                    self.finish(mutation.mutation_id)?;
                    report.abandoned += 1;
                    warn!(
                        mutation_id = %mutation.mutation_id,
                        target_id = %mutation.target_id,
                        retry_count = mutation.retry_count,
                        %error,
                        "queued mutation abandoned"
                    );
                    handler.abandoned(&mutation, &error);
                }
            }
        }
        if report.delivered + report.not_found + report.abandoned + report.quarantined > 0 {
            info!(
                delivered = report.delivered,
                not_found = report.not_found,
                abandoned = report.abandoned,
                quarantined = report.quarantined,
                "replay finished"
            );
        }
        Ok(())
    }

    async fn attempt(&self, mut mutation: PendingMutation) -> Step {
        match self.executor.execute(&mutation).await {
            Ok(outcome) => Step::Delivered(mutation, outcome),
            Err(RemoteError::NotFound(_)) if mutation.kind() != MutationKind::Create => {
                Step::NotFound(mutation)
            }
            Err(error) if error.is_transient() => {
                mutation.retry_count += 1;
                if mutation.retry_count >= self.replay.max_attempts {
                    Step::Abandoned(mutation, error)
                } else {
                    Step::Retry(mutation)
                }
            }
            Err(error) => Step::Abandoned(mutation, error),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use blocksync_core::{ActorId, Block, BlockKind, BlockPatch, Scope, WorkspaceId};
    use blocksync_storage::SqliteMutationLog;
    use tokio::sync::mpsc;

    use super::*;
    use crate::remote::{QueryFilter, RemoteEvent, RemoteStore};

    /// Remote that is never reached by these tests.
    struct Unreachable;

    #[async_trait]
    impl RemoteStore for Unreachable {
        async fn insert(&self, _block: Block) -> Result<Block, RemoteError> {
            Err(RemoteError::Network("unreachable".into()))
        }
        async fn update(&self, _id: BlockId, _patch: BlockPatch) -> Result<Block, RemoteError> {
            Err(RemoteError::Network("unreachable".into()))
        }
        async fn delete(&self, _id: BlockId) -> Result<(), RemoteError> {
            Err(RemoteError::Network("unreachable".into()))
        }
        async fn query(&self, _scope: Scope, _filter: QueryFilter) -> Result<Vec<Block>, RemoteError> {
            Err(RemoteError::Network("unreachable".into()))
        }
        async fn subscribe(&self, _scope: Scope) -> Result<mpsc::Receiver<RemoteEvent>, RemoteError> {
            Err(RemoteError::Network("unreachable".into()))
        }
    }

    fn queue_over(log: SqliteMutationLog, online: bool) -> Result<OfflineQueue, SyncError> {
        let executor = MutationExecutor::new(Arc::new(Unreachable), Duration::from_millis(50));
        OfflineQueue::open(
            Box::new(log),
            Arc::new(PendingRegistry::new()),
            executor,
            Replay::default(),
            online,
        )
    }

    fn create(kind: BlockKind) -> PendingMutation {
        let block = Block::new(BlockId::new(), Scope::root(WorkspaceId::new()), kind, 1.0, ActorId::new(), 1);
        PendingMutation::create(block, 1)
    }

    #[test]
    fn local_only_kinds_fail_fast() -> Result<(), Box<dyn std::error::Error>> {
        let queue = queue_over(SqliteMutationLog::open_in_memory()?, false)?;
        let draft = create(BlockKind::Placeholder);
        match queue.enqueue(&draft) {
            Err(SyncError::UnsupportedKind { kind, .. }) => assert_eq!(kind, "placeholder"),
            other => panic!("expected UnsupportedKind, got {other:?}"),
        }
        assert!(queue.is_empty()?);

        let retype = PendingMutation::update(BlockId::new(), None, BlockPatch::new().kind(BlockKind::Unsupported), 1);
        assert!(queue.admit(&retype).is_err());
        Ok(())
    }

    #[test]
    fn defers_while_offline_or_backlogged() -> Result<(), Box<dyn std::error::Error>> {
        let queue = queue_over(SqliteMutationLog::open_in_memory()?, true)?;
        assert!(!queue.should_defer()?);

        assert!(queue.set_online(false));
        assert!(!queue.set_online(false));
        assert!(queue.should_defer()?);

        queue.enqueue(&create(BlockKind::Text))?;
        queue.set_online(true);
        assert!(queue.should_defer()?);
        Ok(())
    }

    #[test]
    fn reopening_registers_recovered_entries() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("queue.db");
        let first = create(BlockKind::Text);
        let second = create(BlockKind::Heading1);
        {
            let queue = queue_over(SqliteMutationLog::open(&path)?, false)?;
            queue.enqueue(&first)?;
            queue.enqueue(&second)?;
        }

        let registry = Arc::new(PendingRegistry::new());
        let executor = MutationExecutor::new(Arc::new(Unreachable), Duration::from_millis(50));
        let queue = OfflineQueue::open(
            Box::new(SqliteMutationLog::open(&path)?),
            registry.clone(),
            executor,
            Replay::default(),
            false,
        )?;
        assert_eq!(queue.len()?, 2);
        let ids: Vec<_> = registry.pending().iter().map(|m| m.mutation_id).collect();
        assert_eq!(ids, vec![first.mutation_id, second.mutation_id]);
        Ok(())
    }

    #[test]
    fn corrupt_entry_does_not_block_the_rest() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("queue.db");
        let entries = [create(BlockKind::Text), create(BlockKind::Text), create(BlockKind::Text)];
        {
            let queue = queue_over(SqliteMutationLog::open(&path)?, false)?;
            for m in &entries {
                queue.enqueue(m)?;
            }
        }
        SqliteMutationLog::open(&path)?.conn().execute(
            "UPDATE pending_mutations SET checksum = zeroblob(32) WHERE seq = 2",
            [],
        )?;

        let registry = Arc::new(PendingRegistry::new());
        let executor = MutationExecutor::new(Arc::new(Unreachable), Duration::from_millis(50));
        let queue = OfflineQueue::open(
            Box::new(SqliteMutationLog::open(&path)?),
            registry.clone(),
            executor,
            Replay::default(),
            false,
        )?;

        let queued: Vec<_> = queue.queued()?.iter().map(|m| m.mutation_id).collect();
        assert_eq!(queued, vec![entries[0].mutation_id, entries[2].mutation_id]);
        assert_eq!(registry.len(), 2);
        let quarantined = queue.take_quarantined()?;
        assert_eq!(quarantined.len(), 1);
        assert_eq!(quarantined[0].mutation_id, Some(entries[1].mutation_id));
        assert!(queue.take_quarantined()?.is_empty());
        Ok(())
    }

    #[test]
    fn redirect_rewrites_log_and_registry() -> Result<(), Box<dyn std::error::Error>> {
        let queue = queue_over(SqliteMutationLog::open_in_memory()?, false)?;
        let created = create(BlockKind::Text);
        let old = created.target_id;
        let edit = PendingMutation::update(old, created.scope, BlockPatch::new().content("hi"), 2);
        queue.enqueue(&edit)?;
        queue.registry.register(edit.clone());

        let new = BlockId::new();
        assert_eq!(queue.redirect(old, new)?, 1);
        assert_eq!(queue.queued()?[0].target_id, new);
        assert_eq!(queue.registry.resolve(old), new);
        Ok(())
    }
}
