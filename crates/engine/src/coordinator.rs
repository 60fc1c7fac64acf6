//! Optimistic Mutation Coordinator.
//!
//! Each user mutation is checkpointed, applied to the cache straight away,
//! then either sent to the remote or handed to the offline queue. A remote
//! failure undoes that mutation's change; the checkpoint comes back exactly
//! unless something else wrote to the scope in the meantime. Every online
//! outcome ends with a reconciliation fetch of the scopes it touched.

use std::sync::Arc;

use blocksync_core::{
    position, ActorId, Block, BlockDraft, BlockId, BlockPatch, LocalClock, MutationId, MutationKind,
    MutationPayload, PendingMutation, Placement, Scope, Timestamp,
};
use blocksync_storage::QuarantinedEntry;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::cache::{apply_to_list, CacheStore, ChangeOp};
use crate::config::Positions;
use crate::error::SyncError;
use crate::executor::{ExecutionOutcome, MutationExecutor};
use crate::notice::SyncNotice;
use crate::offline::{OfflineQueue, ReplayHandler};
use crate::recovery::ErrorTracker;
use crate::registry::PendingRegistry;
use crate::remote::RemoteError;

/// Where a single mutation ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationState {
    /// Admitted but not yet applied to the cache. Never returned.
    Initiated,
    /// Visible locally; waiting in the offline queue.
    OptimisticallyApplied,
    Confirmed,
    /// Surfaced to callers as `Err` plus a [`SyncNotice::RolledBack`].
    RolledBack,
}

pub struct Coordinator {
    actor: ActorId,
    cache: Arc<CacheStore>,
    queue: Arc<OfflineQueue>,
    executor: MutationExecutor,
    registry: Arc<PendingRegistry>,
    tracker: Arc<ErrorTracker>,
    notices: broadcast::Sender<SyncNotice>,
    clock: Mutex<LocalClock>,
    positions: Positions,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        actor: ActorId,
        cache: Arc<CacheStore>,
        queue: Arc<OfflineQueue>,
        executor: MutationExecutor,
        registry: Arc<PendingRegistry>,
        tracker: Arc<ErrorTracker>,
        notices: broadcast::Sender<SyncNotice>,
        positions: Positions,
    ) -> Self {
        Self {
            actor,
            cache,
            queue,
            executor,
            registry,
            tracker,
            notices,
            clock: Mutex::new(LocalClock::new()),
            positions,
        }
    }

    pub fn actor(&self) -> ActorId {
        self.actor
    }

    pub fn now(&self) -> Result<Timestamp, SyncError> {
        Ok(self.clock.lock().tick()?)
    }

    fn notify(&self, notice: SyncNotice) {
        // No receivers is fine.
        let _ = self.notices.send(notice);
    }

    /// Create a block in `scope`. Returns the id the block ends up under,
    /// which is the server's id if the create was confirmed with a new one.
    pub async fn create(
        &self,
        scope: Scope,
        draft: BlockDraft,
        placement: Placement,
    ) -> Result<(BlockId, MutationState), SyncError> {
        let now = self.now()?;
        let siblings = self.cache.get(scope);
        let pos = position::allocate(
            self.positions.strategy,
            self.positions.step,
            &siblings,
            placement,
            now,
        );
        let block = draft.into_block(BlockId::new(), scope, pos, self.actor, now);
        let id = block.id;
        let mutation = PendingMutation::create(block.clone(), now);

        let state = self.run(mutation, vec![(scope, ChangeOp::Insert(block))]).await?;
        Ok((self.registry.resolve(id), state))
    }

    pub async fn update(&self, id: BlockId, patch: BlockPatch) -> Result<MutationState, SyncError> {
        let id = self.registry.resolve(id);
        let now = self.now()?;
        let current = self.cache.locate(id);

        let mut effects = Vec::new();
        if let Some(current) = &current {
            let next = current.patched(&patch, self.actor, now);
            if next.scope() == current.scope() {
                effects.push((current.scope(), ChangeOp::Replace(id, next)));
            } else {
                effects.push((current.scope(), ChangeOp::Remove(id)));
                effects.push((next.scope(), ChangeOp::Insert(next)));
            }
        } else {
            debug!(block_id = %id, "update target not cached, forwarding to remote only");
        }

        let mutation = PendingMutation::update(id, current.map(|b| b.scope()), patch, now);
        self.run(mutation, effects).await
    }

    /// Deleting a block that is not cached still reaches the remote.
    pub async fn delete(&self, id: BlockId) -> Result<MutationState, SyncError> {
        let id = self.registry.resolve(id);
        let now = self.now()?;
        let scopes = self.cache.scopes_containing(id);
        let effects = scopes.iter().map(|s| (*s, ChangeOp::Remove(id))).collect();
        let mutation = PendingMutation::delete(id, scopes.first().copied(), now);
        self.run(mutation, effects).await
    }

    async fn run(
        &self,
        mutation: PendingMutation,
        effects: Vec<(Scope, ChangeOp)>,
    ) -> Result<MutationState, SyncError> {
        self.queue.admit(&mutation)?;

        let deferred = self.queue.should_defer()?;
        if deferred {
            self.queue.enqueue(&mutation)?;
        }

        self.registry.register(mutation.clone());
        let checkpoints = self.cache.apply_tracked(effects);
        debug!(
            mutation_id = %mutation.mutation_id,
            target_id = %mutation.target_id,
            kind = mutation.kind().as_str(),
            deferred,
            "optimistic apply"
        );

        if deferred {
            return Ok(MutationState::OptimisticallyApplied);
        }

        // An earlier create of the target or its new parent may still be in
        // flight; its confirmation can hand out a different id.
        if self.registry.blocked(mutation.mutation_id) {
            debug!(mutation_id = %mutation.mutation_id, "waiting for in-flight create");
            self.registry.wait_unblocked(mutation.mutation_id).await;
        }
        let issued_as = mutation.target_id;
        let mutation = self.registry.get(mutation.mutation_id).unwrap_or(mutation);

        let result = self.executor.execute(&mutation).await;
        let outcome = match result {
            Ok(outcome) => self.confirm(&mutation, outcome).map(|()| {
                self.tracker.clear(self.registry.resolve(mutation.target_id));
                MutationState::Confirmed
            }),
            Err(RemoteError::NotFound(_)) if mutation.kind() != MutationKind::Create => {
                warn!(
                    mutation_id = %mutation.mutation_id,
                    target_id = %mutation.target_id,
                    "remote no longer has the target, dropping local copy"
                );
                self.forget(mutation.target_id);
                Ok(MutationState::Confirmed)
            }
            Err(error) => {
                for checkpoint in &checkpoints {
                    self.cache.revert(checkpoint, issued_as, mutation.target_id);
                }
                let now = self.now()?;
                self.tracker.report(mutation.target_id, error.to_string(), now);
                debug!(
                    mutation_id = %mutation.mutation_id,
                    target_id = %mutation.target_id,
                    %error,
                    "rolled back"
                );
                self.notify(SyncNotice::RolledBack {
                    block_id: mutation.target_id,
                    error: error.clone(),
                });
                Err(SyncError::from(error))
            }
        };
        // Completing last lets waiters resume only once any new id is recorded.
        self.registry.complete(mutation.mutation_id);

        let mut reconcile: Vec<Scope> = checkpoints.iter().map(|c| c.scope).collect();
        if let Ok(MutationState::Confirmed) = &outcome
            && let Some(block) = self.cache.locate(self.registry.resolve(mutation.target_id))
        {
            reconcile.push(block.scope());
        }
        reconcile.sort();
        reconcile.dedup();
        for scope in reconcile {
            if let Err(err) = self.reconcile(scope).await {
                warn!(?scope, %err, "reconciliation after mutation failed");
            }
        }

        outcome
    }

    fn forget(&self, id: BlockId) {
        self.cache.remove_everywhere(id);
        self.tracker.clear(id);
        self.notify(SyncNotice::NotFound { block_id: id });
    }

    /// Fold a confirmed result into the cache, re-applying any later local
    /// mutations of the same block that are still unconfirmed.
    pub fn confirm(&self, mutation: &PendingMutation, outcome: ExecutionOutcome) -> Result<(), SyncError> {
        match outcome {
            ExecutionOutcome::Created(block) => {
                if block.id != mutation.target_id {
                    self.redirect(mutation.target_id, block.id)?;
                }
                self.settle(block, mutation.mutation_id);
            }
            ExecutionOutcome::Updated(block) => self.settle(block, mutation.mutation_id),
            ExecutionOutcome::Deleted => {
                self.cache.remove_everywhere(mutation.target_id);
            }
        }
        debug!(mutation_id = %mutation.mutation_id, "confirmed");
        Ok(())
    }

    fn settle(&self, block: Block, confirmed: MutationId) {
        self.clock.lock().observe(block.updated_at);
        let id = block.id;
        match self.overlay_pending(block, confirmed) {
            Some(block) if !block.trashed => self.cache.place(block),
            _ => {
                self.cache.remove_everywhere(id);
            }
        }
    }

    /// Apply the unconfirmed mutations that target `block` on top of it,
    /// other than the one just confirmed. `None` means a pending delete
    /// removes it.
    fn overlay_pending(&self, block: Block, confirmed: MutationId) -> Option<Block> {
        let mut current = block;
        for m in self.registry.pending() {
            if m.target_id != current.id || m.mutation_id == confirmed {
                continue;
            }
            match &m.payload {
                MutationPayload::Create(_) => {}
                MutationPayload::Update(patch) => {
                    current = current.patched(patch, self.actor, m.enqueued_at);
                }
                MutationPayload::Delete => return None,
            }
        }
        Some(current)
    }

    /// A create came back under a server id. Every reference to the client
    /// id is rewritten so later mutations reach the right block.
    fn redirect(&self, old: BlockId, new: BlockId) -> Result<(), SyncError> {
        self.queue.redirect(old, new)?;
        self.cache.rename(old, new);
        self.cache.rename_parent(old, new);
        self.tracker.redirect(old, new);
        info!(%old, %new, "block id rewritten by remote");
        self.notify(SyncNotice::Redirected { from: old, to: new });
        Ok(())
    }

    /// Re-fetch `scope` and lay every still-unconfirmed local mutation over
    /// the authoritative list.
    pub async fn reconcile(&self, scope: Scope) -> Result<(), SyncError> {
        if !self.cache.is_open(scope) {
            return Ok(());
        }
        let list = self.executor.query(scope).await?;
        if let Some(latest) = list.iter().map(|b| b.updated_at).max() {
            self.clock.lock().observe(latest);
        }
        if self.cache.restore(scope, self.overlay(scope, list)) {
            debug!(?scope, "reconciled");
        }
        Ok(())
    }

    /// Show unconfirmed mutations in `scope` without asking the remote,
    /// e.g. for a scope opened while offline.
    pub fn overlay_local(&self, scope: Scope) {
        let list = self.overlay(scope, self.cache.get(scope));
        self.cache.restore(scope, list);
    }

    fn overlay(&self, scope: Scope, mut list: Vec<Block>) -> Vec<Block> {
        for m in self.registry.pending() {
            match &m.payload {
                MutationPayload::Create(block) => {
                    if scope.contains(block) {
                        apply_to_list(&mut list, ChangeOp::Insert(block.clone()));
                    }
                }
                MutationPayload::Update(patch) => {
                    let base = list
                        .iter()
                        .find(|b| b.id == m.target_id)
                        .cloned()
                        .or_else(|| self.cache.locate(m.target_id));
                    let Some(base) = base else {
                        continue;
                    };
                    let next = base.patched(patch, self.actor, m.enqueued_at);
                    if scope.contains(&next) {
                        apply_to_list(&mut list, ChangeOp::Insert(next));
                    } else {
                        apply_to_list(&mut list, ChangeOp::Remove(m.target_id));
                    }
                }
                MutationPayload::Delete => {
                    apply_to_list(&mut list, ChangeOp::Remove(m.target_id));
                }
            }
        }
        list
    }
}

impl ReplayHandler for Coordinator {
    fn confirmed(&self, mutation: &PendingMutation, outcome: ExecutionOutcome) -> Result<(), SyncError> {
        self.confirm(mutation, outcome)?;
        self.tracker.clear(self.registry.resolve(mutation.target_id));
        Ok(())
    }

    fn not_found(&self, mutation: &PendingMutation) {
        self.forget(mutation.target_id);
    }

    fn abandoned(&self, mutation: &PendingMutation, error: &RemoteError) {
        let at = self.clock.lock().last();
        self.tracker
            .report(mutation.target_id, format!("sync failed: {error}"), at);
        self.notify(SyncNotice::SyncFailed {
            mutation_id: mutation.mutation_id,
            block_id: mutation.target_id,
            error: error.clone(),
        });
    }

    fn quarantined(&self, entry: &QuarantinedEntry) {
        warn!(
            seq = entry.seq,
            mutation_id = ?entry.mutation_id,
            target_id = ?entry.target_id,
            reason = %entry.reason,
            "queued mutation lost to log corruption"
        );
        if let Some(id) = entry.target_id {
            let at = self.clock.lock().last();
            self.tracker
                .report(id, format!("sync failed: corrupt log entry: {}", entry.reason), at);
        }
        self.notify(SyncNotice::Quarantined {
            mutation_id: entry.mutation_id,
            block_id: entry.target_id,
            reason: entry.reason.clone(),
        });
    }
}
