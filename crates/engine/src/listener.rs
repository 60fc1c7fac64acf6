//! Remote Change Listener: folds another client's changes into one scope.

use std::sync::Arc;
use std::time::Duration;

use blocksync_core::Scope;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::cache::{CacheStore, ChangeOp};
use crate::notice::SyncNotice;
use crate::registry::PendingRegistry;
use crate::remote::{RemoteEvent, RemoteOp, RemoteStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerStatus {
    Connecting,
    Connected,
    /// The feed is down; the cache is only refreshed by reconciliation.
    Degraded(String),
    Stopped,
}

impl ListenerStatus {
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded(_))
    }
}

/// What folding one event did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldOutcome {
    Applied,
    /// Outside the scope, or already reflected.
    Ignored,
    /// The block has unconfirmed local mutations; their reconciliation
    /// pass will pick up the remote state.
    Deferred,
    /// Older than what the cache already holds.
    Stale,
}

pub struct RemoteChangeListener {
    scope: Scope,
    cache: Arc<CacheStore>,
    registry: Arc<PendingRegistry>,
    notices: broadcast::Sender<SyncNotice>,
    status: watch::Sender<ListenerStatus>,
    timeout: Duration,
}

impl RemoteChangeListener {
    pub fn new(
        scope: Scope,
        cache: Arc<CacheStore>,
        registry: Arc<PendingRegistry>,
        notices: broadcast::Sender<SyncNotice>,
        timeout: Duration,
    ) -> Self {
        let (status, _rx) = watch::channel(ListenerStatus::Connecting);
        Self {
            scope,
            cache,
            registry,
            notices,
            status,
            timeout,
        }
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn status(&self) -> ListenerStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ListenerStatus> {
        self.status.subscribe()
    }

    pub fn stop(&self) {
        self.status.send_replace(ListenerStatus::Stopped);
    }

    pub fn fold(&self, event: RemoteEvent) -> FoldOutcome {
        let RemoteEvent { op, block } = event;
        if block.workspace_id != self.scope.workspace_id {
            return FoldOutcome::Ignored;
        }
        if self.registry.touches(block.id) {
            return FoldOutcome::Deferred;
        }

        let applied = |changed: bool| {
            if changed {
                FoldOutcome::Applied
            } else {
                FoldOutcome::Ignored
            }
        };

        let cached = self.cache.get(self.scope).into_iter().find(|b| b.id == block.id);
        if op != RemoteOp::Delete
            && let Some(cached) = &cached
            && block.updated_at < cached.updated_at
        {
            return FoldOutcome::Stale;
        }

        match op {
            RemoteOp::Insert => {
                if !self.scope.contains(&block) || block.trashed {
                    return FoldOutcome::Ignored;
                }
                applied(self.cache.apply(self.scope, ChangeOp::Insert(block)))
            }
            RemoteOp::Update => {
                if !self.scope.contains(&block) || block.trashed {
                    return applied(self.cache.apply(self.scope, ChangeOp::Remove(block.id)));
                }
                let op = match cached {
                    Some(_) => ChangeOp::Replace(block.id, block),
                    None => ChangeOp::Insert(block),
                };
                applied(self.cache.apply(self.scope, op))
            }
            RemoteOp::Delete => applied(self.cache.apply(self.scope, ChangeOp::Remove(block.id))),
        }
    }

    fn degrade(&self, reason: String) {
        warn!(scope = ?self.scope, %reason, "change listener degraded");
        self.status.send_replace(ListenerStatus::Degraded(reason.clone()));
        let _ = self.notices.send(SyncNotice::ListenerDegraded {
            scope: self.scope,
            reason,
        });
    }

    /// Subscribe and fold events until the feed ends or the task is aborted.
    pub async fn run(self: Arc<Self>, remote: Arc<dyn RemoteStore>) {
        let recovering = self.status().is_degraded();
        self.status.send_replace(ListenerStatus::Connecting);

        let mut feed = match tokio::time::timeout(self.timeout, remote.subscribe(self.scope)).await {
            Ok(Ok(feed)) => feed,
            Ok(Err(err)) => return self.degrade(err.to_string()),
            Err(_) => return self.degrade(format!("subscribe timed out after {:?}", self.timeout)),
        };

        self.status.send_replace(ListenerStatus::Connected);
        if recovering {
            info!(scope = ?self.scope, "change listener recovered");
            let _ = self.notices.send(SyncNotice::ListenerRecovered { scope: self.scope });
        } else {
            debug!(scope = ?self.scope, "change listener connected");
        }

        while let Some(event) = feed.recv().await {
            let id = event.block.id;
            let op = event.op;
            let outcome = self.fold(event);
            debug!(block_id = %id, ?op, ?outcome, "remote change");
        }

        if self.status() != ListenerStatus::Stopped {
            self.degrade("change feed closed".to_string());
        }
    }
}
