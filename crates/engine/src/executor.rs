use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use blocksync_core::{Block, MutationPayload, PendingMutation, Scope};
use tracing::debug;

use crate::remote::{QueryFilter, RemoteError, RemoteStore};

/// What the remote said about one executed mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Created(Block),
    Updated(Block),
    Deleted,
}

/// Sends single mutations to the remote, bounding each call by a timeout.
/// Holds no per-mutation state; retry bookkeeping lives with the caller.
#[derive(Clone)]
pub struct MutationExecutor {
    remote: Arc<dyn RemoteStore>,
    timeout: Duration,
}

impl MutationExecutor {
    pub fn new(remote: Arc<dyn RemoteStore>, timeout: Duration) -> Self {
        Self { remote, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn execute(&self, mutation: &PendingMutation) -> Result<ExecutionOutcome, RemoteError> {
        debug!(
            mutation_id = %mutation.mutation_id,
            target_id = %mutation.target_id,
            kind = mutation.kind().as_str(),
            "executing mutation"
        );
        match &mutation.payload {
            MutationPayload::Create(block) => self
                .bounded(self.remote.insert(block.clone()))
                .await
                .map(ExecutionOutcome::Created),
            MutationPayload::Update(patch) => self
                .bounded(self.remote.update(mutation.target_id, patch.clone()))
                .await
                .map(ExecutionOutcome::Updated),
            MutationPayload::Delete => self
                .bounded(self.remote.delete(mutation.target_id))
                .await
                .map(|()| ExecutionOutcome::Deleted),
        }
    }

    /// Authoritative ordered contents of `scope`, trashed blocks excluded.
    pub async fn query(&self, scope: Scope) -> Result<Vec<Block>, RemoteError> {
        self.bounded(self.remote.query(scope, QueryFilter::default())).await
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, RemoteError>>,
    ) -> Result<T, RemoteError> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout(self.timeout)),
        }
    }
}
