//! The authoritative store this engine synchronizes against.
//!
//! Transport details live behind [`RemoteStore`]; the engine only needs the
//! four collection calls and a scope-filtered push feed.

use std::time::Duration;

use async_trait::async_trait;
use blocksync_core::{Block, BlockId, BlockPatch, Scope};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RemoteError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("block not found: {0}")]
    NotFound(BlockId),

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

impl RemoteError {
    /// Transient failures may succeed on a later attempt; everything else is
    /// a definitive answer from the remote.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOp {
    Insert,
    Update,
    Delete,
}

/// One push notification from the remote change feed.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEvent {
    pub op: RemoteOp,
    pub block: Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryFilter {
    pub include_archived: bool,
    pub include_trashed: bool,
}

impl Default for QueryFilter {
    fn default() -> Self {
        Self {
            include_archived: true,
            include_trashed: false,
        }
    }
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// The returned block is authoritative; the remote may rewrite its id,
    /// position or timestamps.
    async fn insert(&self, block: Block) -> Result<Block, RemoteError>;

    async fn update(&self, id: BlockId, patch: BlockPatch) -> Result<Block, RemoteError>;

    async fn delete(&self, id: BlockId) -> Result<(), RemoteError>;

    /// Blocks of `scope` ordered by position.
    async fn query(&self, scope: Scope, filter: QueryFilter) -> Result<Vec<Block>, RemoteError>;

    /// Open a change feed filtered to `scope`. The feed ends when the
    /// returned receiver yields `None`.
    async fn subscribe(&self, scope: Scope) -> Result<mpsc::Receiver<RemoteEvent>, RemoteError>;
}
