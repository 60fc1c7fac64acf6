use blocksync_core::{BlockId, MutationId, Scope};

use crate::remote::RemoteError;

/// User-facing signals. Delivered on a broadcast channel; a UI decides how
/// (or whether) to show them.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncNotice {
    /// An online mutation failed and the cache was restored.
    RolledBack { block_id: BlockId, error: RemoteError },
    /// The remote no longer has the block. Non-fatal; the stale entry is gone.
    NotFound { block_id: BlockId },
    /// A queued mutation was given up on and removed from the log.
    SyncFailed {
        mutation_id: MutationId,
        block_id: BlockId,
        error: RemoteError,
    },
    /// A queued entry failed its integrity check and was set aside unsent.
    Quarantined {
        mutation_id: Option<MutationId>,
        block_id: Option<BlockId>,
        reason: String,
    },
    /// A confirmed create came back under a server-assigned id.
    Redirected { from: BlockId, to: BlockId },
    ListenerDegraded { scope: Scope, reason: String },
    ListenerRecovered { scope: Scope },
}
