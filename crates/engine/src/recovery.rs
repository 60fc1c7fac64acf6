//! Per-block record of the last failure the user should know about.

use std::collections::HashMap;

use blocksync_core::{BlockId, Timestamp};
use parking_lot::Mutex;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedError {
    pub message: String,
    pub at: Timestamp,
    /// How many times this block has failed since it was last cleared.
    pub attempts: u32,
}

#[derive(Debug, Default)]
pub struct ErrorTracker {
    errors: Mutex<HashMap<BlockId, TrackedError>>,
}

impl ErrorTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self, id: BlockId, message: impl Into<String>, at: Timestamp) {
        let message = message.into();
        let mut errors = self.errors.lock();
        let attempts = errors.get(&id).map_or(0, |e| e.attempts) + 1;
        debug!(block_id = %id, attempts, %message, "error tracked");
        errors.insert(
            id,
            TrackedError {
                message,
                at,
                attempts,
            },
        );
    }

    pub fn clear(&self, id: BlockId) -> bool {
        self.errors.lock().remove(&id).is_some()
    }

    /// Forget everything. Returns the ids that were tracked.
    pub fn clear_all(&self) -> Vec<BlockId> {
        self.errors.lock().drain().map(|(id, _)| id).collect()
    }

    /// Re-key an entry whose block was given a server id.
    pub fn redirect(&self, old: BlockId, new: BlockId) {
        let mut errors = self.errors.lock();
        if let Some(entry) = errors.remove(&old) {
            errors.insert(new, entry);
        }
    }

    pub fn get(&self, id: BlockId) -> Option<TrackedError> {
        self.errors.lock().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.errors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
