use blocksync_core::{ids::*, mutation::PendingMutation};

use crate::error::StorageError;

/// A log entry that could not be decoded and was set aside. The ids are
/// whatever could still be read from the row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuarantinedEntry {
    pub seq: i64,
    pub mutation_id: Option<MutationId>,
    pub target_id: Option<BlockId>,
    pub reason: String,
}

/// Durable, ordered store of mutations that still need remote delivery.
///
/// Every write is on disk before the call returns. Entries come back from
/// [`MutationLog::get_all`] in the order they were first put; re-putting an
/// existing `mutation_id` updates it in place without moving it. An entry
/// that fails its integrity check is moved out of the way and listed by
/// [`MutationLog::quarantined`]; it never blocks the entries behind it.
pub trait MutationLog: Send {
    fn put(&mut self, mutation: &PendingMutation) -> Result<(), StorageError>;

    fn get_all(&self) -> Result<Vec<PendingMutation>, StorageError>;

    fn get(&self, mutation_id: MutationId) -> Result<Option<PendingMutation>, StorageError>;

    /// Returns false if the entry was already gone.
    fn delete(&mut self, mutation_id: MutationId) -> Result<bool, StorageError>;

    fn clear(&mut self) -> Result<(), StorageError>;

    /// Entries set aside as corrupt, oldest first.
    fn quarantined(&self) -> Result<Vec<QuarantinedEntry>, StorageError> {
        Ok(Vec::new())
    }

    fn len(&self) -> Result<u64, StorageError>;

    fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }

    /// Rewrite every queued reference to `old` so it addresses `new`.
    /// Returns the number of entries touched.
    fn retarget(&mut self, old: BlockId, new: BlockId) -> Result<usize, StorageError> {
        let mut touched = 0;
        for mut mutation in self.get_all()? {
            if mutation.retarget(old, new) {
                self.put(&mutation)?;
                touched += 1;
            }
        }
        Ok(touched)
    }
}
