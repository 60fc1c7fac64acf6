//! In-memory, per-scope ordered block lists.
//!
//! Every write goes through [`CacheStore::apply`] (or one of the wrappers
//! built on it), which takes the store's write lock for the whole change,
//! so a reader never sees a half-applied list.

use std::collections::HashMap;
use std::sync::Arc;

use blocksync_core::{Block, BlockId, Scope};
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::debug;

use crate::error::SyncError;

#[derive(Debug, Clone, PartialEq)]
pub enum ChangeOp {
    Insert(Block),
    Replace(BlockId, Block),
    Remove(BlockId),
}

/// What subscribers of a scope see: the ordered list plus a version that
/// advances on every change.
#[derive(Debug, Clone, Default)]
pub struct ScopeSnapshot {
    pub version: u64,
    pub blocks: Arc<Vec<Block>>,
}

/// Index at which a block with `position` belongs: after every entry with an
/// equal or smaller position, so ties keep insertion order.
fn insertion_index(list: &[Block], position: f64) -> usize {
    list.partition_point(|b| b.position.total_cmp(&position).is_le())
}

fn place(list: &mut Vec<Block>, block: Block) {
    let idx = insertion_index(list, block.position);
    list.insert(idx, block);
}

/// Fold one change into a sorted list. Returns whether the list changed.
pub(crate) fn apply_to_list(list: &mut Vec<Block>, op: ChangeOp) -> bool {
    match op {
        ChangeOp::Insert(block) => {
            if block.trashed {
                return remove(list, block.id);
            }
            if let Some(idx) = list.iter().position(|b| b.id == block.id) {
                if list[idx] == block {
                    return false;
                }
                list.remove(idx);
            }
            place(list, block);
            true
        }
        ChangeOp::Replace(id, block) => {
            let Some(idx) = list.iter().position(|b| b.id == id) else {
                return false;
            };
            if block.trashed {
                list.remove(idx);
                if block.id != id {
                    remove(list, block.id);
                }
                return true;
            }
            if list[idx] == block {
                return false;
            }
            let moved = list[idx].position != block.position;
            list[idx] = block;
            let new_id = list[idx].id;
            if new_id != id
                && let Some(dup) = list.iter().enumerate().position(|(i, b)| i != idx && b.id == new_id)
            {
                list.remove(dup);
            }
            if moved {
                let idx = list.iter().position(|b| b.id == new_id).unwrap_or(0);
                let block = list.remove(idx);
                place(list, block);
            }
            true
        }
        ChangeOp::Remove(id) => remove(list, id),
    }
}

fn remove(list: &mut Vec<Block>, id: BlockId) -> bool {
    match list.iter().position(|b| b.id == id) {
        Some(idx) => {
            list.remove(idx);
            true
        }
        None => false,
    }
}

/// A scope's list as it was just before one mutation's optimistic apply,
/// and the version that apply produced.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub scope: Scope,
    pub before: Vec<Block>,
    pub version: u64,
}

struct ScopeState {
    blocks: Vec<Block>,
    version: u64,
    tx: watch::Sender<ScopeSnapshot>,
}

impl ScopeState {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(ScopeSnapshot::default());
        Self {
            blocks: Vec::new(),
            version: 0,
            tx,
        }
    }

    fn publish(&mut self) {
        self.version += 1;
        self.tx.send_replace(ScopeSnapshot {
            version: self.version,
            blocks: Arc::new(self.blocks.clone()),
        });
    }
}

#[derive(Default)]
pub struct CacheStore {
    scopes: RwLock<HashMap<Scope, ScopeState>>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start caching `scope`. Returns false if it was already open.
    pub fn open(&self, scope: Scope) -> bool {
        let mut scopes = self.scopes.write();
        if scopes.contains_key(&scope) {
            return false;
        }
        scopes.insert(scope, ScopeState::new());
        debug!(?scope, "cache scope opened");
        true
    }

    /// Drop the cached list. Existing subscribers see their channel close.
    pub fn close(&self, scope: Scope) -> bool {
        self.scopes.write().remove(&scope).is_some()
    }

    pub fn is_open(&self, scope: Scope) -> bool {
        self.scopes.read().contains_key(&scope)
    }

    pub fn scopes(&self) -> Vec<Scope> {
        self.scopes.read().keys().copied().collect()
    }

    /// Ordered copy of a scope's list. An unopened scope reads as empty.
    pub fn get(&self, scope: Scope) -> Vec<Block> {
        self.scopes
            .read()
            .get(&scope)
            .map(|s| s.blocks.clone())
            .unwrap_or_default()
    }

    pub fn snapshot(&self, scope: Scope) -> Option<ScopeSnapshot> {
        self.scopes.read().get(&scope).map(|s| s.tx.borrow().clone())
    }

    pub fn subscribe(&self, scope: Scope) -> Result<watch::Receiver<ScopeSnapshot>, SyncError> {
        self.scopes
            .read()
            .get(&scope)
            .map(|s| s.tx.subscribe())
            .ok_or(SyncError::ScopeNotOpen(scope))
    }

    /// Apply one change to one open scope. Returns whether anything changed;
    /// changes to a scope that is not open are dropped.
    pub fn apply(&self, scope: Scope, op: ChangeOp) -> bool {
        let mut scopes = self.scopes.write();
        let Some(state) = scopes.get_mut(&scope) else {
            return false;
        };
        let changed = apply_to_list(&mut state.blocks, op);
        if changed {
            state.publish();
        }
        changed
    }

    /// Apply a mutation's changes under one lock, returning a checkpoint per
    /// open scope they touched.
    pub fn apply_tracked(&self, effects: Vec<(Scope, ChangeOp)>) -> Vec<Checkpoint> {
        let mut scopes = self.scopes.write();
        let mut checkpoints: Vec<Checkpoint> = Vec::new();
        for (scope, op) in effects {
            let Some(state) = scopes.get_mut(&scope) else {
                continue;
            };
            if !checkpoints.iter().any(|c| c.scope == scope) {
                checkpoints.push(Checkpoint {
                    scope,
                    before: state.blocks.clone(),
                    version: state.version,
                });
            }
            if apply_to_list(&mut state.blocks, op) {
                state.publish();
            }
        }
        for checkpoint in &mut checkpoints {
            if let Some(state) = scopes.get(&checkpoint.scope) {
                checkpoint.version = state.version;
            }
        }
        checkpoints
    }

    /// Undo one mutation's optimistic change to `id`. If nothing else has
    /// touched the scope since, the list is restored exactly; otherwise only
    /// `id` goes back to its checkpointed state, now under `current` if the
    /// block has since been given a new id.
    pub fn revert(&self, checkpoint: &Checkpoint, id: BlockId, current: BlockId) -> bool {
        let mut scopes = self.scopes.write();
        let Some(state) = scopes.get_mut(&checkpoint.scope) else {
            return false;
        };
        let changed = if state.version == checkpoint.version {
            if state.blocks == checkpoint.before {
                false
            } else {
                state.blocks = checkpoint.before.clone();
                true
            }
        } else {
            let mut changed = remove(&mut state.blocks, current);
            if current != id {
                changed |= remove(&mut state.blocks, id);
            }
            if let Some(previous) = checkpoint.before.iter().find(|b| b.id == id) {
                let previous = Block {
                    id: current,
                    ..previous.clone()
                };
                changed |= apply_to_list(&mut state.blocks, ChangeOp::Insert(previous));
            }
            changed
        };
        if changed {
            state.publish();
        }
        changed
    }

    /// Swap a scope's whole list for `blocks`, sorted by position.
    pub fn restore(&self, scope: Scope, mut blocks: Vec<Block>) -> bool {
        let mut scopes = self.scopes.write();
        let Some(state) = scopes.get_mut(&scope) else {
            return false;
        };
        blocks.sort_by(|a, b| a.position.total_cmp(&b.position));
        if state.blocks == blocks {
            return false;
        }
        state.blocks = blocks;
        state.publish();
        true
    }

    /// Find a cached block in any open scope.
    pub fn locate(&self, id: BlockId) -> Option<Block> {
        self.scopes
            .read()
            .values()
            .find_map(|s| s.blocks.iter().find(|b| b.id == id).cloned())
    }

    pub fn scopes_containing(&self, id: BlockId) -> Vec<Scope> {
        self.scopes
            .read()
            .iter()
            .filter(|(_, s)| s.blocks.iter().any(|b| b.id == id))
            .map(|(scope, _)| *scope)
            .collect()
    }

    /// Make `block` the single cached representation of its id: drop it from
    /// any other open scope and insert or replace it in its own.
    pub fn place(&self, block: Block) {
        let mut scopes = self.scopes.write();
        let home = block.scope();
        for (scope, state) in scopes.iter_mut() {
            let changed = if *scope == home {
                apply_to_list(&mut state.blocks, ChangeOp::Insert(block.clone()))
            } else {
                remove(&mut state.blocks, block.id)
            };
            if changed {
                state.publish();
            }
        }
    }

    pub fn remove_everywhere(&self, id: BlockId) -> bool {
        let mut scopes = self.scopes.write();
        let mut removed = false;
        for state in scopes.values_mut() {
            if remove(&mut state.blocks, id) {
                state.publish();
                removed = true;
            }
        }
        removed
    }

    /// Swap the id of a cached block in every scope that holds it.
    pub fn rename(&self, old: BlockId, new: BlockId) {
        let mut scopes = self.scopes.write();
        for state in scopes.values_mut() {
            let Some(current) = state.blocks.iter().find(|b| b.id == old).cloned() else {
                continue;
            };
            let renamed = Block { id: new, ..current };
            if apply_to_list(&mut state.blocks, ChangeOp::Replace(old, renamed)) {
                state.publish();
            }
        }
    }

    /// Re-key an open scope whose parent was just given a server id.
    /// Children cached under the old parent follow it. If the new scope is
    /// already open the children are merged into it and its subscribers keep
    /// their channel; the old scope's subscribers see theirs close.
    pub fn rename_parent(&self, old: BlockId, new: BlockId) {
        let mut scopes = self.scopes.write();
        let stale: Vec<Scope> = scopes
            .keys()
            .filter(|s| s.parent_id == Some(old))
            .copied()
            .collect();
        for scope in stale {
            let Some(mut state) = scopes.remove(&scope) else {
                continue;
            };
            for block in &mut state.blocks {
                block.parent_id = Some(new);
            }
            let target = Scope::new(scope.workspace_id, Some(new));
            match scopes.get_mut(&target) {
                Some(existing) => {
                    let mut changed = false;
                    for block in state.blocks {
                        if !existing.blocks.iter().any(|b| b.id == block.id) {
                            changed |= apply_to_list(&mut existing.blocks, ChangeOp::Insert(block));
                        }
                    }
                    if changed {
                        existing.publish();
                    }
                    debug!(?scope, ?target, "renamed scope merged into open scope");
                }
                None => {
                    state.publish();
                    scopes.insert(target, state);
                }
            }
        }
    }
}
