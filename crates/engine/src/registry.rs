//! Every mutation this client has issued that the remote has not yet
//! confirmed, whether it is in flight or waiting in the durable log.

use std::collections::HashMap;

use blocksync_core::{BlockId, MutationId, MutationKind, PendingMutation};
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::watch;

#[derive(Debug, Default)]
struct Inner {
    pending: IndexMap<MutationId, PendingMutation>,
    /// Client id -> server id for creates that were confirmed under a new id.
    redirects: HashMap<BlockId, BlockId>,
}

#[derive(Debug)]
pub struct PendingRegistry {
    inner: Mutex<Inner>,
    /// Bumped after every completion so waiters can re-check.
    completions: watch::Sender<u64>,
}

impl Default for PendingRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingRegistry {
    pub fn new() -> Self {
        let (completions, _rx) = watch::channel(0);
        Self {
            inner: Mutex::new(Inner::default()),
            completions,
        }
    }

    pub fn register(&self, mutation: PendingMutation) {
        self.inner.lock().pending.insert(mutation.mutation_id, mutation);
    }

    /// Drop a mutation once it is confirmed or given up on.
    pub fn complete(&self, mutation_id: MutationId) -> Option<PendingMutation> {
        let removed = self.inner.lock().pending.shift_remove(&mutation_id);
        if removed.is_some() {
            self.completions.send_modify(|n| *n += 1);
        }
        removed
    }

    pub fn get(&self, mutation_id: MutationId) -> Option<PendingMutation> {
        self.inner.lock().pending.get(&mutation_id).cloned()
    }

    /// Whether a create issued before `mutation_id` is still unconfirmed for
    /// a block that mutation depends on.
    pub fn blocked(&self, mutation_id: MutationId) -> bool {
        let inner = self.inner.lock();
        let Some((own, _, mutation)) = inner.pending.get_full(&mutation_id) else {
            return false;
        };
        let deps = mutation.depends_on();
        inner
            .pending
            .values()
            .take(own)
            .any(|m| m.kind() == MutationKind::Create && deps.contains(&m.target_id))
    }

    /// Wait until no earlier create blocks `mutation_id`. Creates complete
    /// only after a server id has been recorded, so the mutation read back
    /// afterwards addresses the id the remote knows.
    pub async fn wait_unblocked(&self, mutation_id: MutationId) {
        let mut completions = self.completions.subscribe();
        while self.blocked(mutation_id) {
            if completions.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn update(&self, mutation: &PendingMutation) {
        if let Some(slot) = self.inner.lock().pending.get_mut(&mutation.mutation_id) {
            *slot = mutation.clone();
        }
    }

    /// Whether any unconfirmed mutation targets `id`.
    pub fn touches(&self, id: BlockId) -> bool {
        self.inner.lock().pending.values().any(|m| m.target_id == id)
    }

    /// Unconfirmed mutations in issue order.
    pub fn pending(&self) -> Vec<PendingMutation> {
        self.inner.lock().pending.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record that `old` now lives under `new` and rewrite every pending
    /// reference to it. Returns how many pending mutations changed.
    pub fn redirect(&self, old: BlockId, new: BlockId) -> usize {
        let mut inner = self.inner.lock();
        for target in inner.redirects.values_mut() {
            if *target == old {
                *target = new;
            }
        }
        inner.redirects.insert(old, new);
        inner
            .pending
            .values_mut()
            .map(|m| m.retarget(old, new))
            .filter(|changed| *changed)
            .count()
    }

    /// Follow recorded redirects to the id the remote knows.
    pub fn resolve(&self, id: BlockId) -> BlockId {
        self.inner.lock().redirects.get(&id).copied().unwrap_or(id)
    }
}
