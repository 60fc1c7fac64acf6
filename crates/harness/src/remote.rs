//! An in-process authoritative store with a push feed and failure injection.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use blocksync_core::{Block, BlockId, BlockPatch, LocalClock, Scope};
use blocksync_engine::{QueryFilter, RemoteError, RemoteEvent, RemoteOp, RemoteStore};
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

const FEED_CAPACITY: usize = 256;

/// One call the remote received, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Insert(BlockId),
    Update(BlockId),
    Delete(BlockId),
    Query(Scope),
    Subscribe(Scope),
}

#[derive(Default)]
struct State {
    /// Insertion order breaks position ties.
    blocks: IndexMap<BlockId, Block>,
    subscribers: Vec<(Scope, mpsc::Sender<RemoteEvent>)>,
    /// Errors returned by the next writes, one per call.
    failures: VecDeque<RemoteError>,
    /// Returned by every write while set.
    outage: Option<RemoteError>,
    subscribe_error: Option<RemoteError>,
    rewrite_ids: bool,
    latency: Option<Duration>,
    calls: Vec<Call>,
    clock: LocalClock,
}

#[derive(Default)]
pub struct MemoryRemote {
    state: Mutex<State>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Fault injection
    // ========================================================================

    /// Fail the next write call with `error`. Stacks with earlier calls.
    pub fn fail_next(&self, error: RemoteError) {
        self.state.lock().failures.push_back(error);
    }

    /// Fail every write until [`MemoryRemote::heal`] is called.
    pub fn fail_writes(&self, error: RemoteError) {
        self.state.lock().outage = Some(error);
    }

    pub fn heal(&self) {
        let mut state = self.state.lock();
        state.failures.clear();
        state.outage = None;
        state.subscribe_error = None;
    }

    pub fn fail_subscribe(&self, error: RemoteError) {
        self.state.lock().subscribe_error = Some(error);
    }

    /// Assign a fresh id to every inserted block instead of keeping the
    /// client's.
    pub fn rewrite_ids(&self, enabled: bool) {
        self.state.lock().rewrite_ids = enabled;
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().latency = latency;
    }

    /// Close every open change feed, as a dropped connection would.
    pub fn disconnect_subscribers(&self) {
        self.state.lock().subscribers.clear();
    }

    // ========================================================================
    // Changes made by some other client
    // ========================================================================

    pub fn foreign_insert(&self, block: Block) -> Result<Block, RemoteError> {
        self.state.lock().insert(block)
    }

    pub fn foreign_update(&self, id: BlockId, patch: &BlockPatch) -> Result<Block, RemoteError> {
        self.state.lock().update(id, patch)
    }

    pub fn foreign_delete(&self, id: BlockId) -> Result<(), RemoteError> {
        self.state.lock().delete(id)
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub fn block(&self, id: BlockId) -> Option<Block> {
        self.state.lock().blocks.get(&id).cloned()
    }

    /// Live blocks of `scope` in position order.
    pub fn blocks_in(&self, scope: Scope) -> Vec<Block> {
        self.state.lock().query(scope, QueryFilter::default())
    }

    pub fn len(&self) -> usize {
        self.state.lock().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn write_calls(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Insert(_) | Call::Update(_) | Call::Delete(_)))
            .collect()
    }

    pub fn subscriber_count(&self) -> usize {
        let mut state = self.state.lock();
        state.subscribers.retain(|(_, tx)| !tx.is_closed());
        state.subscribers.len()
    }

    /// Record `call` and decide whether it fails. The delay to apply before
    /// answering is returned alongside.
    fn admit(&self, call: Call) -> (Option<Duration>, Result<(), RemoteError>) {
        let mut state = self.state.lock();
        let is_write = matches!(call, Call::Insert(_) | Call::Update(_) | Call::Delete(_));
        state.calls.push(call);
        let verdict = if !is_write {
            Ok(())
        } else if let Some(error) = state.failures.pop_front() {
            Err(error)
        } else if let Some(error) = &state.outage {
            Err(error.clone())
        } else {
            Ok(())
        };
        (state.latency, verdict)
    }

    async fn gate(&self, call: Call) -> Result<(), RemoteError> {
        let (latency, verdict) = self.admit(call);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        verdict
    }
}

impl State {
    fn stamp(&mut self) -> Result<i64, RemoteError> {
        self.clock
            .tick()
            .map_err(|e| RemoteError::Network(e.to_string()))
    }

    fn publish(&mut self, op: RemoteOp, block: &Block, also: Option<Scope>) {
        let home = block.scope();
        self.subscribers.retain(|(scope, tx)| {
            if *scope != home && Some(*scope) != also {
                return !tx.is_closed();
            }
            let event = RemoteEvent {
                op,
                block: block.clone(),
            };
            !matches!(tx.try_send(event), Err(mpsc::error::TrySendError::Closed(_)))
        });
    }

    fn insert(&mut self, mut block: Block) -> Result<Block, RemoteError> {
        if !block.kind.is_persistable() {
            return Err(RemoteError::Validation(format!(
                "kind {} cannot be stored",
                block.kind.as_str()
            )));
        }
        if self.rewrite_ids {
            block.id = BlockId::new();
        }
        if self.blocks.contains_key(&block.id) {
            return Err(RemoteError::Constraint(format!("duplicate block id {}", block.id)));
        }
        self.clock.observe(block.updated_at);
        self.blocks.insert(block.id, block.clone());
        self.publish(RemoteOp::Insert, &block, None);
        debug!(block_id = %block.id, "remote insert");
        Ok(block)
    }

    fn update(&mut self, id: BlockId, patch: &BlockPatch) -> Result<Block, RemoteError> {
        if let Some(kind) = patch.kind
            && !kind.is_persistable()
        {
            return Err(RemoteError::Validation(format!("kind {} cannot be stored", kind.as_str())));
        }
        let current = match self.blocks.get(&id) {
            Some(block) if !block.trashed => block.clone(),
            _ => return Err(RemoteError::NotFound(id)),
        };
        let now = self.stamp()?;
        let next = current.patched(patch, current.last_edited_by, now);
        self.blocks.insert(id, next.clone());
        self.publish(RemoteOp::Update, &next, Some(current.scope()));
        Ok(next)
    }

    fn delete(&mut self, id: BlockId) -> Result<(), RemoteError> {
        let Some(block) = self.blocks.shift_remove(&id) else {
            return Err(RemoteError::NotFound(id));
        };
        self.publish(RemoteOp::Delete, &block, None);
        Ok(())
    }

    fn query(&self, scope: Scope, filter: QueryFilter) -> Vec<Block> {
        let mut blocks: Vec<Block> = self
            .blocks
            .values()
            .filter(|b| scope.contains(b))
            .filter(|b| filter.include_trashed || !b.trashed)
            .filter(|b| filter.include_archived || !b.archived)
            .cloned()
            .collect();
        blocks.sort_by(|a, b| a.position.total_cmp(&b.position));
        blocks
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn insert(&self, block: Block) -> Result<Block, RemoteError> {
        self.gate(Call::Insert(block.id)).await?;
        self.state.lock().insert(block)
    }

    async fn update(&self, id: BlockId, patch: BlockPatch) -> Result<Block, RemoteError> {
        self.gate(Call::Update(id)).await?;
        self.state.lock().update(id, &patch)
    }

    async fn delete(&self, id: BlockId) -> Result<(), RemoteError> {
        self.gate(Call::Delete(id)).await?;
        self.state.lock().delete(id)
    }

    async fn query(&self, scope: Scope, filter: QueryFilter) -> Result<Vec<Block>, RemoteError> {
        self.gate(Call::Query(scope)).await?;
        Ok(self.state.lock().query(scope, filter))
    }

    async fn subscribe(&self, scope: Scope) -> Result<mpsc::Receiver<RemoteEvent>, RemoteError> {
        self.gate(Call::Subscribe(scope)).await?;
        let mut state = self.state.lock();
        if let Some(error) = &state.subscribe_error {
            return Err(error.clone());
        }
        let (tx, rx) = mpsc::channel(FEED_CAPACITY);
        state.subscribers.push((scope, tx));
        Ok(rx)
    }
}
