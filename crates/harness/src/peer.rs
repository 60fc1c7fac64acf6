use std::path::Path;
use std::sync::Arc;

use blocksync_core::{ActorId, Block, BlockDraft, BlockId, BlockKind, BlockPatch, Placement, Scope, WorkspaceId};
use blocksync_engine::{ListenerStatus, MutationState, ScopeSnapshot, SyncConfig, SyncEngine, SyncError};
use blocksync_storage::SqliteMutationLog;

use crate::remote::MemoryRemote;
use crate::wait_for;

/// Short timeouts and near-zero backoff so failure paths run fast.
pub fn test_config() -> SyncConfig {
    let mut config = SyncConfig::default();
    config.request_timeout_ms = 500;
    config.replay.backoff_ms = 1;
    config
}

/// One client: an engine with `scope` open against a shared remote.
pub struct TestPeer {
    pub engine: SyncEngine,
    pub remote: Arc<MemoryRemote>,
    pub scope: Scope,
}

impl TestPeer {
    /// A client with its own remote and a fresh workspace root open.
    pub async fn new() -> Result<Self, SyncError> {
        let remote = Arc::new(MemoryRemote::new());
        Self::connect(remote, Scope::root(WorkspaceId::new())).await
    }

    /// A client with an in-memory log, online, watching `scope`.
    pub async fn connect(remote: Arc<MemoryRemote>, scope: Scope) -> Result<Self, SyncError> {
        let engine = SyncEngine::new(
            test_config(),
            ActorId::new(),
            remote.clone(),
            Box::new(SqliteMutationLog::open_in_memory()?),
            true,
        )?;
        Self::start(engine, remote, scope).await
    }

    /// A client whose log lives at `path`, so a later client opened on the
    /// same path sees what this one queued.
    pub async fn with_log(
        remote: Arc<MemoryRemote>,
        scope: Scope,
        path: &Path,
        online: bool,
    ) -> Result<Self, SyncError> {
        let engine = SyncEngine::new(
            test_config(),
            ActorId::new(),
            remote.clone(),
            Box::new(SqliteMutationLog::open(path)?),
            online,
        )?;
        Self::start(engine, remote, scope).await
    }

    async fn start(engine: SyncEngine, remote: Arc<MemoryRemote>, scope: Scope) -> Result<Self, SyncError> {
        engine.open(scope).await?;
        let peer = Self { engine, remote, scope };
        peer.wait_listener(|s| !matches!(s, ListenerStatus::Connecting)).await;
        Ok(peer)
    }

    pub fn read(&self) -> Vec<Block> {
        self.engine.read(self.scope)
    }

    pub fn ids(&self) -> Vec<BlockId> {
        self.read().iter().map(|b| b.id).collect()
    }

    pub fn get(&self, id: BlockId) -> Option<Block> {
        self.read().into_iter().find(|b| b.id == id)
    }

    /// Append a text block with `text` as its content.
    pub async fn create_text(&self, text: &str) -> Result<BlockId, SyncError> {
        self.engine
            .create_block(self.scope, BlockDraft::new(BlockKind::Text).content(text), Placement::End)
            .await
    }

    pub async fn create_at(&self, text: &str, position: f64) -> Result<BlockId, SyncError> {
        self.engine
            .create_block(
                self.scope,
                BlockDraft::new(BlockKind::Text).content(text),
                Placement::At(position),
            )
            .await
    }

    pub async fn set_content(&self, id: BlockId, text: &str) -> Result<MutationState, SyncError> {
        self.engine.update_block(id, BlockPatch::new().content(text)).await
    }

    pub async fn delete(&self, id: BlockId) -> Result<MutationState, SyncError> {
        self.engine.delete_block(id).await
    }

    /// Wait until the cached list satisfies `pred`.
    pub async fn wait_until(&self, pred: impl Fn(&[Block]) -> bool) -> Option<ScopeSnapshot> {
        let mut rx = self.engine.subscribe(self.scope).ok()?;
        wait_for(&mut rx, |snap| pred(&snap.blocks)).await
    }

    pub async fn wait_listener(&self, pred: impl Fn(&ListenerStatus) -> bool) -> Option<ListenerStatus> {
        let mut rx = self.engine.watch_listener(self.scope)?;
        wait_for(&mut rx, |s| pred(s)).await
    }
}
