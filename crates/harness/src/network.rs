use std::sync::Arc;

use blocksync_core::{Block, Scope, WorkspaceId};
use blocksync_engine::SyncError;

use crate::remote::MemoryRemote;
use crate::TestPeer;

/// Several clients watching the same scope of one shared remote.
pub struct TestNetwork {
    pub remote: Arc<MemoryRemote>,
    pub scope: Scope,
    peers: Vec<TestPeer>,
}

impl Default for TestNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl TestNetwork {
    pub fn new() -> Self {
        Self {
            remote: Arc::new(MemoryRemote::new()),
            scope: Scope::root(WorkspaceId::new()),
            peers: Vec::new(),
        }
    }

    pub async fn add_peer(&mut self) -> Result<usize, SyncError> {
        let peer = TestPeer::connect(self.remote.clone(), self.scope).await?;
        let index = self.peers.len();
        self.peers.push(peer);
        Ok(index)
    }

    pub fn peer(&self, index: usize) -> &TestPeer {
        &self.peers[index]
    }

    /// What the remote holds for the shared scope.
    pub fn authoritative(&self) -> Vec<Block> {
        self.remote.blocks_in(self.scope)
    }
}
