use serde::{Deserialize, Serialize};

use crate::block::{Block, BlockKind, BlockPatch, Scope};
use crate::clock::Timestamp;
use crate::error::CoreError;
use crate::ids::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

impl MutationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            _ => Err(CoreError::UnknownMutationKind(s.to_string())),
        }
    }
}

/// What a mutation writes: the full block for a create, a partial diff for an
/// update, nothing for a delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MutationPayload {
    Create(Block),
    Update(BlockPatch),
    Delete,
}

impl MutationPayload {
    pub fn kind(&self) -> MutationKind {
        match self {
            Self::Create(_) => MutationKind::Create,
            Self::Update(_) => MutationKind::Update,
            Self::Delete => MutationKind::Delete,
        }
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, CoreError> {
        rmp_serde::to_vec(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, CoreError> {
        rmp_serde::from_slice(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}

/// Integrity checksum over a serialized payload.
pub fn payload_checksum(bytes: &[u8]) -> [u8; 32] {
    *blake3::hash(bytes).as_bytes()
}

/// One not-yet-confirmed change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
    pub mutation_id: MutationId,
    pub target_id: BlockId,
    /// The scope the target lived in when the mutation was issued, if known.
    pub scope: Option<Scope>,
    pub payload: MutationPayload,
    pub enqueued_at: Timestamp,
    pub retry_count: u32,
}

impl PendingMutation {
    pub fn create(block: Block, now: Timestamp) -> Self {
        Self {
            mutation_id: MutationId::new(),
            target_id: block.id,
            scope: Some(block.scope()),
            payload: MutationPayload::Create(block),
            enqueued_at: now,
            retry_count: 0,
        }
    }

    pub fn update(target_id: BlockId, scope: Option<Scope>, patch: BlockPatch, now: Timestamp) -> Self {
        Self {
            mutation_id: MutationId::new(),
            target_id,
            scope,
            payload: MutationPayload::Update(patch),
            enqueued_at: now,
            retry_count: 0,
        }
    }

    pub fn delete(target_id: BlockId, scope: Option<Scope>, now: Timestamp) -> Self {
        Self {
            mutation_id: MutationId::new(),
            target_id,
            scope,
            payload: MutationPayload::Delete,
            enqueued_at: now,
            retry_count: 0,
        }
    }

    pub fn kind(&self) -> MutationKind {
        self.payload.kind()
    }

    /// The block kind this mutation would write remotely, if it writes one.
    pub fn written_kind(&self) -> Option<BlockKind> {
        match &self.payload {
            MutationPayload::Create(block) => Some(block.kind),
            MutationPayload::Update(patch) => patch.kind,
            MutationPayload::Delete => None,
        }
    }

    /// Blocks whose creation this mutation needs to see first: its target,
    /// and the parent it places a block under.
    pub fn depends_on(&self) -> Vec<BlockId> {
        match &self.payload {
            MutationPayload::Create(block) => block.parent_id.into_iter().collect(),
            MutationPayload::Update(patch) => {
                let mut ids = vec![self.target_id];
                if let Some(Some(parent)) = patch.parent_id {
                    ids.push(parent);
                }
                ids
            }
            MutationPayload::Delete => vec![self.target_id],
        }
    }

    /// Rewrite every reference to `old` (target, parent, scope) to `new`.
    /// Returns true if anything changed.
    pub fn retarget(&mut self, old: BlockId, new: BlockId) -> bool {
        let mut changed = false;
        if self.target_id == old {
            self.target_id = new;
            changed = true;
        }
        if let Some(scope) = &mut self.scope
            && scope.parent_id == Some(old)
        {
            scope.parent_id = Some(new);
            changed = true;
        }
        match &mut self.payload {
            MutationPayload::Create(block) => {
                if block.id == old {
                    block.id = new;
                    changed = true;
                }
                if block.parent_id == Some(old) {
                    block.parent_id = Some(new);
                    changed = true;
                }
            }
            MutationPayload::Update(patch) => {
                if patch.parent_id == Some(Some(old)) {
                    patch.parent_id = Some(Some(new));
                    changed = true;
                }
            }
            MutationPayload::Delete => {}
        }
        changed
    }
}
