use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;
use crate::error::CoreError;
use crate::ids::*;
use crate::value::Value;

/// The closed set of block variants.
///
/// `Placeholder` and `Unsupported` exist only in the local cache: the first is
/// the draft row a view shows before anything is typed, the second stands in
/// for a kind this client cannot render. Neither may be written remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockKind {
    Page,
    Text,
    Heading1,
    Heading2,
    Heading3,
    BulletedListItem,
    NumberedListItem,
    ToDo,
    Toggle,
    Quote,
    Callout,
    Code,
    Image,
    Divider,
    Placeholder,
    Unsupported,
}

impl BlockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Page => "page",
            Self::Text => "text",
            Self::Heading1 => "heading_1",
            Self::Heading2 => "heading_2",
            Self::Heading3 => "heading_3",
            Self::BulletedListItem => "bulleted_list_item",
            Self::NumberedListItem => "numbered_list_item",
            Self::ToDo => "to_do",
            Self::Toggle => "toggle",
            Self::Quote => "quote",
            Self::Callout => "callout",
            Self::Code => "code",
            Self::Image => "image",
            Self::Divider => "divider",
            Self::Placeholder => "placeholder",
            Self::Unsupported => "unsupported",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "page" => Ok(Self::Page),
            "text" => Ok(Self::Text),
            "heading_1" => Ok(Self::Heading1),
            "heading_2" => Ok(Self::Heading2),
            "heading_3" => Ok(Self::Heading3),
            "bulleted_list_item" => Ok(Self::BulletedListItem),
            "numbered_list_item" => Ok(Self::NumberedListItem),
            "to_do" => Ok(Self::ToDo),
            "toggle" => Ok(Self::Toggle),
            "quote" => Ok(Self::Quote),
            "callout" => Ok(Self::Callout),
            "code" => Ok(Self::Code),
            "image" => Ok(Self::Image),
            "divider" => Ok(Self::Divider),
            "placeholder" => Ok(Self::Placeholder),
            "unsupported" => Ok(Self::Unsupported),
            _ => Err(CoreError::UnknownKind(s.to_string())),
        }
    }

    /// Whether blocks of this kind have a representation in the remote schema.
    pub fn is_persistable(&self) -> bool {
        !matches!(self, Self::Placeholder | Self::Unsupported)
    }
}

/// The (workspace, parent) pair identifying one cached, ordered sibling list.
/// A `parent_id` of `None` is the workspace root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Scope {
    pub workspace_id: WorkspaceId,
    pub parent_id: Option<BlockId>,
}

impl Scope {
    pub fn new(workspace_id: WorkspaceId, parent_id: Option<BlockId>) -> Self {
        Self {
            workspace_id,
            parent_id,
        }
    }

    pub fn root(workspace_id: WorkspaceId) -> Self {
        Self::new(workspace_id, None)
    }

    pub fn contains(&self, block: &Block) -> bool {
        block.workspace_id == self.workspace_id && block.parent_id == self.parent_id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    pub workspace_id: WorkspaceId,
    pub parent_id: Option<BlockId>,
    pub kind: BlockKind,
    pub properties: BTreeMap<String, Value>,
    pub content: Value,
    pub position: f64,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub archived: bool,
    pub trashed: bool,
    pub created_by: ActorId,
    pub last_edited_by: ActorId,
}

impl Block {
    /// A fresh, empty block in `scope`. Callers fill in content and properties.
    pub fn new(
        id: BlockId,
        scope: Scope,
        kind: BlockKind,
        position: f64,
        actor: ActorId,
        now: Timestamp,
    ) -> Self {
        Self {
            id,
            workspace_id: scope.workspace_id,
            parent_id: scope.parent_id,
            kind,
            properties: BTreeMap::new(),
            content: Value::Null,
            position,
            created_at: now,
            updated_at: now,
            archived: false,
            trashed: false,
            created_by: actor,
            last_edited_by: actor,
        }
    }

    pub fn scope(&self) -> Scope {
        Scope::new(self.workspace_id, self.parent_id)
    }

    /// Merge a partial update into a copy of this block and stamp it as edited.
    pub fn patched(&self, patch: &BlockPatch, editor: ActorId, now: Timestamp) -> Block {
        let mut next = self.clone();
        if let Some(kind) = patch.kind {
            next.kind = kind;
        }
        for (key, value) in &patch.properties {
            if value.is_null() {
                next.properties.remove(key);
            } else {
                next.properties.insert(key.clone(), value.clone());
            }
        }
        if let Some(content) = &patch.content {
            next.content = content.clone();
        }
        if let Some(position) = patch.position {
            next.position = position;
        }
        if let Some(parent_id) = patch.parent_id {
            next.parent_id = parent_id;
        }
        if let Some(archived) = patch.archived {
            next.archived = archived;
        }
        if let Some(trashed) = patch.trashed {
            next.trashed = trashed;
        }
        next.updated_at = now.max(self.updated_at);
        next.last_edited_by = editor;
        next
    }
}

/// A partial update. Absent fields are left untouched; a `Value::Null`
/// property entry deletes that property.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockPatch {
    pub kind: Option<BlockKind>,
    pub properties: BTreeMap<String, Value>,
    pub content: Option<Value>,
    pub position: Option<f64>,
    /// `Some(None)` moves the block to the workspace root.
    #[serde(with = "parent_change")]
    pub parent_id: Option<Option<BlockId>>,
    pub archived: Option<bool>,
    pub trashed: Option<bool>,
}

impl BlockPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content(mut self, content: impl Into<Value>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn property(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    pub fn position(mut self, position: f64) -> Self {
        self.position = Some(position);
        self
    }

    pub fn kind(mut self, kind: BlockKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn move_to(mut self, parent_id: Option<BlockId>) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn archived(mut self, archived: bool) -> Self {
        self.archived = Some(archived);
        self
    }

    pub fn trashed(mut self, trashed: bool) -> Self {
        self.trashed = Some(trashed);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.kind.is_none()
            && self.properties.is_empty()
            && self.content.is_none()
            && self.position.is_none()
            && self.parent_id.is_none()
            && self.archived.is_none()
            && self.trashed.is_none()
    }
}

/// A parent change written as an explicit tag. Self-describing formats
/// such as msgpack encode `None` and `Some(None)` identically.
mod parent_change {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::ids::BlockId;

    #[derive(Serialize, Deserialize)]
    enum Change {
        Keep,
        Root,
        Under(BlockId),
    }

    pub fn serialize<S: Serializer>(value: &Option<Option<BlockId>>, s: S) -> Result<S::Ok, S::Error> {
        let change = match value {
            None => Change::Keep,
            Some(None) => Change::Root,
            Some(Some(id)) => Change::Under(*id),
        };
        change.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Option<BlockId>>, D::Error> {
        Ok(match Change::deserialize(d)? {
            Change::Keep => None,
            Change::Root => Some(None),
            Change::Under(id) => Some(Some(id)),
        })
    }
}

/// The caller-supplied part of a new block. Identity, placement and
/// timestamps are filled in when the block is created.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockDraft {
    pub kind: BlockKind,
    pub properties: BTreeMap<String, Value>,
    pub content: Value,
}

impl BlockDraft {
    pub fn new(kind: BlockKind) -> Self {
        Self {
            kind,
            properties: BTreeMap::new(),
            content: Value::Null,
        }
    }

    pub fn content(mut self, content: impl Into<Value>) -> Self {
        self.content = content.into();
        self
    }

    pub fn property(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    pub fn into_block(self, id: BlockId, scope: Scope, position: f64, actor: ActorId, now: Timestamp) -> Block {
        let mut block = Block::new(id, scope, self.kind, position, actor, now);
        block.properties = self.properties;
        block.content = self.content;
        block
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Block {
        let scope = Scope::root(WorkspaceId::new());
        let mut block = Block::new(BlockId::new(), scope, BlockKind::Text, 10.0, ActorId::new(), 1_000);
        block.properties.insert("color".into(), "red".into());
        block
    }

    #[test]
    fn kind_string_roundtrip() {
        for kind in [BlockKind::Page, BlockKind::ToDo, BlockKind::Heading2, BlockKind::Placeholder] {
            assert_eq!(BlockKind::parse(kind.as_str()).unwrap(), kind);
        }
        assert!(BlockKind::parse("kanban_lane").is_err());
    }

    #[test]
    fn ui_only_kinds_are_not_persistable() {
        assert!(BlockKind::Text.is_persistable());
        assert!(!BlockKind::Placeholder.is_persistable());
        assert!(!BlockKind::Unsupported.is_persistable());
    }

    #[test]
    fn patch_merges_fields_and_stamps_editor() {
        let block = sample();
        let editor = ActorId::new();
        let patch = BlockPatch::new()
            .content("hello")
            .property("color", Value::Null)
            .property("size", Value::Integer(3))
            .archived(true);

        let next = block.patched(&patch, editor, 2_000);
        assert_eq!(next.content, Value::Text("hello".into()));
        assert!(!next.properties.contains_key("color"));
        assert_eq!(next.properties.get("size"), Some(&Value::Integer(3)));
        assert!(next.archived);
        assert_eq!(next.updated_at, 2_000);
        assert_eq!(next.last_edited_by, editor);
        assert_eq!(next.created_by, block.created_by);
        assert_eq!(next.position, block.position);
    }

    #[test]
    fn patch_never_moves_updated_at_backwards() {
        let block = sample();
        let next = block.patched(&BlockPatch::new().content("x"), ActorId::new(), 10);
        assert_eq!(next.updated_at, block.updated_at);
    }

    #[test]
    fn draft_fills_payload() {
        let scope = Scope::new(WorkspaceId::new(), Some(BlockId::new()));
        let actor = ActorId::new();
        let block = BlockDraft::new(BlockKind::ToDo)
            .content("buy milk")
            .property("checked", Value::Boolean(false))
            .into_block(BlockId::new(), scope, 3.0, actor, 77);
        assert_eq!(block.scope(), scope);
        assert_eq!(block.content, Value::Text("buy milk".into()));
        assert_eq!(block.properties.get("checked"), Some(&Value::Boolean(false)));
        assert_eq!((block.created_at, block.updated_at), (77, 77));
    }

    #[test]
    fn move_changes_scope() {
        let block = sample();
        let parent = BlockId::new();
        let next = block.patched(&BlockPatch::new().move_to(Some(parent)), block.created_by, 5_000);
        assert_eq!(next.scope(), Scope::new(block.workspace_id, Some(parent)));
        assert!(!block.scope().contains(&next));
    }
}
