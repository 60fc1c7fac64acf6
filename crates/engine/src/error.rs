use blocksync_core::{CoreError, Scope};
use blocksync_storage::StorageError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::remote::RemoteError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("block kind `{kind}` has no remote representation (mutation {mutation_id})")]
    UnsupportedKind {
        kind: &'static str,
        mutation_id: String,
    },

    #[error("scope not open: {0:?}")]
    ScopeNotOpen(Scope),
}

impl SyncError {
    /// The remote failure behind this error, if there is one.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Remote(err) => Some(err),
            _ => None,
        }
    }
}
