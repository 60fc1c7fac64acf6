use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupt log entry {mutation_id}: {reason}")]
    Corrupt { mutation_id: String, reason: String },

    #[error("core error: {0}")]
    Core(#[from] blocksync_core::CoreError),
}
