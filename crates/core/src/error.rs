use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("unknown block kind: {0}")]
    UnknownKind(String),

    #[error("unknown mutation kind: {0}")]
    UnknownMutationKind(String),

    #[error("invalid data: {0}")]
    InvalidData(String),
}
