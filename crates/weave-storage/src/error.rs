//! Storage error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("path error: {0}")]
    Path(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

impl From<StorageError> for weave_models::EngineError {
    fn from(err: StorageError) -> Self {
        weave_models::EngineError::Io(err.to_string())
    }
}
