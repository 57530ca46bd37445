//! Error types shared by the storage backends

use thiserror::Error;

/// Errors raised by log, stable and snapshot stores
#[derive(Error, Debug)]
pub enum StorageError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Binary (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Error reported by the underlying storage engine
    #[error("Backend error: {0}")]
    Backend(String),

    /// Data on disk does not match what was expected
    #[error("Corrupt data: {0}")]
    Corrupt(String),
}

/// Result type alias for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;
