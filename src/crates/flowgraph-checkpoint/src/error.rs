//! Error types for checkpoint operations

use thiserror::Error;

/// Result type for checkpoint operations
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Errors that can occur while storing, loading or decoding checkpoints
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// No checkpoint stored under the requested id
    #[error("Checkpoint not found: {0}")]
    NotFound(String),

    /// JSON encoding or decoding failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Binary encoding or decoding failed
    #[error("Binary serialization error: {0}")]
    BinarySerialization(#[from] bincode::Error),

    /// The backing store rejected the operation
    #[error("Storage error: {0}")]
    Storage(String),

    /// The record decoded but is not usable (version, mode or shape mismatch)
    #[error("Invalid checkpoint: {0}")]
    Invalid(String),

    /// Custom error
    #[error("{0}")]
    Custom(String),
}

impl CheckpointError {
    /// Create a storage error from any displayable backend error
    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::Storage(err.to_string())
    }

    /// Whether this error means the checkpoint simply does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
