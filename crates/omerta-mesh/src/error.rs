//! Error types for mesh state tracking

use thiserror::Error;

use omerta_core::CoreError;

/// Errors from mesh bookkeeping and persistence
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    #[error("Storage I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Persisted state belongs to network {actual}, expected {expected}")]
    WrongNetwork { expected: String, actual: String },
}

/// Result type alias for mesh operations
pub type MeshResult<T> = Result<T, MeshError>;
