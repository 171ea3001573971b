//! Error types for envelope encoding and decoding

use thiserror::Error;

use omerta_core::CoreError;

/// Errors from the wire layer
#[derive(Debug, Error)]
pub enum WireError {
    #[error("String field {field} too long for wire format: {len} bytes")]
    StringTooLong { field: &'static str, len: usize },

    #[error("Malformed envelope: {0}")]
    Malformed(String),

    #[error("Truncated envelope")]
    Truncated,

    #[error("Unknown message type tag: {0}")]
    UnknownMessageType(u8),

    #[error("Unknown envelope version: {0}")]
    UnknownVersion(u8),

    #[error("Decryption failed")]
    DecryptFailed,

    #[error("Signature verification failed")]
    SignatureInvalid,

    #[error("Invalid channel name: {0:?}")]
    InvalidChannel(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

/// Result type alias for wire operations
pub type WireResult<T> = Result<T, WireError>;
