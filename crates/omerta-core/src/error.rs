//! Error types for the Omerta core

use thiserror::Error;

/// Errors produced by identity, network-key and endpoint handling
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Invalid invite: {0}")]
    InvalidInvite(String),

    #[error("Malformed endpoint: {0}")]
    MalformedEndpoint(String),

    #[error("Invalid port in endpoint: {0}")]
    InvalidPort(String),

    #[error("Endpoint rejected by validation policy: {0}")]
    EndpointRejected(String),

    #[error("Signature verification failed")]
    SignatureInvalid,

    #[error("Keystore error: {0}")]
    Keystore(String),

    #[error("Storage I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

/// Result type alias for core operations
pub type CoreResult<T> = Result<T, CoreError>;
