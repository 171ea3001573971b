//! Error types for hole punching

use thiserror::Error;

use omerta_core::CoreError;

/// Errors from punch planning and coordination
#[derive(Debug, Error)]
pub enum PunchError {
    #[error("Hole punch impossible: both peers behind symmetric NAT")]
    Impossible,

    #[error("Coordinator at capacity: {0} requests in flight")]
    TooManyRequests(usize),

    #[error("Unknown hole punch request: {0}")]
    UnknownRequest(String),

    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

/// Result type alias for punch operations
pub type PunchResult<T> = Result<T, PunchError>;
