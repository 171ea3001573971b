//! Node error taxonomy
//!
//! Every failure a caller can see maps to one of these kinds. Transient
//! kinds answer `should_retry()` with true; configuration mistakes and
//! structural impossibilities do not.

use thiserror::Error;

use omerta_core::{CoreError, PeerId};
use omerta_mesh::MeshError;
use omerta_punch::PunchError;
use omerta_wire::WireError;

/// Errors surfaced by the mesh node
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Node not started")]
    NotStarted,

    #[error("Node already started")]
    AlreadyStarted,

    #[error("Node stopped")]
    Stopped,

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),

    #[error("No usable relay for peer {0}")]
    NoRelayAvailable(PeerId),

    #[error("No relays known")]
    NoRelaysAvailable,

    #[error("Timed out")]
    Timeout,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Hole punch failed: {0}")]
    HolePunchFailed(String),

    #[error("Hole punch impossible: both peers behind symmetric NAT")]
    HolePunchImpossible,

    #[error("Decryption failed")]
    DecryptFailed,

    #[error("Signature verification failed")]
    SignatureInvalid,

    #[error("Malformed endpoint: {0}")]
    MalformedEndpoint(String),

    #[error("Invalid port in endpoint: {0}")]
    InvalidPort(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl NodeError {
    /// Whether retrying the same operation could plausibly succeed
    pub fn should_retry(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::ConnectionFailed(_) | Self::SendFailed(_) | Self::NoRelayAvailable(_)
        )
    }
}

impl From<CoreError> for NodeError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::MalformedEndpoint(e) | CoreError::EndpointRejected(e) => Self::MalformedEndpoint(e),
            CoreError::InvalidPort(e) => Self::InvalidPort(e),
            CoreError::SignatureInvalid => Self::SignatureInvalid,
            CoreError::InvalidConfiguration(msg) => Self::InvalidConfiguration(msg),
            CoreError::Io(msg) => Self::Io(msg),
            other => Self::InvalidConfiguration(other.to_string()),
        }
    }
}

impl From<WireError> for NodeError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::DecryptFailed => Self::DecryptFailed,
            WireError::SignatureInvalid => Self::SignatureInvalid,
            other => Self::SendFailed(other.to_string()),
        }
    }
}

impl From<MeshError> for NodeError {
    fn from(err: MeshError) -> Self {
        match err {
            MeshError::Core(core) => core.into(),
            MeshError::Io(msg) => Self::Io(msg),
            other => Self::Io(other.to_string()),
        }
    }
}

impl From<PunchError> for NodeError {
    fn from(err: PunchError) -> Self {
        match err {
            PunchError::Impossible => Self::HolePunchImpossible,
            other => Self::HolePunchFailed(other.to_string()),
        }
    }
}

/// Result type alias for node operations
pub type NodeResult<T> = Result<T, NodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy() {
        assert!(NodeError::Timeout.should_retry());
        assert!(NodeError::ConnectionFailed("x".into()).should_retry());
        assert!(NodeError::SendFailed("x".into()).should_retry());

        assert!(!NodeError::HolePunchImpossible.should_retry());
        assert!(!NodeError::InvalidConfiguration("x".into()).should_retry());
        assert!(!NodeError::NotStarted.should_retry());
        assert!(!NodeError::SignatureInvalid.should_retry());
    }

    #[test]
    fn test_punch_error_mapping() {
        let err: NodeError = PunchError::Impossible.into();
        assert!(matches!(err, NodeError::HolePunchImpossible));
    }
}
