//! Mesh events
//!
//! Observable happenings fanned out to subscribers over a broadcast
//! channel. Slow subscribers lag and lose the oldest events rather than
//! back-pressuring the core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::PeerId;
use crate::types::NatType;

/// Why a peer was declared disconnected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// Missed too many keepalive pings
    KeepaliveTimeout,
    /// A path to the peer was reported failed
    PathFailed,
    /// The local node stopped
    Stopped,
}

/// Why an inbound datagram was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    DecryptFailed,
    MalformedEnvelope,
    SignatureInvalid,
    Duplicate,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DecryptFailed => write!(f, "decrypt failed"),
            Self::MalformedEnvelope => write!(f, "malformed envelope"),
            Self::SignatureInvalid => write!(f, "signature invalid"),
            Self::Duplicate => write!(f, "duplicate message"),
        }
    }
}

/// Events emitted by a running mesh node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MeshEvent {
    /// The node started and bound its socket
    Started {
        port: u16,
        timestamp: DateTime<Utc>,
    },

    /// The node stopped
    Stopped {
        timestamp: DateTime<Utc>,
    },

    /// First verified exchange with a peer
    PeerConnected {
        peer_id: PeerId,
        is_direct: bool,
        timestamp: DateTime<Utc>,
    },

    /// A peer stopped responding
    PeerDisconnected {
        peer_id: PeerId,
        reason: DisconnectReason,
        timestamp: DateTime<Utc>,
    },

    /// Own NAT type inferred from peer observations
    NatTypeDetected {
        nat_type: NatType,
        confidence: usize,
        timestamp: DateTime<Utc>,
    },

    /// A hole-punch attempt finished
    HolePunchCompleted {
        peer_id: PeerId,
        success: bool,
        timestamp: DateTime<Utc>,
    },

    /// A relay forward finished
    RelayForwarded {
        target_peer_id: PeerId,
        success: bool,
        timestamp: DateTime<Utc>,
    },

    /// An inbound datagram was dropped before dispatch
    MessageDropped {
        reason: DropReason,
        timestamp: DateTime<Utc>,
    },
}

impl MeshEvent {
    pub fn started(port: u16) -> Self {
        Self::Started {
            port,
            timestamp: Utc::now(),
        }
    }

    pub fn stopped() -> Self {
        Self::Stopped {
            timestamp: Utc::now(),
        }
    }

    pub fn peer_connected(peer_id: PeerId, is_direct: bool) -> Self {
        Self::PeerConnected {
            peer_id,
            is_direct,
            timestamp: Utc::now(),
        }
    }

    pub fn peer_disconnected(peer_id: PeerId, reason: DisconnectReason) -> Self {
        Self::PeerDisconnected {
            peer_id,
            reason,
            timestamp: Utc::now(),
        }
    }

    pub fn nat_detected(nat_type: NatType, confidence: usize) -> Self {
        Self::NatTypeDetected {
            nat_type,
            confidence,
            timestamp: Utc::now(),
        }
    }

    pub fn hole_punch_completed(peer_id: PeerId, success: bool) -> Self {
        Self::HolePunchCompleted {
            peer_id,
            success,
            timestamp: Utc::now(),
        }
    }

    pub fn relay_forwarded(target_peer_id: PeerId, success: bool) -> Self {
        Self::RelayForwarded {
            target_peer_id,
            success,
            timestamp: Utc::now(),
        }
    }

    pub fn message_dropped(reason: DropReason) -> Self {
        Self::MessageDropped {
            reason,
            timestamp: Utc::now(),
        }
    }

    /// Timestamp of the event
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Started { timestamp, .. } => *timestamp,
            Self::Stopped { timestamp } => *timestamp,
            Self::PeerConnected { timestamp, .. } => *timestamp,
            Self::PeerDisconnected { timestamp, .. } => *timestamp,
            Self::NatTypeDetected { timestamp, .. } => *timestamp,
            Self::HolePunchCompleted { timestamp, .. } => *timestamp,
            Self::RelayForwarded { timestamp, .. } => *timestamp,
            Self::MessageDropped { timestamp, .. } => *timestamp,
        }
    }
}
