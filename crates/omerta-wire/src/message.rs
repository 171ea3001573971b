//! Mesh protocol payloads
//!
//! The tagged union carried inside every [`Envelope`](crate::Envelope).
//! JSON form is internally tagged (`"type"` field, snake_case); the binary
//! form assigns each variant a type tag byte in declaration order.

use serde::{Deserialize, Serialize};

use omerta_core::{NatType, PeerAnnouncement, PeerEndpointInfo, PeerId, ReachabilityPath};

/// All message payloads spoken on the mesh
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MeshMessage {
    /// Liveness probe carrying gossip
    Ping {
        recent_peers: Vec<PeerEndpointInfo>,
        my_nat_type: NatType,
        /// Ask the receiver for all its first-hand peers
        request_full_list: bool,
    },

    /// Reply to a ping; tells the sender how we see its endpoint
    Pong {
        recent_peers: Vec<PeerEndpointInfo>,
        your_endpoint: String,
        my_nat_type: NatType,
    },

    /// Application payload for a channel handler
    Data { data: Vec<u8> },

    /// Application request expecting a correlated response
    Request { request_id: String, data: Vec<u8> },

    /// Correlated response to a request
    Response { request_id: String, data: Vec<u8> },

    /// Signed reachability advertisement
    Announce { announcement: PeerAnnouncement },

    /// Ask the mesh for a peer's announcement
    FindPeer { peer_id: PeerId },

    /// Answer to `FindPeer`
    PeerInfo { announcement: PeerAnnouncement },

    /// Negative answer to `FindPeer`
    PeerNotFound { peer_id: PeerId },

    /// Ask a coordinator to set up a punch toward `target_peer_id`
    HolePunchRequest {
        request_id: String,
        target_peer_id: PeerId,
        initiator_endpoint: String,
        initiator_nat_type: NatType,
    },

    /// Coordinator's invitation to the target; the target echoes it back
    /// with `accepted = true`
    HolePunchInvite {
        request_id: String,
        initiator_peer_id: PeerId,
        initiator_endpoint: String,
        initiator_nat_type: NatType,
        accepted: bool,
    },

    /// Coordinator's go signal, sent to both parties at once
    HolePunchExecute {
        request_id: String,
        target_endpoint: String,
        peer_endpoint: Option<String>,
        simultaneous_send: bool,
    },

    /// Ask a relay to forward `payload` (an encoded envelope) to the target
    RelayForward {
        target_peer_id: PeerId,
        payload: Vec<u8>,
    },

    /// Relay's report back to the requester
    RelayForwardResult {
        target_peer_id: PeerId,
        success: bool,
    },

    /// Freshness query: has anyone heard from this peer recently?
    WhoHasRecent {
        peer_id: PeerId,
        max_age_seconds: u64,
    },

    /// Positive answer to a freshness query
    IHaveRecent {
        peer_id: PeerId,
        last_seen_seconds_ago: u64,
        reachability: ReachabilityPath,
    },

    /// A path to a peer stopped working (accepted, never emitted)
    PathFailed {
        peer_id: PeerId,
        path: ReachabilityPath,
        failed_at: f64,
    },
}

/// Discriminant of a [`MeshMessage`], used for dispatch, logging and
/// kind-matched pending responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Ping,
    Pong,
    Data,
    Request,
    Response,
    Announce,
    FindPeer,
    PeerInfo,
    PeerNotFound,
    HolePunchRequest,
    HolePunchInvite,
    HolePunchExecute,
    RelayForward,
    RelayForwardResult,
    WhoHasRecent,
    IHaveRecent,
    PathFailed,
}

impl MeshMessage {
    /// The payload's discriminant
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Ping { .. } => MessageKind::Ping,
            Self::Pong { .. } => MessageKind::Pong,
            Self::Data { .. } => MessageKind::Data,
            Self::Request { .. } => MessageKind::Request,
            Self::Response { .. } => MessageKind::Response,
            Self::Announce { .. } => MessageKind::Announce,
            Self::FindPeer { .. } => MessageKind::FindPeer,
            Self::PeerInfo { .. } => MessageKind::PeerInfo,
            Self::PeerNotFound { .. } => MessageKind::PeerNotFound,
            Self::HolePunchRequest { .. } => MessageKind::HolePunchRequest,
            Self::HolePunchInvite { .. } => MessageKind::HolePunchInvite,
            Self::HolePunchExecute { .. } => MessageKind::HolePunchExecute,
            Self::RelayForward { .. } => MessageKind::RelayForward,
            Self::RelayForwardResult { .. } => MessageKind::RelayForwardResult,
            Self::WhoHasRecent { .. } => MessageKind::WhoHasRecent,
            Self::IHaveRecent { .. } => MessageKind::IHaveRecent,
            Self::PathFailed { .. } => MessageKind::PathFailed,
        }
    }

    /// Convenience ctor for an empty-gossip ping
    pub fn ping(my_nat_type: NatType) -> Self {
        Self::Ping {
            recent_peers: Vec::new(),
            my_nat_type,
            request_full_list: false,
        }
    }

    /// Convenience ctor for a data payload
    pub fn data(data: impl Into<Vec<u8>>) -> Self {
        Self::Data { data: data.into() }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Data => "data",
            Self::Request => "request",
            Self::Response => "response",
            Self::Announce => "announce",
            Self::FindPeer => "find_peer",
            Self::PeerInfo => "peer_info",
            Self::PeerNotFound => "peer_not_found",
            Self::HolePunchRequest => "hole_punch_request",
            Self::HolePunchInvite => "hole_punch_invite",
            Self::HolePunchExecute => "hole_punch_execute",
            Self::RelayForward => "relay_forward",
            Self::RelayForwardResult => "relay_forward_result",
            Self::WhoHasRecent => "who_has_recent",
            Self::IHaveRecent => "i_have_recent",
            Self::PathFailed => "path_failed",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_tags_are_snake_case() {
        let msg = MeshMessage::WhoHasRecent {
            peer_id: PeerId::from_public_key_bytes(&[1u8; 32]),
            max_age_seconds: 300,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "who_has_recent");
        assert_eq!(json["max_age_seconds"], 300);
    }

    #[test]
    fn test_kind_matches_variant() {
        assert_eq!(MeshMessage::ping(NatType::Unknown).kind(), MessageKind::Ping);
        assert_eq!(MeshMessage::data(b"x".to_vec()).kind(), MessageKind::Data);
        assert_eq!(format!("{}", MessageKind::HolePunchExecute), "hole_punch_execute");
    }
}
