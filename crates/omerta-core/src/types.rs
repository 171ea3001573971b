//! Shared mesh types
//!
//! The vocabulary spoken across subsystems: NAT classifications,
//! reachability paths, gossip endpoint facts, signed peer announcements
//! and recency records.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Verifier};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::identity::{decode_public_key, Identity, MachineId, PeerId};

/// Current wall-clock time as fractional Unix seconds
///
/// Envelope and announcement timestamps use this form; it survives the
/// binary codec bit-exactly.
pub fn unix_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// NAT classification for a peer (or ourselves)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NatType {
    #[default]
    Unknown,
    Public,
    FullCone,
    RestrictedCone,
    PortRestrictedCone,
    Symmetric,
}

impl NatType {
    /// Symmetric NATs assign a distinct external port per destination and
    /// defeat most hole punching.
    pub fn is_symmetric(&self) -> bool {
        matches!(self, NatType::Symmetric)
    }

    /// Cone-style NATs (including no NAT at all) keep a stable external
    /// mapping and admit simultaneous-open punching.
    pub fn is_cone(&self) -> bool {
        matches!(
            self,
            NatType::Public | NatType::FullCone | NatType::RestrictedCone | NatType::PortRestrictedCone
        )
    }
}

impl std::fmt::Display for NatType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NatType::Unknown => "unknown",
            NatType::Public => "public",
            NatType::FullCone => "full_cone",
            NatType::RestrictedCone => "restricted_cone",
            NatType::PortRestrictedCone => "port_restricted_cone",
            NatType::Symmetric => "symmetric",
        };
        write!(f, "{}", s)
    }
}

/// How a peer can be reached
///
/// Equality is structural; path-failure records key off it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReachabilityPath {
    /// Directly addressable endpoint
    Direct { endpoint: String },
    /// Reachable through an application-level relay
    Relay {
        relay_peer_id: PeerId,
        relay_endpoint: String,
    },
    /// Reachable after a coordinated hole punch
    HolePunch { public_ip: String, local_port: u16 },
}

/// How the most recent contact with a peer was made
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Direct,
    InboundDirect,
    ViaRelay,
    HolePunched,
}

/// One gossiped endpoint fact about a (peer, machine)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerEndpointInfo {
    pub peer_id: PeerId,
    pub machine_id: MachineId,
    /// `"host:port"`, IPv6 bracketed
    pub endpoint: String,
    pub nat_type: NatType,
    /// True when the reporter has directly exchanged messages with the
    /// peer, rather than merely heard about it through gossip.
    pub is_first_hand: bool,
}

/// A signed, self-contained advertisement of a peer's reachability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerAnnouncement {
    pub peer_id: PeerId,
    /// Base64 Ed25519 public key; the announcement is self-authenticating
    pub public_key: String,
    pub reachability: Vec<ReachabilityPath>,
    /// Opaque capability strings, e.g. `"relay"`, `"consumer"`
    pub capabilities: Vec<String>,
    /// Fractional Unix seconds
    pub timestamp: f64,
    pub ttl_seconds: u64,
    /// Base64 Ed25519 signature over the canonical JSON with `signature: ""`
    pub signature: String,
}

impl PeerAnnouncement {
    /// Build and sign an announcement for the given identity
    pub fn create(
        identity: &Identity,
        reachability: Vec<ReachabilityPath>,
        capabilities: Vec<String>,
        ttl_seconds: u64,
    ) -> Self {
        let mut announcement = Self {
            peer_id: identity.peer_id(),
            public_key: identity.public_key_base64(),
            reachability,
            capabilities,
            timestamp: unix_now(),
            ttl_seconds,
            signature: String::new(),
        };
        let sig = identity.sign(&announcement.signing_bytes());
        announcement.signature = BASE64.encode(sig.to_bytes());
        announcement
    }

    /// Canonical bytes that the signature covers
    fn signing_bytes(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.signature = String::new();
        let value = serde_json::to_value(&unsigned).expect("announcement serialization cannot fail");
        serde_json::to_vec(&value).expect("canonical serialization cannot fail")
    }

    /// Verify the signature and the peer-id derivation
    pub fn verify(&self) -> CoreResult<()> {
        if PeerId::from_public_key_base64(&self.public_key)? != self.peer_id {
            return Err(CoreError::SignatureInvalid);
        }
        let key = decode_public_key(&self.public_key)?;
        let sig_bytes = BASE64
            .decode(&self.signature)
            .map_err(|_| CoreError::SignatureInvalid)?;
        let sig = Signature::from_slice(&sig_bytes).map_err(|_| CoreError::SignatureInvalid)?;
        key.verify(&self.signing_bytes(), &sig)
            .map_err(|_| CoreError::SignatureInvalid)
    }

    /// Whether the announcement has outlived its TTL at `now` (Unix seconds)
    pub fn is_expired(&self, now: f64) -> bool {
        now > self.timestamp + self.ttl_seconds as f64
    }

    /// Whether the peer advertises a capability
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

/// A recent successful exchange with a peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentContact {
    pub peer_id: PeerId,
    pub last_seen: DateTime<Utc>,
    pub reachability: ReachabilityPath,
    pub latency_ms: Option<u32>,
    pub connection_type: ConnectionType,
}

/// A locally recorded path failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathFailure {
    pub peer_id: PeerId,
    pub path: ReachabilityPath,
    pub failed_at: DateTime<Utc>,
    /// The peer that told us, for failures learned from the wire
    pub reported_by: Option<PeerId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nat_type_classes() {
        assert!(NatType::Symmetric.is_symmetric());
        assert!(!NatType::Symmetric.is_cone());
        assert!(NatType::Public.is_cone());
        assert!(NatType::PortRestrictedCone.is_cone());
        assert!(!NatType::Unknown.is_cone());
        assert!(!NatType::Unknown.is_symmetric());
    }

    #[test]
    fn test_reachability_structural_equality() {
        let a = ReachabilityPath::Direct {
            endpoint: "203.0.113.1:4800".to_string(),
        };
        let b = ReachabilityPath::Direct {
            endpoint: "203.0.113.1:4800".to_string(),
        };
        let c = ReachabilityPath::Direct {
            endpoint: "203.0.113.1:4801".to_string(),
        };
        assert_eq!(a, b);
        assert_ne!(a, c);

        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(a);
        set.insert(b);
        set.insert(c);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_announcement_sign_verify() {
        let identity = Identity::generate();
        let announcement = PeerAnnouncement::create(
            &identity,
            vec![ReachabilityPath::Direct {
                endpoint: "203.0.113.1:4800".to_string(),
            }],
            vec!["relay".to_string()],
            300,
        );

        announcement.verify().unwrap();
        assert!(announcement.has_capability("relay"));
        assert!(!announcement.has_capability("consumer"));
    }

    #[test]
    fn test_announcement_tamper_detected() {
        let identity = Identity::generate();
        let mut announcement = PeerAnnouncement::create(&identity, vec![], vec![], 300);

        announcement.capabilities.push("relay".to_string());
        assert!(announcement.verify().is_err());
    }

    #[test]
    fn test_announcement_wrong_peer_id_detected() {
        let identity = Identity::generate();
        let other = Identity::generate();
        let mut announcement = PeerAnnouncement::create(&identity, vec![], vec![], 300);

        // Claiming another peer's id must fail even with a valid key
        announcement.peer_id = other.peer_id();
        assert!(announcement.verify().is_err());
    }

    #[test]
    fn test_announcement_expiry() {
        let identity = Identity::generate();
        let announcement = PeerAnnouncement::create(&identity, vec![], vec![], 60);

        assert!(!announcement.is_expired(announcement.timestamp + 59.0));
        assert!(announcement.is_expired(announcement.timestamp + 61.0));
    }
}
