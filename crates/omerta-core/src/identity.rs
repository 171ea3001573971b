//! Peer and machine identity
//!
//! A peer is a durable Ed25519 keypair; its [`PeerId`] is derived from the
//! public key and is what other nodes address. A [`MachineId`] distinguishes
//! multiple installs that share one peer identity.

use std::fmt::{self, Debug, Display};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

/// Number of hex characters in a peer id (8 digest bytes)
pub const PEER_ID_LEN: usize = 16;

/// A peer's stable identifier: lowercase hex of the first 8 bytes of
/// SHA-256 over the Ed25519 public key.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Derive a peer id from a public key
    pub fn from_public_key(key: &VerifyingKey) -> Self {
        Self::from_public_key_bytes(key.as_bytes())
    }

    /// Derive a peer id from raw public key bytes
    pub fn from_public_key_bytes(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        Self(hex::encode(&digest[..8]))
    }

    /// Derive a peer id from a base64-encoded public key
    pub fn from_public_key_base64(b64: &str) -> CoreResult<Self> {
        let bytes = BASE64
            .decode(b64)
            .map_err(|e| CoreError::InvalidIdentity(e.to_string()))?;
        Ok(Self::from_public_key_bytes(&bytes))
    }

    /// Parse a peer id string, validating shape
    pub fn parse(s: &str) -> CoreResult<Self> {
        if s.len() != PEER_ID_LEN || !s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()) {
            return Err(CoreError::InvalidIdentity(format!(
                "peer id must be {} lowercase hex chars: {:?}",
                PEER_ID_LEN, s
            )));
        }
        Ok(Self(s.to_string()))
    }

    /// Get the peer id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short display form for logging (first 8 chars)
    pub fn short_id(&self) -> &str {
        &self.0[..8]
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

/// A stable identifier for one install of the node software.
///
/// One peer identity may run on several machines; endpoints are tracked
/// per (peer, machine) so replies reach the device that actually sent.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MachineId(Uuid);

impl MachineId {
    /// Generate a fresh machine id
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from a UUID string
    pub fn parse(s: &str) -> CoreResult<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| CoreError::InvalidIdentity(format!("invalid machine id: {}", e)))
    }

    /// Hyphenated string form
    pub fn as_string(&self) -> String {
        self.0.to_string()
    }
}

impl Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Debug for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MachineId({})", self.0)
    }
}

/// The node's signing identity
///
/// Wraps an Ed25519 signing key. The same identity may be loaded on
/// multiple machines; see [`MachineId`].
#[derive(Clone)]
pub struct Identity {
    signing: SigningKey,
}

impl Identity {
    /// Generate a fresh identity
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::from_bytes(&rand::random::<[u8; 32]>()),
        }
    }

    /// Restore an identity from its 32 secret bytes
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(bytes),
        }
    }

    /// Secret bytes for persistence
    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    /// The public half of the keypair
    pub fn public_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// Base64 form of the public key, as embedded in envelopes
    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.public_key().as_bytes())
    }

    /// The peer id derived from this identity's public key
    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.public_key())
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }
}

impl Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.peer_id())
    }
}

/// Decode a base64 public key into a verifying key
pub fn decode_public_key(b64: &str) -> CoreResult<VerifyingKey> {
    let bytes = BASE64
        .decode(b64)
        .map_err(|e| CoreError::InvalidIdentity(e.to_string()))?;
    if bytes.len() != 32 {
        return Err(CoreError::InvalidKeyLength {
            expected: 32,
            actual: bytes.len(),
        });
    }
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&bytes);
    VerifyingKey::from_bytes(&arr).map_err(|e| CoreError::InvalidIdentity(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_shape() {
        let identity = Identity::generate();
        let peer_id = identity.peer_id();
        assert_eq!(peer_id.as_str().len(), PEER_ID_LEN);
        assert!(peer_id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(peer_id.as_str(), peer_id.as_str().to_lowercase());
    }

    #[test]
    fn test_peer_id_deterministic() {
        let identity = Identity::generate();
        let a = PeerId::from_public_key(&identity.public_key());
        let b = PeerId::from_public_key_base64(&identity.public_key_base64()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_peer_id_parse_rejects_bad_shapes() {
        assert!(PeerId::parse("0123456789abcdef").is_ok());
        assert!(PeerId::parse("0123456789ABCDEF").is_err());
        assert!(PeerId::parse("0123456789abcde").is_err());
        assert!(PeerId::parse("0123456789abcdefg").is_err());
        assert!(PeerId::parse("not-hex-not-hex!").is_err());
    }

    #[test]
    fn test_identity_roundtrip() {
        let identity = Identity::generate();
        let restored = Identity::from_bytes(&identity.to_bytes());
        assert_eq!(identity.peer_id(), restored.peer_id());
    }

    #[test]
    fn test_signature_verifies() {
        use ed25519_dalek::Verifier;

        let identity = Identity::generate();
        let sig = identity.sign(b"hello mesh");
        assert!(identity.public_key().verify(b"hello mesh", &sig).is_ok());
        assert!(identity.public_key().verify(b"tampered", &sig).is_err());
    }

    #[test]
    fn test_decode_public_key_rejects_wrong_length() {
        let short = BASE64.encode([0u8; 16]);
        match decode_public_key(&short) {
            Err(CoreError::InvalidKeyLength { expected, actual }) => {
                assert_eq!(expected, 32);
                assert_eq!(actual, 16);
            }
            other => panic!("expected InvalidKeyLength, got {:?}", other),
        }
    }

    #[test]
    fn test_machine_id_roundtrip() {
        let id = MachineId::generate();
        let parsed = MachineId::parse(&id.as_string()).unwrap();
        assert_eq!(id, parsed);
    }
}
