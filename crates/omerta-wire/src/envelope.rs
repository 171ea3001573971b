//! Signed message envelopes
//!
//! Every datagram on the mesh is an [`Envelope`]: a payload plus sender
//! identity, signed over a canonical serialization so any node can verify
//! it with nothing but the embedded public key.
//!
//! The signature covers the canonical JSON of the envelope with
//! `signature` set to the empty string. serde_json's default map type is
//! ordered, so routing the struct through [`serde_json::Value`] yields a
//! deterministic, sorted-key byte string on every node.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, Verifier};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use omerta_core::{decode_public_key, unix_now, Identity, MachineId, PeerId};

use crate::error::{WireError, WireResult};
use crate::message::MeshMessage;

/// The reserved channel for core protocol traffic
pub const CORE_CHANNEL: &str = "";

/// Longest permitted channel name
pub const MAX_CHANNEL_LEN: usize = 64;

/// A signed, routable message carrier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// UUID string, deduplication key
    pub message_id: String,
    pub from_peer_id: PeerId,
    /// Base64 Ed25519 public key; makes the envelope self-authenticating
    pub public_key: String,
    pub machine_id: MachineId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_peer_id: Option<PeerId>,
    /// Application channel; empty means core protocol
    pub channel: String,
    pub hop_count: u8,
    /// Fractional Unix seconds; preserved bit-exactly by both wire forms
    pub timestamp: f64,
    pub payload: MeshMessage,
    /// Base64 Ed25519 signature over the canonical form
    pub signature: String,
}

/// Check a channel name against the allowed alphabet
pub fn validate_channel(channel: &str) -> WireResult<()> {
    if channel.len() > MAX_CHANNEL_LEN {
        return Err(WireError::InvalidChannel(channel.to_string()));
    }
    if !channel
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(WireError::InvalidChannel(channel.to_string()));
    }
    Ok(())
}

impl Envelope {
    /// Build and sign an envelope from this node
    pub fn seal(
        identity: &Identity,
        machine_id: MachineId,
        to_peer_id: Option<PeerId>,
        channel: &str,
        payload: MeshMessage,
    ) -> WireResult<Self> {
        Self::seal_with_hops(identity, machine_id, to_peer_id, channel, payload, 0)
    }

    /// Build and sign an envelope with an explicit hop count
    ///
    /// Forwarders re-wrap payloads under their own identity with the hop
    /// count incremented; the count is covered by the signature, so it is
    /// fixed before signing.
    pub fn seal_with_hops(
        identity: &Identity,
        machine_id: MachineId,
        to_peer_id: Option<PeerId>,
        channel: &str,
        payload: MeshMessage,
        hop_count: u8,
    ) -> WireResult<Self> {
        validate_channel(channel)?;

        let mut envelope = Self {
            message_id: Uuid::new_v4().to_string(),
            from_peer_id: identity.peer_id(),
            public_key: identity.public_key_base64(),
            machine_id,
            to_peer_id,
            channel: channel.to_string(),
            hop_count,
            timestamp: unix_now(),
            payload,
            signature: String::new(),
        };

        let sig = identity.sign(&envelope.signing_bytes()?);
        envelope.signature = BASE64.encode(sig.to_bytes());
        Ok(envelope)
    }

    /// The canonical bytes the signature covers
    pub fn signing_bytes(&self) -> WireResult<Vec<u8>> {
        let mut unsigned = self.clone();
        unsigned.signature = String::new();
        let value = serde_json::to_value(&unsigned)
            .map_err(|e| WireError::Serialization(e.to_string()))?;
        serde_json::to_vec(&value).map_err(|e| WireError::Serialization(e.to_string()))
    }

    /// Verify the signature and the sender's peer-id derivation
    ///
    /// Both checks must pass before the envelope is allowed to touch any
    /// node state.
    pub fn verify(&self) -> WireResult<()> {
        validate_channel(&self.channel)?;

        let derived = PeerId::from_public_key_base64(&self.public_key)
            .map_err(|_| WireError::SignatureInvalid)?;
        if derived != self.from_peer_id {
            return Err(WireError::SignatureInvalid);
        }

        let key = decode_public_key(&self.public_key).map_err(|_| WireError::SignatureInvalid)?;
        let sig_bytes = BASE64
            .decode(&self.signature)
            .map_err(|_| WireError::SignatureInvalid)?;
        let sig = Signature::from_slice(&sig_bytes).map_err(|_| WireError::SignatureInvalid)?;

        key.verify(&self.signing_bytes()?, &sig)
            .map_err(|_| WireError::SignatureInvalid)
    }

    /// Encode as canonical JSON (starts with `{`)
    pub fn encode_json(&self) -> WireResult<Vec<u8>> {
        let value = serde_json::to_value(self).map_err(|e| WireError::Serialization(e.to_string()))?;
        serde_json::to_vec(&value).map_err(|e| WireError::Serialization(e.to_string()))
    }

    /// Decode either wire form, detected by the leading byte
    pub fn decode(bytes: &[u8]) -> WireResult<Self> {
        match bytes.first() {
            None => Err(WireError::Truncated),
            Some(&b'{') => {
                serde_json::from_slice(bytes).map_err(|e| WireError::Malformed(e.to_string()))
            }
            Some(_) => crate::binary::decode_binary(bytes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use omerta_core::NatType;

    fn sealed(payload: MeshMessage) -> Envelope {
        let identity = Identity::generate();
        Envelope::seal(&identity, MachineId::generate(), None, CORE_CHANNEL, payload).unwrap()
    }

    #[test]
    fn test_seal_and_verify() {
        let envelope = sealed(MeshMessage::ping(NatType::Unknown));
        envelope.verify().unwrap();
        assert_eq!(envelope.hop_count, 0);
        assert!(envelope.to_peer_id.is_none());
    }

    #[test]
    fn test_tampered_payload_fails_verify() {
        let mut envelope = sealed(MeshMessage::data(b"original".to_vec()));
        envelope.payload = MeshMessage::data(b"tampered".to_vec());
        assert!(matches!(envelope.verify(), Err(WireError::SignatureInvalid)));
    }

    #[test]
    fn test_claimed_peer_id_must_match_key() {
        let other = Identity::generate();
        let mut envelope = sealed(MeshMessage::ping(NatType::Unknown));
        envelope.from_peer_id = other.peer_id();
        assert!(matches!(envelope.verify(), Err(WireError::SignatureInvalid)));
    }

    #[test]
    fn test_json_roundtrip_preserves_signature() {
        let envelope = sealed(MeshMessage::data(vec![0, 1, 2, 255]));
        let bytes = envelope.encode_json().unwrap();
        assert_eq!(bytes[0], b'{');

        let decoded = Envelope::decode(&bytes).unwrap();
        assert_eq!(decoded, envelope);
        decoded.verify().unwrap();
    }

    #[test]
    fn test_channel_validation() {
        assert!(validate_channel("").is_ok());
        assert!(validate_channel("vm-provision_2").is_ok());
        assert!(validate_channel(&"x".repeat(64)).is_ok());
        assert!(validate_channel(&"x".repeat(65)).is_err());
        assert!(validate_channel("bad channel").is_err());
        assert!(validate_channel("bad/channel").is_err());

        let identity = Identity::generate();
        let result = Envelope::seal(
            &identity,
            MachineId::generate(),
            None,
            "no spaces allowed",
            MeshMessage::ping(NatType::Unknown),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_addressed_envelope_roundtrip() {
        let identity = Identity::generate();
        let to = Identity::generate().peer_id();
        let envelope = Envelope::seal(
            &identity,
            MachineId::generate(),
            Some(to.clone()),
            "updates",
            MeshMessage::data(b"hi".to_vec()),
        )
        .unwrap();

        let decoded = Envelope::decode(&envelope.encode_json().unwrap()).unwrap();
        assert_eq!(decoded.to_peer_id, Some(to));
        decoded.verify().unwrap();
    }

    #[test]
    fn test_decode_empty_is_error() {
        assert!(matches!(Envelope::decode(&[]), Err(WireError::Truncated)));
    }
}
