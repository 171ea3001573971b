//! Hole-punch probe packets
//!
//! Probes are fixed-size 64-byte UDP datagrams, recognizable by magic
//! before any decryption. They never carry application data; their only
//! job is to open NAT mappings and measure round trips. Timestamps are
//! sender-monotonic milliseconds; a response echoes the sequence and
//! timestamp of the probe it answers so the original sender can compute
//! RTT without any clock agreement.

use std::sync::OnceLock;
use std::time::Instant;

use omerta_core::PeerId;

/// Magic prefix of every probe
pub const PROBE_MAGIC: [u8; 4] = *b"OMHP";

/// Fixed probe datagram size
pub const PROBE_SIZE: usize = 64;

/// Bytes of the sender's peer id carried in a probe
pub const SENDER_ID_LEN: usize = 16;

/// Milliseconds on this process's monotonic clock
pub fn monotonic_millis() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// A parsed probe datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbePacket {
    pub sequence: u32,
    /// Sender-monotonic milliseconds; echoed verbatim in responses
    pub timestamp_millis: u64,
    pub is_response: bool,
    /// The sender's peer id, ASCII hex
    pub sender_id: [u8; SENDER_ID_LEN],
}

impl ProbePacket {
    /// Build an outgoing probe
    pub fn new(sequence: u32, sender: &PeerId) -> Self {
        let mut sender_id = [0u8; SENDER_ID_LEN];
        sender_id.copy_from_slice(sender.as_str().as_bytes());
        Self {
            sequence,
            timestamp_millis: monotonic_millis(),
            is_response: false,
            sender_id,
        }
    }

    /// Build the response to a received probe, echoing its sequence and
    /// timestamp
    pub fn response_to(probe: &ProbePacket, sender: &PeerId) -> Self {
        let mut sender_id = [0u8; SENDER_ID_LEN];
        sender_id.copy_from_slice(sender.as_str().as_bytes());
        Self {
            sequence: probe.sequence,
            timestamp_millis: probe.timestamp_millis,
            is_response: true,
            sender_id,
        }
    }

    /// Encode into the fixed 64-byte wire form
    pub fn encode(&self) -> [u8; PROBE_SIZE] {
        let mut buf = [0u8; PROBE_SIZE];
        buf[0..4].copy_from_slice(&PROBE_MAGIC);
        buf[4..8].copy_from_slice(&self.sequence.to_be_bytes());
        buf[8..16].copy_from_slice(&self.timestamp_millis.to_be_bytes());
        buf[16] = self.is_response as u8;
        buf[17..17 + SENDER_ID_LEN].copy_from_slice(&self.sender_id);
        buf
    }

    /// Parse a probe datagram; `None` when it is not one of ours
    pub fn parse(data: &[u8]) -> Option<Self> {
        if !is_hole_punch_probe(data) {
            return None;
        }
        let sequence = u32::from_be_bytes(data[4..8].try_into().ok()?);
        let timestamp_millis = u64::from_be_bytes(data[8..16].try_into().ok()?);
        let is_response = match data[16] {
            0 => false,
            1 => true,
            _ => return None,
        };
        let mut sender_id = [0u8; SENDER_ID_LEN];
        sender_id.copy_from_slice(&data[17..17 + SENDER_ID_LEN]);
        Some(Self {
            sequence,
            timestamp_millis,
            is_response,
            sender_id,
        })
    }

    /// The sender's peer id as a string, when it decodes cleanly
    pub fn sender_peer_id(&self) -> Option<PeerId> {
        let text = std::str::from_utf8(&self.sender_id).ok()?;
        PeerId::parse(text).ok()
    }
}

/// Cheap pre-decryption check: is this datagram a hole-punch probe?
pub fn is_hole_punch_probe(data: &[u8]) -> bool {
    data.len() == PROBE_SIZE && data[..4] == PROBE_MAGIC
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> PeerId {
        PeerId::from_public_key_bytes(&rand::random::<[u8; 32]>())
    }

    #[test]
    fn test_probe_roundtrip() {
        let sender = peer();
        let probe = ProbePacket::new(7, &sender);
        let bytes = probe.encode();

        assert_eq!(bytes.len(), PROBE_SIZE);
        assert!(is_hole_punch_probe(&bytes));

        let parsed = ProbePacket::parse(&bytes).unwrap();
        assert_eq!(parsed, probe);
        assert_eq!(parsed.sender_peer_id().unwrap(), sender);
    }

    #[test]
    fn test_response_echoes_sequence_and_timestamp() {
        let sender = peer();
        let responder = peer();
        let probe = ProbePacket::new(42, &sender);
        let response = ProbePacket::response_to(&probe, &responder);

        assert!(response.is_response);
        assert_eq!(response.sequence, 42);
        assert_eq!(response.timestamp_millis, probe.timestamp_millis);
        assert_eq!(response.sender_peer_id().unwrap(), responder);
    }

    #[test]
    fn test_non_probes_rejected() {
        assert!(!is_hole_punch_probe(b"OMHP"));
        assert!(!is_hole_punch_probe(&[0u8; PROBE_SIZE]));
        assert!(!is_hole_punch_probe(&[0u8; 100]));

        let mut bytes = ProbePacket::new(1, &peer()).encode();
        bytes[0] = b'X';
        assert!(ProbePacket::parse(&bytes).is_none());
    }

    #[test]
    fn test_probe_size_mismatch_rejected() {
        let bytes = ProbePacket::new(1, &peer()).encode();
        assert!(ProbePacket::parse(&bytes[..PROBE_SIZE - 1]).is_none());
    }

    #[test]
    fn test_monotonic_clock_advances() {
        let a = monotonic_millis();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(monotonic_millis() >= a + 2);
    }
}
