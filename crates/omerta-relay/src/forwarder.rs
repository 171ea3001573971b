//! Relay forwarding policy
//!
//! A relay receives `relay_forward(target, payload)` where the payload is
//! the plaintext envelope the origin already signed for the target. The
//! relay's only jobs are to decide whether to forward, to which endpoint,
//! and to report the outcome back to the requester. Re-sealing with the
//! network cipher happens at the node's send path like any other
//! datagram, and the target verifies the origin's signature as usual, so
//! a relay cannot alter what it forwards without detection.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use omerta_core::PeerId;
use omerta_wire::MeshMessage;

/// What to do with one relay-forward request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardDecision {
    /// Send `payload` to the target's endpoint, then report success
    Send { endpoint: String, payload: Vec<u8> },
    /// Refuse (relaying disabled or target unknown); report failure
    Refuse,
}

/// Counters for relay activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStats {
    pub forwarded: u64,
    pub refused: u64,
}

/// Decides and accounts for relay forwards
pub struct RelayForwarder {
    can_relay: bool,
    forwarded: AtomicU64,
    refused: AtomicU64,
}

impl RelayForwarder {
    pub fn new(can_relay: bool) -> Self {
        Self {
            can_relay,
            forwarded: AtomicU64::new(0),
            refused: AtomicU64::new(0),
        }
    }

    /// Whether this node relays at all
    pub fn is_enabled(&self) -> bool {
        self.can_relay
    }

    /// Decide what to do with a forward request
    ///
    /// `target_endpoint` is the caller's best endpoint for the target's
    /// most recent machine, when one is known.
    pub fn decide(
        &self,
        target: &PeerId,
        target_endpoint: Option<String>,
        payload: Vec<u8>,
    ) -> ForwardDecision {
        if !self.can_relay {
            debug!(target = %target.short_id(), "Refusing relay forward: relaying disabled");
            self.refused.fetch_add(1, Ordering::Relaxed);
            return ForwardDecision::Refuse;
        }
        match target_endpoint {
            Some(endpoint) => {
                debug!(target = %target.short_id(), endpoint, bytes = payload.len(), "Forwarding for peer");
                self.forwarded.fetch_add(1, Ordering::Relaxed);
                ForwardDecision::Send { endpoint, payload }
            }
            None => {
                warn!(target = %target.short_id(), "Refusing relay forward: target unknown");
                self.refused.fetch_add(1, Ordering::Relaxed);
                ForwardDecision::Refuse
            }
        }
    }

    /// The result message to send back to the requester
    pub fn result_message(target: &PeerId, success: bool) -> MeshMessage {
        MeshMessage::RelayForwardResult {
            target_peer_id: target.clone(),
            success,
        }
    }

    /// Current counters
    pub fn stats(&self) -> RelayStats {
        RelayStats {
            forwarded: self.forwarded.load(Ordering::Relaxed),
            refused: self.refused.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> PeerId {
        PeerId::from_public_key_bytes(&rand::random::<[u8; 32]>())
    }

    #[test]
    fn test_forward_with_known_endpoint() {
        let forwarder = RelayForwarder::new(true);
        let target = peer();

        let decision = forwarder.decide(&target, Some("203.0.113.1:4800".to_string()), b"env".to_vec());
        assert_eq!(
            decision,
            ForwardDecision::Send {
                endpoint: "203.0.113.1:4800".to_string(),
                payload: b"env".to_vec(),
            }
        );
        assert_eq!(forwarder.stats().forwarded, 1);
    }

    #[test]
    fn test_unknown_target_refused() {
        let forwarder = RelayForwarder::new(true);
        let decision = forwarder.decide(&peer(), None, b"env".to_vec());
        assert_eq!(decision, ForwardDecision::Refuse);
        assert_eq!(forwarder.stats().refused, 1);
    }

    #[test]
    fn test_disabled_relay_refuses_everything() {
        let forwarder = RelayForwarder::new(false);
        let decision = forwarder.decide(&peer(), Some("203.0.113.1:4800".to_string()), b"env".to_vec());
        assert_eq!(decision, ForwardDecision::Refuse);
        assert!(!forwarder.is_enabled());
    }

    #[test]
    fn test_result_message_shape() {
        let target = peer();
        match RelayForwarder::result_message(&target, true) {
            MeshMessage::RelayForwardResult { target_peer_id, success } => {
                assert_eq!(target_peer_id, target);
                assert!(success);
            }
            _ => panic!("wrong message"),
        }
    }
}
