//! Pending-response registry
//!
//! `send_and_receive` parks a oneshot sender here and waits. Responses
//! are matched by request id when the payload carries one, otherwise by
//! message kind (e.g. the first outstanding ping claims the next pong),
//! optionally narrowed to an expected sender. Slots are removed on every
//! path: completion, timeout, cancellation and node shutdown, so the
//! registry cannot leak.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::debug;

use omerta_core::PeerId;
use omerta_wire::{Envelope, MeshMessage, MessageKind};

#[derive(Default)]
struct Registry {
    by_request: Mutex<HashMap<String, oneshot::Sender<Envelope>>>,
    by_kind: Mutex<Vec<KindSlot>>,
    next_seq: AtomicU64,
}

struct KindSlot {
    seq: u64,
    kinds: Vec<MessageKind>,
    expected_peer: Option<PeerId>,
    sender: oneshot::Sender<Envelope>,
}

/// Shared pending-response state
#[derive(Clone, Default)]
pub struct PendingResponses {
    registry: Arc<Registry>,
}

/// Removal guard for one parked slot
///
/// Dropping the slot (timeout, cancellation) removes it from the
/// registry; a completed slot is already gone and the drop is a no-op.
pub struct PendingSlot {
    registry: Arc<Registry>,
    key: SlotKey,
}

enum SlotKey {
    Request(String),
    Kind(u64),
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        match &self.key {
            SlotKey::Request(id) => {
                self.registry.by_request.lock().expect("pending lock").remove(id);
            }
            SlotKey::Kind(seq) => {
                self.registry
                    .by_kind
                    .lock()
                    .expect("pending lock")
                    .retain(|slot| slot.seq != *seq);
            }
        }
    }
}

impl PendingResponses {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a slot keyed by request id
    pub fn register_request(&self, request_id: &str) -> (PendingSlot, oneshot::Receiver<Envelope>) {
        let (tx, rx) = oneshot::channel();
        self.registry
            .by_request
            .lock()
            .expect("pending lock")
            .insert(request_id.to_string(), tx);
        (
            PendingSlot {
                registry: Arc::clone(&self.registry),
                key: SlotKey::Request(request_id.to_string()),
            },
            rx,
        )
    }

    /// Park a slot matched by message kind, optionally narrowed to a peer
    pub fn register_kinds(
        &self,
        kinds: &[MessageKind],
        expected_peer: Option<PeerId>,
    ) -> (PendingSlot, oneshot::Receiver<Envelope>) {
        let (tx, rx) = oneshot::channel();
        let seq = self.registry.next_seq.fetch_add(1, Ordering::Relaxed);
        self.registry.by_kind.lock().expect("pending lock").push(KindSlot {
            seq,
            kinds: kinds.to_vec(),
            expected_peer,
            sender: tx,
        });
        (
            PendingSlot {
                registry: Arc::clone(&self.registry),
                key: SlotKey::Kind(seq),
            },
            rx,
        )
    }

    /// Offer an inbound envelope to the registry
    ///
    /// Returns the envelope back when no slot claims it.
    pub fn complete(&self, envelope: Envelope) -> Option<Envelope> {
        // Request-id matching first: it is exact.
        if let MeshMessage::Response { request_id, .. } = &envelope.payload {
            let sender = self
                .registry
                .by_request
                .lock()
                .expect("pending lock")
                .remove(request_id);
            if let Some(sender) = sender {
                debug!(request_id, "Completed pending request");
                return match sender.send(envelope) {
                    Ok(()) => None,
                    Err(envelope) => Some(envelope),
                };
            }
        }

        let kind = envelope.payload.kind();
        let mut slots = self.registry.by_kind.lock().expect("pending lock");

        // Prefer a slot expecting this exact peer, fall back to the first
        // kind-only match (e.g. "first outstanding ping").
        let position = slots
            .iter()
            .position(|slot| {
                slot.kinds.contains(&kind) && slot.expected_peer.as_ref() == Some(&envelope.from_peer_id)
            })
            .or_else(|| {
                slots
                    .iter()
                    .position(|slot| slot.kinds.contains(&kind) && slot.expected_peer.is_none())
            });

        match position {
            Some(index) => {
                let slot = slots.remove(index);
                drop(slots);
                match slot.sender.send(envelope) {
                    Ok(()) => None,
                    Err(envelope) => Some(envelope),
                }
            }
            None => Some(envelope),
        }
    }

    /// Drop every parked slot; their receivers resolve with an error
    pub fn fail_all(&self) {
        self.registry.by_request.lock().expect("pending lock").clear();
        self.registry.by_kind.lock().expect("pending lock").clear();
    }

    /// Number of parked slots
    pub fn len(&self) -> usize {
        self.registry.by_request.lock().expect("pending lock").len()
            + self.registry.by_kind.lock().expect("pending lock").len()
    }

    /// Whether nothing is parked
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use omerta_core::{Identity, MachineId, NatType};
    use omerta_wire::CORE_CHANNEL;

    fn envelope(identity: &Identity, payload: MeshMessage) -> Envelope {
        Envelope::seal(identity, MachineId::generate(), None, CORE_CHANNEL, payload).unwrap()
    }

    #[tokio::test]
    async fn test_request_id_match() {
        let pending = PendingResponses::new();
        let identity = Identity::generate();
        let (_slot, rx) = pending.register_request("req-1");

        let response = envelope(
            &identity,
            MeshMessage::Response {
                request_id: "req-1".to_string(),
                data: b"ok".to_vec(),
            },
        );
        assert!(pending.complete(response).is_none());
        assert!(rx.await.is_ok());
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_kind_match_prefers_expected_peer() {
        let pending = PendingResponses::new();
        let expected = Identity::generate();
        let other = Identity::generate();

        let (_slot_any, rx_any) = pending.register_kinds(&[MessageKind::Pong], None);
        let (_slot_exp, rx_exp) =
            pending.register_kinds(&[MessageKind::Pong], Some(expected.peer_id()));

        let pong = MeshMessage::Pong {
            recent_peers: vec![],
            your_endpoint: "203.0.113.1:1".to_string(),
            my_nat_type: NatType::Unknown,
        };

        // The expected peer's pong goes to the narrowed slot even though
        // the kind-only slot was registered first
        assert!(pending.complete(envelope(&expected, pong.clone())).is_none());
        let claimed = rx_exp.await.unwrap();
        assert_eq!(claimed.from_peer_id, expected.peer_id());

        // An unrelated pong falls back to the kind-only slot
        assert!(pending.complete(envelope(&other, pong)).is_none());
        assert!(rx_any.await.is_ok());
    }

    #[tokio::test]
    async fn test_unclaimed_envelope_returned() {
        let pending = PendingResponses::new();
        let identity = Identity::generate();

        let unclaimed = pending.complete(envelope(&identity, MeshMessage::ping(NatType::Unknown)));
        assert!(unclaimed.is_some());
    }

    #[tokio::test]
    async fn test_dropped_slot_is_removed() {
        let pending = PendingResponses::new();
        {
            let (_slot, _rx) = pending.register_request("req-1");
            assert_eq!(pending.len(), 1);
        }
        assert!(pending.is_empty());

        {
            let (_slot, _rx) = pending.register_kinds(&[MessageKind::Pong], None);
            assert_eq!(pending.len(), 1);
        }
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_fail_all_errors_receivers() {
        let pending = PendingResponses::new();
        let (_slot, rx) = pending.register_request("req-1");
        pending.fail_all();
        assert!(rx.await.is_err());
    }
}
