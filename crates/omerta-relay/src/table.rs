//! Potential-relay bookkeeping
//!
//! When gossip reveals that a symmetric peer has been talking to some
//! well-connected node, that node becomes a relay candidate for the
//! symmetric peer. Candidates are kept most-recent first, deduplicated,
//! capped, and never include ourselves or the target itself.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

use omerta_core::PeerId;

/// One relay candidate for a target peer
#[derive(Debug, Clone)]
pub struct RelayCandidate {
    pub relay_peer_id: PeerId,
    pub recorded_at: DateTime<Utc>,
}

/// Relay candidates per hard-to-reach target peer
pub struct PotentialRelayTable {
    local_peer: PeerId,
    max_relays: usize,
    candidates: DashMap<PeerId, Vec<RelayCandidate>>,
}

impl PotentialRelayTable {
    pub fn new(local_peer: PeerId, max_relays: usize) -> Self {
        Self {
            local_peer,
            max_relays: max_relays.max(1),
            candidates: DashMap::new(),
        }
    }

    /// Record that `via_relay` might reach `for_peer`
    ///
    /// Ourselves and the target itself are never recorded. A re-recorded
    /// relay moves to the front.
    pub fn record(&self, for_peer: &PeerId, via_relay: &PeerId) {
        if via_relay == &self.local_peer || via_relay == for_peer {
            return;
        }
        let mut list = self.candidates.entry(for_peer.clone()).or_default();
        list.retain(|c| &c.relay_peer_id != via_relay);
        list.insert(
            0,
            RelayCandidate {
                relay_peer_id: via_relay.clone(),
                recorded_at: Utc::now(),
            },
        );
        list.truncate(self.max_relays);
        debug!(
            target = %for_peer.short_id(),
            relay = %via_relay.short_id(),
            candidates = list.len(),
            "Recorded potential relay"
        );
    }

    /// Relay candidates for a target, most recent first
    pub fn relays_for(&self, for_peer: &PeerId) -> Vec<PeerId> {
        self.candidates
            .get(for_peer)
            .map(|list| list.iter().map(|c| c.relay_peer_id.clone()).collect())
            .unwrap_or_default()
    }

    /// Drop a relay that stopped working for a target
    pub fn remove(&self, for_peer: &PeerId, relay: &PeerId) {
        if let Some(mut list) = self.candidates.get_mut(for_peer) {
            list.retain(|c| &c.relay_peer_id != relay);
        }
    }

    /// Number of targets with at least one candidate
    pub fn target_count(&self) -> usize {
        self.candidates.iter().filter(|e| !e.value().is_empty()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> PeerId {
        PeerId::from_public_key_bytes(&rand::random::<[u8; 32]>())
    }

    #[test]
    fn test_most_recent_first_and_dedup() {
        let table = PotentialRelayTable::new(peer(), 10);
        let target = peer();
        let r1 = peer();
        let r2 = peer();

        table.record(&target, &r1);
        table.record(&target, &r2);
        assert_eq!(table.relays_for(&target), vec![r2.clone(), r1.clone()]);

        // Re-recording r1 promotes it without duplicating
        table.record(&target, &r1);
        assert_eq!(table.relays_for(&target), vec![r1, r2]);
    }

    #[test]
    fn test_cap() {
        let table = PotentialRelayTable::new(peer(), 3);
        let target = peer();
        let relays: Vec<PeerId> = (0..5).map(|_| peer()).collect();
        for relay in &relays {
            table.record(&target, relay);
        }

        let kept = table.relays_for(&target);
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0], relays[4]);
    }

    #[test]
    fn test_never_self_or_target() {
        let local = peer();
        let table = PotentialRelayTable::new(local.clone(), 10);
        let target = peer();

        table.record(&target, &local);
        table.record(&target, &target);
        assert!(table.relays_for(&target).is_empty());
    }

    #[test]
    fn test_remove() {
        let table = PotentialRelayTable::new(peer(), 10);
        let target = peer();
        let relay = peer();
        table.record(&target, &relay);
        table.remove(&target, &relay);
        assert!(table.relays_for(&target).is_empty());
    }
}
