//! Machine ↔ peer association history
//!
//! One peer identity may live on several machines, and (rarely) a machine
//! may change hands between identities. Both directions of the association
//! are tracked with timestamps so "most recent" queries stay cheap.
//!
//! Responders must address replies to the machine id carried in the
//! inbound envelope rather than re-looking up the peer's most recent
//! machine; the registry exists for route *selection*, not reply
//! addressing.

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use omerta_core::{MachineId, PeerId};

/// Bidirectional machine ↔ peer association history
#[derive(Default)]
pub struct AssociationRegistry {
    peer_to_machines: DashMap<PeerId, Vec<(MachineId, DateTime<Utc>)>>,
    machine_to_peers: DashMap<MachineId, Vec<(PeerId, DateTime<Utc>)>>,
}

impl AssociationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `machine` was just observed speaking for `peer`
    pub fn record(&self, peer: &PeerId, machine: MachineId) {
        let now = Utc::now();

        let mut machines = self.peer_to_machines.entry(peer.clone()).or_default();
        match machines.iter_mut().find(|(m, _)| *m == machine) {
            Some(entry) => entry.1 = now,
            None => machines.push((machine, now)),
        }
        drop(machines);

        let mut peers = self.machine_to_peers.entry(machine).or_default();
        match peers.iter_mut().find(|(p, _)| p == peer) {
            Some(entry) => entry.1 = now,
            None => peers.push((peer.clone(), now)),
        }
    }

    /// The machine most recently observed for a peer
    pub fn most_recent_machine(&self, peer: &PeerId) -> Option<MachineId> {
        self.peer_to_machines
            .get(peer)
            .and_then(|machines| machines.iter().max_by_key(|(_, t)| *t).map(|(m, _)| *m))
    }

    /// The peer most recently observed on a machine
    pub fn most_recent_peer(&self, machine: MachineId) -> Option<PeerId> {
        self.machine_to_peers
            .get(&machine)
            .and_then(|peers| peers.iter().max_by_key(|(_, t)| *t).map(|(p, _)| p.clone()))
    }

    /// All machines a peer has been seen on, most recent first
    pub fn machines_for_peer(&self, peer: &PeerId) -> Vec<MachineId> {
        self.peer_to_machines
            .get(peer)
            .map(|machines| {
                let mut sorted = machines.clone();
                sorted.sort_by(|a, b| b.1.cmp(&a.1));
                sorted.into_iter().map(|(m, _)| m).collect()
            })
            .unwrap_or_default()
    }

    /// All peers a machine has spoken for, most recent first
    pub fn peers_for_machine(&self, machine: MachineId) -> Vec<PeerId> {
        self.machine_to_peers
            .get(&machine)
            .map(|peers| {
                let mut sorted = peers.clone();
                sorted.sort_by(|a, b| b.1.cmp(&a.1));
                sorted.into_iter().map(|(p, _)| p).collect()
            })
            .unwrap_or_default()
    }

    /// Whether a peer has ever been observed
    pub fn knows_peer(&self, peer: &PeerId) -> bool {
        self.peer_to_machines.contains_key(peer)
    }

    /// Number of known peers
    pub fn peer_count(&self) -> usize {
        self.peer_to_machines.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> PeerId {
        PeerId::from_public_key_bytes(&rand::random::<[u8; 32]>())
    }

    #[test]
    fn test_most_recent_machine_tracks_latest() {
        let registry = AssociationRegistry::new();
        let p = peer();
        let m1 = MachineId::generate();
        let m2 = MachineId::generate();

        registry.record(&p, m1);
        registry.record(&p, m2);
        assert_eq!(registry.most_recent_machine(&p), Some(m2));

        // Seeing m1 again flips it back
        registry.record(&p, m1);
        assert_eq!(registry.most_recent_machine(&p), Some(m1));
        assert_eq!(registry.machines_for_peer(&p), vec![m1, m2]);
    }

    #[test]
    fn test_machine_changing_peers() {
        let registry = AssociationRegistry::new();
        let p1 = peer();
        let p2 = peer();
        let m = MachineId::generate();

        registry.record(&p1, m);
        registry.record(&p2, m);
        assert_eq!(registry.most_recent_peer(m), Some(p2.clone()));
        assert_eq!(registry.peers_for_machine(m), vec![p2, p1]);
    }

    #[test]
    fn test_unknown_lookups_are_none() {
        let registry = AssociationRegistry::new();
        assert!(registry.most_recent_machine(&peer()).is_none());
        assert!(registry.most_recent_peer(MachineId::generate()).is_none());
        assert!(!registry.knows_peer(&peer()));
    }
}
