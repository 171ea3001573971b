//! Bounded-fanout gossip propagation
//!
//! Newly learned peer facts are queued with a propagation count equal to
//! the fanout. Each time a fact is included in an outbound ping or pong
//! the count drops by one; at zero the fact is forgotten. Re-learning a
//! queued fact never resets its count, so a chatty neighbor cannot make us
//! amplify the same fact forever.

use std::collections::HashMap;
use std::sync::Mutex;

use dashmap::DashSet;
use tracing::debug;

use omerta_core::{PeerEndpointInfo, PeerId};

/// A queued fact and its remaining propagation budget
#[derive(Debug, Clone)]
pub struct PropagationItem {
    pub info: PeerEndpointInfo,
    pub count: u32,
}

/// Queue of peer facts awaiting propagation
pub struct PropagationQueue {
    local_peer: PeerId,
    fanout: u32,
    items: Mutex<HashMap<PeerId, PropagationItem>>,
}

impl PropagationQueue {
    pub fn new(local_peer: PeerId, fanout: u32) -> Self {
        Self {
            local_peer,
            fanout: fanout.max(1),
            items: Mutex::new(HashMap::new()),
        }
    }

    /// Queue a peer fact for propagation
    ///
    /// Our own peer id is never queued. A peer already queued keeps its
    /// current count; only the endpoint info is refreshed.
    pub fn add(&self, info: PeerEndpointInfo) {
        if info.peer_id == self.local_peer {
            return;
        }
        let mut items = self.items.lock().expect("propagation lock");
        match items.get_mut(&info.peer_id) {
            Some(item) => item.info = info,
            None => {
                debug!(peer = %info.peer_id.short_id(), fanout = self.fanout, "Queued peer for gossip");
                items.insert(
                    info.peer_id.clone(),
                    PropagationItem {
                        info,
                        count: self.fanout,
                    },
                );
            }
        }
    }

    /// Build the peer list for one outbound message
    ///
    /// Includes up to `max_per_message` queued facts, excluding the
    /// recipient itself; each included fact's count drops by one and
    /// exhausted facts leave the queue. `is_first_hand` is rewritten from
    /// the first-hand tracker so it reflects *our* relationship with the
    /// peer, not the original reporter's.
    pub fn build_peer_list(
        &self,
        exclude: &PeerId,
        max_per_message: usize,
        first_hand: &FirstHandTracker,
    ) -> Vec<PeerEndpointInfo> {
        let mut items = self.items.lock().expect("propagation lock");
        let mut list = Vec::new();
        let mut exhausted = Vec::new();

        for (peer, item) in items.iter_mut() {
            if list.len() >= max_per_message {
                break;
            }
            if peer == exclude {
                continue;
            }
            let mut info = item.info.clone();
            info.is_first_hand = first_hand.contains(peer);
            list.push(info);

            item.count -= 1;
            if item.count == 0 {
                exhausted.push(peer.clone());
            }
        }
        for peer in exhausted {
            items.remove(&peer);
        }
        list
    }

    /// Remaining propagation count for a peer, if queued
    pub fn count_for(&self, peer: &PeerId) -> Option<u32> {
        self.items.lock().expect("propagation lock").get(peer).map(|i| i.count)
    }

    /// Whether a peer is queued
    pub fn contains(&self, peer: &PeerId) -> bool {
        self.items.lock().expect("propagation lock").contains_key(peer)
    }

    /// Number of queued facts
    pub fn len(&self) -> usize {
        self.items.lock().expect("propagation lock").len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Peers this node has directly exchanged verified messages with
#[derive(Default)]
pub struct FirstHandTracker {
    peers: DashSet<PeerId>,
}

impl FirstHandTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a peer as first-hand after a verified exchange
    pub fn mark(&self, peer: &PeerId) {
        self.peers.insert(peer.clone());
    }

    /// Whether we have spoken with the peer directly
    pub fn contains(&self, peer: &PeerId) -> bool {
        self.peers.contains(peer)
    }

    /// All first-hand peers
    pub fn peers(&self) -> Vec<PeerId> {
        self.peers.iter().map(|p| p.clone()).collect()
    }

    /// Number of first-hand peers
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether no peer is marked
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use omerta_core::{MachineId, NatType};

    fn peer() -> PeerId {
        PeerId::from_public_key_bytes(&rand::random::<[u8; 32]>())
    }

    fn info(peer_id: &PeerId) -> PeerEndpointInfo {
        PeerEndpointInfo {
            peer_id: peer_id.clone(),
            machine_id: MachineId::generate(),
            endpoint: "203.0.113.1:4800".to_string(),
            nat_type: NatType::Unknown,
            is_first_hand: false,
        }
    }

    #[test]
    fn test_fanout_exhaustion() {
        let local = peer();
        let queue = PropagationQueue::new(local, 5);
        let first_hand = FirstHandTracker::new();
        let x = peer();
        let exclude = peer();

        queue.add(info(&x));
        assert_eq!(queue.count_for(&x), Some(5));

        for round in 0..5 {
            let list = queue.build_peer_list(&exclude, 10, &first_hand);
            assert_eq!(list.len(), 1, "round {}", round);
            assert_eq!(list[0].peer_id, x);
        }
        assert!(queue.is_empty());
        assert!(queue.build_peer_list(&exclude, 10, &first_hand).is_empty());
    }

    #[test]
    fn test_readd_keeps_count() {
        let queue = PropagationQueue::new(peer(), 5);
        let first_hand = FirstHandTracker::new();
        let x = peer();

        queue.add(info(&x));
        queue.build_peer_list(&peer(), 10, &first_hand);
        queue.build_peer_list(&peer(), 10, &first_hand);
        assert_eq!(queue.count_for(&x), Some(3));

        // Hearing about x again must not reset the budget
        queue.add(info(&x));
        assert_eq!(queue.count_for(&x), Some(3));
    }

    #[test]
    fn test_self_never_queued() {
        let local = peer();
        let queue = PropagationQueue::new(local.clone(), 5);
        queue.add(info(&local));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_recipient_excluded() {
        let queue = PropagationQueue::new(peer(), 5);
        let first_hand = FirstHandTracker::new();
        let x = peer();
        queue.add(info(&x));

        let list = queue.build_peer_list(&x, 10, &first_hand);
        assert!(list.is_empty());
        // Exclusion does not burn the count
        assert_eq!(queue.count_for(&x), Some(5));
    }

    #[test]
    fn test_message_local_cap() {
        let queue = PropagationQueue::new(peer(), 5);
        let first_hand = FirstHandTracker::new();
        for _ in 0..20 {
            queue.add(info(&peer()));
        }

        let list = queue.build_peer_list(&peer(), 10, &first_hand);
        assert_eq!(list.len(), 10);
        assert_eq!(queue.len(), 20);
    }

    #[test]
    fn test_first_hand_flag_rewritten() {
        let queue = PropagationQueue::new(peer(), 5);
        let first_hand = FirstHandTracker::new();
        let known = peer();
        let unknown = peer();
        first_hand.mark(&known);

        // Reporter claimed first-hand for both; we only vouch for `known`
        let mut reported = info(&known);
        reported.is_first_hand = true;
        queue.add(reported);
        let mut reported = info(&unknown);
        reported.is_first_hand = true;
        queue.add(reported);

        let list = queue.build_peer_list(&peer(), 10, &first_hand);
        for entry in list {
            if entry.peer_id == known {
                assert!(entry.is_first_hand);
            } else {
                assert!(!entry.is_first_hand);
            }
        }
    }
}
