//! Announcement cache with TTL, LRU bounds and reliability scoring
//!
//! Verified peer announcements are cached so `find_peer` queries and relay
//! selection can be answered locally. The cache is LRU-bounded; each entry
//! also expires with its announcement's TTL. Success/failure counters feed
//! a reliability score used to order relay candidates.

use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use omerta_core::{unix_now, PeerAnnouncement, PeerId};

use crate::error::{MeshError, MeshResult};

/// A cached announcement plus local bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedPeer {
    pub announcement: PeerAnnouncement,
    pub inserted_at: DateTime<Utc>,
    pub successes: u32,
    pub failures: u32,
}

impl CachedPeer {
    /// Fraction of interactions that succeeded; 1.0 for an untried peer
    pub fn reliability_score(&self) -> f64 {
        let total = self.successes + self.failures;
        if total == 0 {
            return 1.0;
        }
        self.successes as f64 / total as f64
    }
}

/// LRU + TTL bounded cache of peer announcements
pub struct PeerStore {
    peers: Mutex<LruCache<PeerId, CachedPeer>>,
}

impl PeerStore {
    /// Create a store bounded to `capacity` peers
    pub fn new(capacity: usize) -> Self {
        Self {
            peers: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).expect("capacity floor is 1"),
            )),
        }
    }

    /// Insert or refresh an announcement (verified by the caller)
    ///
    /// Reliability counters survive refreshes of the same peer.
    pub fn insert(&self, announcement: PeerAnnouncement) {
        let mut peers = self.peers.lock().expect("peer store lock");
        let peer_id = announcement.peer_id.clone();
        if let Some(existing) = peers.get_mut(&peer_id) {
            existing.announcement = announcement;
            existing.inserted_at = Utc::now();
        } else {
            peers.push(
                peer_id,
                CachedPeer {
                    announcement,
                    inserted_at: Utc::now(),
                    successes: 0,
                    failures: 0,
                },
            );
        }
    }

    /// Fetch a live announcement; an expired one is evicted on the spot
    pub fn get(&self, peer: &PeerId) -> Option<PeerAnnouncement> {
        let mut peers = self.peers.lock().expect("peer store lock");
        match peers.get(peer) {
            Some(cached) if cached.announcement.is_expired(unix_now()) => {
                debug!(peer = %peer.short_id(), "Evicting expired announcement");
                peers.pop(peer);
                None
            }
            Some(cached) => Some(cached.announcement.clone()),
            None => None,
        }
    }

    /// Record a successful interaction with a peer
    pub fn record_success(&self, peer: &PeerId) {
        let mut peers = self.peers.lock().expect("peer store lock");
        if let Some(cached) = peers.get_mut(peer) {
            cached.successes += 1;
        }
    }

    /// Record a failed interaction with a peer
    pub fn record_failure(&self, peer: &PeerId) {
        let mut peers = self.peers.lock().expect("peer store lock");
        if let Some(cached) = peers.get_mut(peer) {
            cached.failures += 1;
        }
    }

    /// The peer's current reliability score, if cached
    pub fn reliability(&self, peer: &PeerId) -> Option<f64> {
        let peers = self.peers.lock().expect("peer store lock");
        peers.peek(peer).map(|c| c.reliability_score())
    }

    /// Live announcements advertising a capability, most reliable first
    pub fn peers_with_capability(&self, capability: &str) -> Vec<PeerAnnouncement> {
        let now = unix_now();
        let peers = self.peers.lock().expect("peer store lock");
        let mut matches: Vec<&CachedPeer> = peers
            .iter()
            .map(|(_, cached)| cached)
            .filter(|c| !c.announcement.is_expired(now) && c.announcement.has_capability(capability))
            .collect();
        matches.sort_by(|a, b| {
            b.reliability_score()
                .partial_cmp(&a.reliability_score())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matches.into_iter().map(|c| c.announcement.clone()).collect()
    }

    /// Drop every expired announcement
    pub fn prune_expired(&self) {
        let now = unix_now();
        let mut peers = self.peers.lock().expect("peer store lock");
        let expired: Vec<PeerId> = peers
            .iter()
            .filter(|(_, c)| c.announcement.is_expired(now))
            .map(|(p, _)| p.clone())
            .collect();
        for peer in expired {
            peers.pop(&peer);
        }
    }

    /// Number of cached peers (including possibly expired ones)
    pub fn len(&self) -> usize {
        self.peers.lock().expect("peer store lock").len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persist to `peers.json` with an atomic rewrite
    pub fn save(&self, path: &Path) -> MeshResult<()> {
        let peers = self.peers.lock().expect("peer store lock");
        // Oldest first so reloading rebuilds the same recency order
        let entries: Vec<CachedPeer> = peers.iter().rev().map(|(_, c)| c.clone()).collect();
        drop(peers);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| MeshError::Io(e.to_string()))?;
        }
        let json = serde_json::to_string_pretty(&entries)
            .map_err(|e| MeshError::Serialization(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| MeshError::Io(e.to_string()))?;
        std::fs::rename(&tmp, path).map_err(|e| MeshError::Io(e.to_string()))?;

        info!(path = %path.display(), peers = entries.len(), "Saved peer cache");
        Ok(())
    }

    /// Load a previously saved cache
    ///
    /// Entries that fail signature verification are skipped; someone may
    /// have edited the file.
    pub fn load(&self, path: &Path) -> MeshResult<()> {
        if !path.exists() {
            return Ok(());
        }
        let text = std::fs::read_to_string(path).map_err(|e| MeshError::Io(e.to_string()))?;
        let entries: Vec<CachedPeer> =
            serde_json::from_str(&text).map_err(|e| MeshError::Serialization(e.to_string()))?;

        let mut peers = self.peers.lock().expect("peer store lock");
        for cached in entries {
            if cached.announcement.verify().is_err() {
                warn!(peer = %cached.announcement.peer_id.short_id(), "Skipping unverifiable cached announcement");
                continue;
            }
            peers.push(cached.announcement.peer_id.clone(), cached);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use omerta_core::{Identity, ReachabilityPath};

    fn announcement(identity: &Identity, ttl: u64) -> PeerAnnouncement {
        PeerAnnouncement::create(
            identity,
            vec![ReachabilityPath::Direct {
                endpoint: "203.0.113.1:4800".to_string(),
            }],
            vec!["relay".to_string()],
            ttl,
        )
    }

    #[test]
    fn test_insert_get() {
        let store = PeerStore::new(10);
        let identity = Identity::generate();
        store.insert(announcement(&identity, 300));

        let fetched = store.get(&identity.peer_id()).unwrap();
        assert_eq!(fetched.peer_id, identity.peer_id());
    }

    #[test]
    fn test_expired_announcement_evicted_on_get() {
        let store = PeerStore::new(10);
        let identity = Identity::generate();
        store.insert(announcement(&identity, 0));

        // TTL zero: expired the moment it is fetched
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(store.get(&identity.peer_id()).is_none());
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_lru_eviction() {
        let store = PeerStore::new(2);
        let a = Identity::generate();
        let b = Identity::generate();
        let c = Identity::generate();
        store.insert(announcement(&a, 300));
        store.insert(announcement(&b, 300));
        store.insert(announcement(&c, 300));

        assert_eq!(store.len(), 2);
        assert!(store.get(&a.peer_id()).is_none());
        assert!(store.get(&c.peer_id()).is_some());
    }

    #[test]
    fn test_reliability_counters_survive_refresh() {
        let store = PeerStore::new(10);
        let identity = Identity::generate();
        store.insert(announcement(&identity, 300));

        store.record_success(&identity.peer_id());
        store.record_success(&identity.peer_id());
        store.record_failure(&identity.peer_id());

        store.insert(announcement(&identity, 300));
        let score = store.reliability(&identity.peer_id()).unwrap();
        assert!((score - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_capability_search_orders_by_reliability() {
        let store = PeerStore::new(10);
        let good = Identity::generate();
        let bad = Identity::generate();
        store.insert(announcement(&good, 300));
        store.insert(announcement(&bad, 300));

        store.record_success(&good.peer_id());
        store.record_failure(&bad.peer_id());

        let relays = store.peers_with_capability("relay");
        assert_eq!(relays.len(), 2);
        assert_eq!(relays[0].peer_id, good.peer_id());
        assert!(store.peers_with_capability("consumer").is_empty());
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.json");

        let store = PeerStore::new(10);
        let identity = Identity::generate();
        store.insert(announcement(&identity, 300));
        store.record_success(&identity.peer_id());
        store.save(&path).unwrap();

        let restored = PeerStore::new(10);
        restored.load(&path).unwrap();
        assert_eq!(restored.len(), 1);
        assert!(restored.get(&identity.peer_id()).is_some());
        assert_eq!(restored.reliability(&identity.peer_id()), Some(1.0));
    }

    #[test]
    fn test_load_skips_tampered_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.json");

        let store = PeerStore::new(10);
        let identity = Identity::generate();
        store.insert(announcement(&identity, 300));
        store.save(&path).unwrap();

        // Corrupt the stored capability list
        let text = std::fs::read_to_string(&path).unwrap();
        let tampered = text.replace("relay", "rogue");
        std::fs::write(&path, tampered).unwrap();

        let restored = PeerStore::new(10);
        restored.load(&path).unwrap();
        assert_eq!(restored.len(), 0);
    }
}
