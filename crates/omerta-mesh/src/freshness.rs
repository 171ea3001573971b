//! Freshness tracking: recent contacts, path failures, query rate limits
//!
//! Three small caches answer one question cheaply: "is this peer worth
//! trying right now, and how?" Contacts age out; failed paths are
//! remembered locally (never broadcast, so the mesh does not leak topology
//! changes); freshness queries to the mesh are rate limited per peer.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use lru::LruCache;
use tracing::debug;

use omerta_core::{ConnectionType, PathFailure, PeerId, ReachabilityPath, RecentContact};

/// LRU-bounded tracker of recent peer contacts
pub struct RecentContactTracker {
    contacts: Mutex<LruCache<PeerId, RecentContact>>,
    max_age: Duration,
}

impl RecentContactTracker {
    pub fn new(max_contacts: usize, max_age: Duration) -> Self {
        Self {
            contacts: Mutex::new(LruCache::new(
                NonZeroUsize::new(max_contacts.max(1)).expect("capacity floor is 1"),
            )),
            max_age,
        }
    }

    /// Record a fresh contact
    pub fn record_contact(
        &self,
        peer: &PeerId,
        reachability: ReachabilityPath,
        latency_ms: Option<u32>,
        connection_type: ConnectionType,
    ) {
        let contact = RecentContact {
            peer_id: peer.clone(),
            last_seen: Utc::now(),
            reachability,
            latency_ms,
            connection_type,
        };
        self.contacts.lock().expect("contact lock").push(peer.clone(), contact);
    }

    /// Whether we heard from the peer within `max_age`
    pub fn has_recent_contact(&self, peer: &PeerId, max_age: Duration) -> bool {
        let mut contacts = self.contacts.lock().expect("contact lock");
        match contacts.get(peer) {
            Some(contact) => {
                let age = Utc::now().signed_duration_since(contact.last_seen);
                age.to_std().map(|age| age <= max_age).unwrap_or(true)
            }
            None => false,
        }
    }

    /// The contact record, if it is within the tracker's max age
    pub fn get(&self, peer: &PeerId) -> Option<RecentContact> {
        let mut contacts = self.contacts.lock().expect("contact lock");
        let contact = contacts.get(peer)?.clone();
        let age = Utc::now().signed_duration_since(contact.last_seen);
        match age.to_std() {
            Ok(age) if age > self.max_age => {
                contacts.pop(peer);
                None
            }
            _ => Some(contact),
        }
    }

    /// Refresh a peer's last-seen time without changing its path
    pub fn touch(&self, peer: &PeerId) {
        let mut contacts = self.contacts.lock().expect("contact lock");
        if let Some(contact) = contacts.get_mut(peer) {
            contact.last_seen = Utc::now();
        }
    }

    /// Forget every contact that was using a now-failed path
    pub fn remove_contacts_using_path(&self, path: &ReachabilityPath) {
        let mut contacts = self.contacts.lock().expect("contact lock");
        let stale: Vec<PeerId> = contacts
            .iter()
            .filter(|(_, c)| &c.reachability == path)
            .map(|(p, _)| p.clone())
            .collect();
        for peer in stale {
            debug!(peer = %peer.short_id(), "Dropping contact over failed path");
            contacts.pop(&peer);
        }
    }

    /// Drop contacts older than the tracker's max age
    pub fn purge_expired(&self) {
        let mut contacts = self.contacts.lock().expect("contact lock");
        let now = Utc::now();
        let stale: Vec<PeerId> = contacts
            .iter()
            .filter(|(_, c)| {
                now.signed_duration_since(c.last_seen)
                    .to_std()
                    .map(|age| age > self.max_age)
                    .unwrap_or(false)
            })
            .map(|(p, _)| p.clone())
            .collect();
        for peer in stale {
            contacts.pop(&peer);
        }
    }

    /// Number of tracked contacts
    pub fn len(&self) -> usize {
        self.contacts.lock().expect("contact lock").len()
    }

    /// Whether nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Locally remembered path failures with per-path report rate limiting
///
/// Failures are never gossiped; announcing "this path just died" to the
/// whole mesh would hand an observer a live map of topology changes.
pub struct PathFailureReporter {
    report_interval: Duration,
    last_report: DashMap<(PeerId, ReachabilityPath), Instant>,
    failures: DashMap<(PeerId, ReachabilityPath), PathFailure>,
}

impl PathFailureReporter {
    pub fn new(report_interval: Duration) -> Self {
        Self {
            report_interval,
            last_report: DashMap::new(),
            failures: DashMap::new(),
        }
    }

    /// Record a path failure. Returns `false` when an identical report
    /// landed within the rate-limit window.
    pub fn report_failure(
        &self,
        peer: &PeerId,
        path: ReachabilityPath,
        reported_by: Option<PeerId>,
    ) -> bool {
        let key = (peer.clone(), path.clone());
        let now = Instant::now();

        if let Some(last) = self.last_report.get(&key) {
            if now.duration_since(*last) < self.report_interval {
                return false;
            }
        }
        self.last_report.insert(key.clone(), now);
        self.failures.insert(
            key,
            PathFailure {
                peer_id: peer.clone(),
                path,
                failed_at: Utc::now(),
                reported_by,
            },
        );
        true
    }

    /// Whether this exact path is currently marked failed
    pub fn is_path_failed(&self, peer: &PeerId, path: &ReachabilityPath) -> bool {
        self.failures.contains_key(&(peer.clone(), path.clone()))
    }

    /// All recorded failures for a peer
    pub fn failures_for(&self, peer: &PeerId) -> Vec<PathFailure> {
        self.failures
            .iter()
            .filter(|entry| &entry.key().0 == peer)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// A later success clears the failure mark
    pub fn clear_path(&self, peer: &PeerId, path: &ReachabilityPath) {
        let key = (peer.clone(), path.clone());
        self.failures.remove(&key);
        self.last_report.remove(&key);
    }

    /// Drop failure records older than `horizon`
    pub fn purge_older_than(&self, horizon: Duration) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(horizon).unwrap_or_else(|_| chrono::Duration::seconds(0));
        self.failures.retain(|_, failure| failure.failed_at > cutoff);
    }
}

/// Per-peer rate limiter for `who_has_recent` queries
pub struct FreshnessQueryTracker {
    query_interval: Duration,
    last_query: DashMap<PeerId, Instant>,
}

impl FreshnessQueryTracker {
    pub fn new(query_interval: Duration) -> Self {
        Self {
            query_interval,
            last_query: DashMap::new(),
        }
    }

    /// Reserve a query slot for `peer`. Returns `false` when a query went
    /// out within the interval.
    pub fn try_begin_query(&self, peer: &PeerId) -> bool {
        let now = Instant::now();
        match self.last_query.entry(peer.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if now.duration_since(*entry.get()) < self.query_interval {
                    false
                } else {
                    entry.insert(now);
                    true
                }
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(now);
                true
            }
        }
    }
}
