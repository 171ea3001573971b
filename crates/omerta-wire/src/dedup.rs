//! Message deduplication
//!
//! Message ids are remembered for a TTL window; a duplicate inside the
//! window is dropped before it can re-run side effects, regardless of how
//! the datagram arrived (direct, relayed, or both).

use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Default remember window for message ids
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(300);

/// TTL-windowed set of seen message ids
pub struct MessageDeduplicator {
    seen: DashMap<String, Instant>,
    ttl: Duration,
}

impl MessageDeduplicator {
    /// Create a deduplicator with the given remember window
    pub fn new(ttl: Duration) -> Self {
        Self {
            seen: DashMap::new(),
            ttl,
        }
    }

    /// Record a message id. Returns `true` if it is fresh, `false` if it
    /// was already seen within the window.
    pub fn observe(&self, message_id: &str) -> bool {
        let now = Instant::now();
        match self.seen.entry(message_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if now.duration_since(*entry.get()) > self.ttl {
                    entry.insert(now);
                    true
                } else {
                    false
                }
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(now);
                true
            }
        }
    }

    /// Drop ids older than the window
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.seen
            .retain(|_, seen_at| now.duration_since(*seen_at) <= self.ttl);
    }

    /// Number of remembered ids
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether nothing is remembered
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl Default for MessageDeduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_suppressed() {
        let dedup = MessageDeduplicator::default();
        assert!(dedup.observe("msg-1"));
        assert!(!dedup.observe("msg-1"));
        assert!(dedup.observe("msg-2"));
        assert_eq!(dedup.len(), 2);
    }

    #[test]
    fn test_expired_id_is_fresh_again() {
        let dedup = MessageDeduplicator::new(Duration::ZERO);
        assert!(dedup.observe("msg-1"));
        // TTL of zero: the previous sighting is immediately stale
        assert!(dedup.observe("msg-1"));
    }

    #[test]
    fn test_purge_expired() {
        let dedup = MessageDeduplicator::new(Duration::ZERO);
        dedup.observe("a");
        dedup.observe("b");
        dedup.purge_expired();
        assert!(dedup.is_empty());
    }
}
