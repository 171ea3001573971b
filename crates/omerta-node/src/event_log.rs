//! Append-only event logs
//!
//! One JSON-lines file per event kind under the node's data directory,
//! plus the `peers_seen.json` snapshot, which is rewritten atomically
//! rather than appended. Writes are serialized per file; a lost log line
//! is never allowed to take the node down, so write errors degrade to a
//! tracing warning.

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Filename of the peers-seen snapshot
const PEERS_SEEN_FILENAME: &str = "peers_seen.json";

/// The log files kept under the event-log directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventLogKind {
    PeerDiscovery,
    Connections,
    HolePunch,
    Relay,
    Messages,
    Errors,
    HourlyStats,
}

impl EventLogKind {
    fn filename(&self) -> &'static str {
        match self {
            Self::PeerDiscovery => "peer_discovery.jsonl",
            Self::Connections => "connections.jsonl",
            Self::HolePunch => "hole_punch.jsonl",
            Self::Relay => "relay.jsonl",
            Self::Messages => "messages.jsonl",
            Self::Errors => "errors.jsonl",
            Self::HourlyStats => "hourly_stats.jsonl",
        }
    }
}

/// One peer's entry in the peers-seen snapshot
///
/// Lifetime history, not routing state: a peer stays listed long after
/// its announcements and endpoints have aged out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSeenRecord {
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Verified envelopes received from the peer
    pub messages: u64,
}

impl PeerSeenRecord {
    /// A record for a peer observed right now
    pub fn first_contact() -> Self {
        let now = Utc::now();
        Self {
            first_seen: now,
            last_seen: now,
            messages: 1,
        }
    }

    /// Count one more verified envelope
    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
        self.messages += 1;
    }
}

/// An operator-facing error log entry
#[derive(Debug, Serialize)]
pub struct ErrorEntry<'a> {
    pub timestamp: DateTime<Utc>,
    pub component: &'a str,
    pub operation: &'a str,
    pub error_type: &'a str,
    pub message: String,
}

/// Per-kind append-only JSON-lines logger
pub struct EventLog {
    dir: PathBuf,
    files: Mutex<HashMap<EventLogKind, File>>,
}

impl EventLog {
    /// Create a logger rooted at `dir` (created on first write)
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            files: Mutex::new(HashMap::new()),
        }
    }

    /// Append one entry to a log file
    pub fn append(&self, kind: EventLogKind, entry: &impl Serialize) {
        let line = match serde_json::to_string(entry) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Unloggable event entry");
                return;
            }
        };

        let mut files = self.files.lock().expect("event log lock");
        if !files.contains_key(&kind) {
            if let Err(e) = std::fs::create_dir_all(&self.dir) {
                warn!(error = %e, "Cannot create event log dir");
                return;
            }
            match OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.dir.join(kind.filename()))
            {
                Ok(file) => {
                    files.insert(kind, file);
                }
                Err(e) => {
                    warn!(error = %e, file = kind.filename(), "Cannot open event log");
                    return;
                }
            }
        }

        let file = files.get_mut(&kind).expect("file just inserted");
        if let Err(e) = writeln!(file, "{}", line) {
            warn!(error = %e, file = kind.filename(), "Event log write failed");
        }
    }

    /// Append an error entry in the operator-facing shape
    pub fn error(&self, component: &str, operation: &str, error_type: &str, message: impl Into<String>) {
        self.append(
            EventLogKind::Errors,
            &ErrorEntry {
                timestamp: Utc::now(),
                component,
                operation,
                error_type,
                message: message.into(),
            },
        );
    }

    /// Rewrite the peers-seen snapshot atomically
    ///
    /// Unlike the JSONL logs this is a whole-file snapshot, keyed by peer
    /// id and sorted for stable diffs.
    pub fn write_peers_seen(&self, records: BTreeMap<String, PeerSeenRecord>) {
        let json = match serde_json::to_string_pretty(&records) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "Unwritable peers-seen snapshot");
                return;
            }
        };
        if let Err(e) = std::fs::create_dir_all(&self.dir) {
            warn!(error = %e, "Cannot create event log dir");
            return;
        }
        let path = self.dir.join(PEERS_SEEN_FILENAME);
        let tmp = path.with_extension("json.tmp");
        if let Err(e) = std::fs::write(&tmp, json).and_then(|_| std::fs::rename(&tmp, &path)) {
            warn!(error = %e, "Peers-seen snapshot write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct TestEntry {
        value: u32,
    }

    #[test]
    fn test_append_creates_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path().join("events"));

        log.append(EventLogKind::Messages, &TestEntry { value: 1 });
        log.append(EventLogKind::Messages, &TestEntry { value: 2 });
        log.error("wire", "decrypt", "decrypt_failed", "bad datagram");

        let messages =
            std::fs::read_to_string(dir.path().join("events").join("messages.jsonl")).unwrap();
        let lines: Vec<&str> = messages.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], r#"{"value":1}"#);

        let errors = std::fs::read_to_string(dir.path().join("events").join("errors.jsonl")).unwrap();
        assert_eq!(errors.lines().count(), 1);
        assert!(errors.contains("decrypt_failed"));
    }

    #[test]
    fn test_hourly_stats_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path().join("events"));

        log.append(EventLogKind::HourlyStats, &TestEntry { value: 7 });
        let stats =
            std::fs::read_to_string(dir.path().join("events").join("hourly_stats.jsonl")).unwrap();
        assert_eq!(stats.lines().count(), 1);
    }

    #[test]
    fn test_peers_seen_snapshot_rewrites() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path().join("events"));

        let mut records = BTreeMap::new();
        records.insert("aaaa000011112222".to_string(), PeerSeenRecord::first_contact());
        log.write_peers_seen(records.clone());

        let mut second = PeerSeenRecord::first_contact();
        second.touch();
        records.insert("bbbb000011112222".to_string(), second);
        log.write_peers_seen(records);

        let path = dir.path().join("events").join(PEERS_SEEN_FILENAME);
        let text = std::fs::read_to_string(&path).unwrap();
        let parsed: BTreeMap<String, PeerSeenRecord> = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed["bbbb000011112222"].messages, 2);
        assert!(!dir.path().join("events").join("peers_seen.json.tmp").exists());
    }
}
