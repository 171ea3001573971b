//! Per-(peer, machine) endpoint tracking
//!
//! For every machine we have heard from, an ordered list of endpoint
//! strings: most recently confirmed first. Receiving from or successfully
//! sending to an endpoint promotes it; the list never holds duplicates and
//! is capped. State is scoped to one network and persisted as JSON keyed
//! by the network id, so records from another network are never mixed in.

use std::collections::BTreeMap;
use std::ops::Range;
use std::path::Path;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use omerta_core::{
    validate_endpoint, EndpointValidationMode, MachineId, NatType, PeerId,
};

use crate::error::{MeshError, MeshResult};

/// Cap on stored endpoints per machine
pub const MAX_ENDPOINTS_PER_MACHINE: usize = 1_000;

/// Everything known about one machine's endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineRecord {
    /// Most recently confirmed endpoint first
    pub endpoints: Vec<String>,
    pub nat_type: Option<NatType>,
    pub last_seen: DateTime<Utc>,
}

impl MachineRecord {
    fn new() -> Self {
        Self {
            endpoints: Vec::new(),
            nat_type: None,
            last_seen: Utc::now(),
        }
    }

    /// Move `endpoint` to the front, deduplicating, respecting the cap
    fn promote(&mut self, endpoint: &str) {
        self.endpoints.retain(|e| e != endpoint);
        self.endpoints.insert(0, endpoint.to_string());
        self.endpoints.truncate(MAX_ENDPOINTS_PER_MACHINE);
        self.last_seen = Utc::now();
    }
}

/// Endpoint lists for all (peer, machine) pairs on one network
pub struct EndpointManager {
    network_id: String,
    validation: EndpointValidationMode,
    machines: DashMap<(PeerId, MachineId), MachineRecord>,
}

impl EndpointManager {
    /// Create an empty manager for a network
    pub fn new(network_id: impl Into<String>, validation: EndpointValidationMode) -> Self {
        Self {
            network_id: network_id.into(),
            validation,
            machines: DashMap::new(),
        }
    }

    /// Record the source endpoint of a verified inbound message
    ///
    /// The endpoint is validated against the configured policy first; a
    /// rejected endpoint leaves the record untouched.
    pub fn record_message_received(
        &self,
        peer: &PeerId,
        machine: MachineId,
        endpoint: &str,
    ) -> MeshResult<()> {
        validate_endpoint(self.validation, endpoint)?;
        self.machines
            .entry((peer.clone(), machine))
            .or_insert_with(MachineRecord::new)
            .promote(endpoint);
        debug!(peer = %peer.short_id(), %machine, endpoint, "Recorded inbound endpoint");
        Ok(())
    }

    /// Promote an endpoint after a confirmed successful send
    pub fn record_send_success(&self, peer: &PeerId, machine: MachineId, endpoint: &str) {
        self.machines
            .entry((peer.clone(), machine))
            .or_insert_with(MachineRecord::new)
            .promote(endpoint);
    }

    /// Ordered endpoints for one machine
    pub fn get_endpoints(&self, peer: &PeerId, machine: MachineId) -> Vec<String> {
        self.machines
            .get(&(peer.clone(), machine))
            .map(|r| r.endpoints.clone())
            .unwrap_or_default()
    }

    /// The machine's current best (front) endpoint
    pub fn get_best_endpoint(&self, peer: &PeerId, machine: MachineId) -> Option<String> {
        self.machines
            .get(&(peer.clone(), machine))
            .and_then(|r| r.endpoints.first().cloned())
    }

    /// All endpoints for a peer across its machines, most recently seen
    /// machine first, deduplicated
    pub fn get_all_endpoints(&self, peer: &PeerId) -> Vec<String> {
        let mut records: Vec<MachineRecord> = self
            .machines
            .iter()
            .filter(|entry| &entry.key().0 == peer)
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));

        let mut seen = std::collections::HashSet::new();
        let mut endpoints = Vec::new();
        for record in records {
            for endpoint in record.endpoints {
                if seen.insert(endpoint.clone()) {
                    endpoints.push(endpoint);
                }
            }
        }
        endpoints
    }

    /// Machines known for a peer, most recently seen first
    pub fn machines_for_peer(&self, peer: &PeerId) -> Vec<MachineId> {
        let mut machines: Vec<(MachineId, DateTime<Utc>)> = self
            .machines
            .iter()
            .filter(|entry| &entry.key().0 == peer)
            .map(|entry| (entry.key().1, entry.value().last_seen))
            .collect();
        machines.sort_by(|a, b| b.1.cmp(&a.1));
        machines.into_iter().map(|(m, _)| m).collect()
    }

    /// Set the inferred NAT type on every machine of a peer
    pub fn update_nat_type(&self, peer: &PeerId, nat_type: NatType) {
        for mut entry in self.machines.iter_mut() {
            if &entry.key().0 == peer {
                entry.value_mut().nat_type = Some(nat_type);
            }
        }
    }

    /// The peer's NAT type, from its most recently seen machine
    pub fn get_nat_type(&self, peer: &PeerId) -> Option<NatType> {
        self.machines
            .iter()
            .filter(|entry| &entry.key().0 == peer)
            .max_by_key(|entry| entry.value().last_seen)
            .and_then(|entry| entry.value().nat_type)
    }

    /// Number of tracked (peer, machine) pairs
    pub fn machine_count(&self) -> usize {
        self.machines.len()
    }

    /// All tracked (peer, machine) pairs
    pub fn all_machines(&self) -> Vec<(PeerId, MachineId)> {
        self.machines.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Persist to `peer_endpoints.json` with an atomic rewrite
    pub fn save(&self, path: &Path) -> MeshResult<()> {
        let mut machines = BTreeMap::new();
        for entry in self.machines.iter() {
            let (peer, machine) = entry.key();
            machines.insert(
                format!("{}:{}", peer, machine),
                PersistedMachine {
                    endpoints: entry.value().endpoints.clone(),
                    nat_type: entry.value().nat_type,
                },
            );
        }
        let persisted = PersistedEndpoints {
            network_id: self.network_id.clone(),
            machines,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| MeshError::Io(e.to_string()))?;
        }
        let json = serde_json::to_string_pretty(&persisted)
            .map_err(|e| MeshError::Serialization(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| MeshError::Io(e.to_string()))?;
        std::fs::rename(&tmp, path).map_err(|e| MeshError::Io(e.to_string()))?;

        info!(path = %path.display(), machines = self.machines.len(), "Saved endpoint state");
        Ok(())
    }

    /// Load previously persisted state
    ///
    /// A file written for a different network is ignored wholesale.
    pub fn load(&self, path: &Path) -> MeshResult<()> {
        if !path.exists() {
            return Ok(());
        }
        let text = std::fs::read_to_string(path).map_err(|e| MeshError::Io(e.to_string()))?;
        let persisted: PersistedEndpoints =
            serde_json::from_str(&text).map_err(|e| MeshError::Serialization(e.to_string()))?;

        if persisted.network_id != self.network_id {
            warn!(
                expected = %self.network_id,
                actual = %persisted.network_id,
                "Ignoring endpoint state from another network"
            );
            return Ok(());
        }

        for (key, record) in persisted.machines {
            let Some((peer_str, machine_str)) = key.split_once(':') else {
                warn!(key, "Skipping malformed endpoint record key");
                continue;
            };
            let (Ok(peer), Ok(machine)) = (PeerId::parse(peer_str), MachineId::parse(machine_str))
            else {
                warn!(key, "Skipping endpoint record with bad ids");
                continue;
            };
            self.machines.insert(
                (peer, machine),
                MachineRecord {
                    endpoints: record.endpoints,
                    nat_type: record.nat_type,
                    last_seen: Utc::now(),
                },
            );
        }
        Ok(())
    }
}

/// On-disk shape of the endpoint state
#[derive(Serialize, Deserialize)]
struct PersistedEndpoints {
    network_id: String,
    machines: BTreeMap<String, PersistedMachine>,
}

#[derive(Serialize, Deserialize)]
struct PersistedMachine {
    endpoints: Vec<String>,
    nat_type: Option<NatType>,
}

/// Attempt windows for the sliding-window retry
///
/// With `n` endpoints and a retry budget, produces index ranges so that
/// every endpoint is attempted exactly `min(budget, n)` times and fresh
/// endpoints are attempted first: the window expands from the front of the
/// list, slides across it, then contracts at the tail.
pub fn sliding_windows(n: usize, budget: usize) -> Vec<Range<usize>> {
    if n == 0 || budget == 0 {
        return Vec::new();
    }
    let width = budget.min(n);
    let mut rounds = Vec::new();
    for k in 1..=width {
        rounds.push(0..k);
    }
    for start in 1..=(n - width) {
        rounds.push(start..start + width);
    }
    for start in (n - width + 1)..n {
        rounds.push(start..n);
    }
    rounds
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> EndpointManager {
        EndpointManager::new("net-1", EndpointValidationMode::AllowAll)
    }

    fn peer() -> PeerId {
        PeerId::from_public_key_bytes(&rand::random::<[u8; 32]>())
    }

    #[test]
    fn test_receive_promotes_and_dedups() {
        let mgr = manager();
        let p = peer();
        let m = MachineId::generate();

        mgr.record_message_received(&p, m, "203.0.113.1:1000").unwrap();
        mgr.record_message_received(&p, m, "203.0.113.2:2000").unwrap();
        mgr.record_message_received(&p, m, "203.0.113.1:1000").unwrap();

        let endpoints = mgr.get_endpoints(&p, m);
        assert_eq!(endpoints, vec!["203.0.113.1:1000", "203.0.113.2:2000"]);
        assert_eq!(mgr.get_best_endpoint(&p, m).unwrap(), "203.0.113.1:1000");
    }

    #[test]
    fn test_no_duplicates_ever() {
        let mgr = manager();
        let p = peer();
        let m = MachineId::generate();

        for i in 0..50 {
            let endpoint = format!("203.0.113.{}:1000", i % 5);
            mgr.record_message_received(&p, m, &endpoint).unwrap();
        }
        let endpoints = mgr.get_endpoints(&p, m);
        let unique: std::collections::HashSet<_> = endpoints.iter().collect();
        assert_eq!(unique.len(), endpoints.len());
        assert_eq!(endpoints.len(), 5);
    }

    #[test]
    fn test_endpoint_cap() {
        let mgr = manager();
        let p = peer();
        let m = MachineId::generate();

        for i in 0..(MAX_ENDPOINTS_PER_MACHINE + 50) {
            let endpoint = format!("203.0.113.{}:{}", i % 200 + 1, i % 60_000 + 1);
            mgr.record_message_received(&p, m, &endpoint).unwrap();
        }
        assert!(mgr.get_endpoints(&p, m).len() <= MAX_ENDPOINTS_PER_MACHINE);
    }

    #[test]
    fn test_validation_policy_applies() {
        let strict = EndpointManager::new("net-1", EndpointValidationMode::Strict);
        let p = peer();
        let m = MachineId::generate();

        assert!(strict.record_message_received(&p, m, "127.0.0.1:9000").is_err());
        assert!(strict.record_message_received(&p, m, "10.0.0.1:9000").is_err());
        assert!(strict.record_message_received(&p, m, "203.0.113.1:9000").is_ok());
        assert_eq!(strict.get_endpoints(&p, m).len(), 1);
    }

    #[test]
    fn test_send_success_promotes() {
        let mgr = manager();
        let p = peer();
        let m = MachineId::generate();

        mgr.record_message_received(&p, m, "203.0.113.1:1000").unwrap();
        mgr.record_message_received(&p, m, "203.0.113.2:2000").unwrap();
        assert_eq!(mgr.get_best_endpoint(&p, m).unwrap(), "203.0.113.2:2000");

        mgr.record_send_success(&p, m, "203.0.113.1:1000");
        assert_eq!(mgr.get_best_endpoint(&p, m).unwrap(), "203.0.113.1:1000");
    }

    #[test]
    fn test_all_endpoints_across_machines() {
        let mgr = manager();
        let p = peer();
        let m1 = MachineId::generate();
        let m2 = MachineId::generate();

        mgr.record_message_received(&p, m1, "203.0.113.1:1000").unwrap();
        mgr.record_message_received(&p, m2, "203.0.113.2:2000").unwrap();
        mgr.record_message_received(&p, m2, "203.0.113.1:1000").unwrap();

        let all = mgr.get_all_endpoints(&p);
        assert_eq!(all.len(), 2);
        // m2 was seen last, so its endpoints lead
        assert_eq!(all[0], "203.0.113.1:1000");
    }

    #[test]
    fn test_nat_type_tracking() {
        let mgr = manager();
        let p = peer();
        let m = MachineId::generate();

        assert!(mgr.get_nat_type(&p).is_none());
        mgr.record_message_received(&p, m, "203.0.113.1:1000").unwrap();
        mgr.update_nat_type(&p, NatType::Symmetric);
        assert_eq!(mgr.get_nat_type(&p), Some(NatType::Symmetric));
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peer_endpoints.json");

        let mgr = manager();
        let p = peer();
        let m = MachineId::generate();
        mgr.record_message_received(&p, m, "203.0.113.1:1000").unwrap();
        mgr.record_message_received(&p, m, "203.0.113.2:2000").unwrap();
        mgr.update_nat_type(&p, NatType::PortRestrictedCone);
        mgr.save(&path).unwrap();

        let restored = manager();
        restored.load(&path).unwrap();
        assert_eq!(
            restored.get_endpoints(&p, m),
            vec!["203.0.113.2:2000", "203.0.113.1:1000"]
        );
        assert_eq!(restored.get_nat_type(&p), Some(NatType::PortRestrictedCone));
    }

    #[test]
    fn test_load_ignores_other_network() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peer_endpoints.json");

        let mgr = manager();
        let p = peer();
        mgr.record_message_received(&p, MachineId::generate(), "203.0.113.1:1000")
            .unwrap();
        mgr.save(&path).unwrap();

        let other = EndpointManager::new("net-2", EndpointValidationMode::AllowAll);
        other.load(&path).unwrap();
        assert_eq!(other.machine_count(), 0);
    }

    #[test]
    fn test_sliding_windows_cover_each_index_budget_times() {
        for n in 1..=8 {
            for budget in 1..=6 {
                let windows = sliding_windows(n, budget);
                let expected = budget.min(n);
                for i in 0..n {
                    let hits = windows.iter().filter(|w| w.contains(&i)).count();
                    assert_eq!(hits, expected, "n={} budget={} index={}", n, budget, i);
                }
            }
        }
    }

    #[test]
    fn test_sliding_windows_shape() {
        // Expansion, slide, contraction
        assert_eq!(sliding_windows(3, 2), vec![0..1, 0..2, 1..3, 2..3]);
        assert_eq!(sliding_windows(1, 5), vec![0..1]);
        assert!(sliding_windows(0, 3).is_empty());
        assert!(sliding_windows(3, 0).is_empty());
    }

    #[test]
    fn test_sliding_windows_fresh_first() {
        // The first round only tries the freshest endpoint
        let windows = sliding_windows(5, 3);
        assert_eq!(windows[0], 0..1);
    }
}
