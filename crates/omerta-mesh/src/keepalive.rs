//! Keepalive scheduling with a weighted ping budget
//!
//! Each cycle samples up to a fixed number of monitored machines, weighted
//! toward those pinged successfully most recently. The budget bounds total
//! keepalive traffic regardless of fleet size while still touching stale
//! machines often enough to keep NAT bindings warm and notice dead paths.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use rand::Rng;
use tracing::debug;

use omerta_core::{KeepaliveConfig, MachineId, PeerId};

/// Result of recording a ping attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingOutcome {
    /// The machine is alive, or not yet past the missed threshold
    Healthy,
    /// The missed threshold was crossed; monitoring has stopped and the
    /// caller should fire its failure handler
    Failed,
}

#[derive(Debug, Clone)]
struct MonitoredMachine {
    last_successful_ping: Instant,
    missed_pings: u32,
}

/// Weighted-sampling keepalive scheduler
pub struct KeepaliveScheduler {
    config: KeepaliveConfig,
    monitored: Mutex<HashMap<(PeerId, MachineId), MonitoredMachine>>,
}

impl KeepaliveScheduler {
    pub fn new(config: KeepaliveConfig) -> Self {
        Self {
            config,
            monitored: Mutex::new(HashMap::new()),
        }
    }

    /// Start monitoring a machine; a no-op if already monitored
    pub fn monitor(&self, peer: &PeerId, machine: MachineId) {
        self.monitored
            .lock()
            .expect("keepalive lock")
            .entry((peer.clone(), machine))
            .or_insert_with(|| MonitoredMachine {
                last_successful_ping: Instant::now(),
                missed_pings: 0,
            });
    }

    /// Stop monitoring a machine
    pub fn unmonitor(&self, peer: &PeerId, machine: MachineId) {
        self.monitored
            .lock()
            .expect("keepalive lock")
            .remove(&(peer.clone(), machine));
    }

    /// Number of monitored machines
    pub fn monitored_count(&self) -> usize {
        self.monitored.lock().expect("keepalive lock").len()
    }

    /// Any inbound message proves the machine alive
    pub fn record_successful_communication(&self, peer: &PeerId, machine: MachineId) {
        let mut monitored = self.monitored.lock().expect("keepalive lock");
        if let Some(entry) = monitored.get_mut(&(peer.clone(), machine)) {
            entry.last_successful_ping = Instant::now();
            entry.missed_pings = 0;
        }
    }

    /// Recency weight for a machine last confirmed `age_secs` ago
    fn weight(&self, age_secs: f64) -> f64 {
        let half_life = self.config.half_life_secs.max(1) as f64;
        let decayed = 0.5f64.powf(age_secs / half_life);
        decayed.max(self.config.min_weight)
    }

    /// Weighted-sample this cycle's ping targets, without replacement
    pub fn select_targets(&self) -> Vec<(PeerId, MachineId)> {
        let monitored = self.monitored.lock().expect("keepalive lock");
        let now = Instant::now();
        let mut candidates: Vec<((PeerId, MachineId), f64)> = monitored
            .iter()
            .map(|(key, machine)| {
                let age = now.duration_since(machine.last_successful_ping).as_secs_f64();
                (key.clone(), self.weight(age))
            })
            .collect();
        drop(monitored);

        let budget = self.config.max_machines_per_cycle;
        let mut rng = rand::rng();
        let mut selected = Vec::with_capacity(budget.min(candidates.len()));

        while selected.len() < budget && !candidates.is_empty() {
            let total: f64 = candidates.iter().map(|(_, w)| w).sum();
            if total <= 0.0 {
                selected.push(candidates.swap_remove(0).0);
                continue;
            }
            let mut target = rng.random_range(0.0..total);
            let mut picked = candidates.len() - 1;
            for (i, (_, weight)) in candidates.iter().enumerate() {
                if target < *weight {
                    picked = i;
                    break;
                }
                target -= weight;
            }
            selected.push(candidates.swap_remove(picked).0);
        }
        selected
    }

    /// Record the outcome of a ping attempt
    ///
    /// Crossing the missed threshold removes the machine from monitoring
    /// and returns [`PingOutcome::Failed`]; the caller owns the failure
    /// side effects (events, path-failure records).
    pub fn record_ping_result(&self, peer: &PeerId, machine: MachineId, success: bool) -> PingOutcome {
        let mut monitored = self.monitored.lock().expect("keepalive lock");
        let key = (peer.clone(), machine);
        let Some(entry) = monitored.get_mut(&key) else {
            return PingOutcome::Healthy;
        };

        if success {
            entry.last_successful_ping = Instant::now();
            entry.missed_pings = 0;
            return PingOutcome::Healthy;
        }

        entry.missed_pings += 1;
        debug!(
            peer = %peer.short_id(),
            missed = entry.missed_pings,
            threshold = self.config.missed_threshold,
            "Keepalive ping missed"
        );
        if entry.missed_pings >= self.config.missed_threshold {
            monitored.remove(&key);
            return PingOutcome::Failed;
        }
        PingOutcome::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> PeerId {
        PeerId::from_public_key_bytes(&rand::random::<[u8; 32]>())
    }

    fn scheduler() -> KeepaliveScheduler {
        KeepaliveScheduler::new(KeepaliveConfig::default())
    }

    #[test]
    fn test_weight_decay() {
        let s = scheduler();
        let full = s.weight(0.0);
        let half = s.weight(300.0);
        let floor = s.weight(1_000_000.0);

        assert!((full - 1.0).abs() < 1e-9);
        assert!((half - 0.5).abs() < 1e-9);
        assert!((floor - 0.05).abs() < 1e-9);
    }

    #[test]
    fn test_select_respects_budget() {
        let s = scheduler();
        for _ in 0..50 {
            s.monitor(&peer(), MachineId::generate());
        }

        let targets = s.select_targets();
        assert_eq!(targets.len(), 10);

        // Without replacement: all distinct
        let unique: std::collections::HashSet<_> = targets.iter().collect();
        assert_eq!(unique.len(), targets.len());
    }

    #[test]
    fn test_select_with_few_machines() {
        let s = scheduler();
        let p = peer();
        let m = MachineId::generate();
        s.monitor(&p, m);

        assert_eq!(s.select_targets(), vec![(p, m)]);
        assert!(scheduler().select_targets().is_empty());
    }

    #[test]
    fn test_missed_threshold_fires_once() {
        let s = scheduler();
        let p = peer();
        let m = MachineId::generate();
        s.monitor(&p, m);

        assert_eq!(s.record_ping_result(&p, m, false), PingOutcome::Healthy);
        assert_eq!(s.record_ping_result(&p, m, false), PingOutcome::Healthy);
        assert_eq!(s.record_ping_result(&p, m, false), PingOutcome::Failed);

        // Monitoring stopped: further failures are inert
        assert_eq!(s.monitored_count(), 0);
        assert_eq!(s.record_ping_result(&p, m, false), PingOutcome::Healthy);
    }

    #[test]
    fn test_success_resets_missed_count() {
        let s = scheduler();
        let p = peer();
        let m = MachineId::generate();
        s.monitor(&p, m);

        s.record_ping_result(&p, m, false);
        s.record_ping_result(&p, m, false);
        s.record_ping_result(&p, m, true);
        s.record_ping_result(&p, m, false);
        s.record_ping_result(&p, m, false);
        assert_eq!(s.monitored_count(), 1);
    }

    #[test]
    fn test_inbound_message_resets_missed_count() {
        let s = scheduler();
        let p = peer();
        let m = MachineId::generate();
        s.monitor(&p, m);

        s.record_ping_result(&p, m, false);
        s.record_ping_result(&p, m, false);
        s.record_successful_communication(&p, m);
        assert_eq!(s.record_ping_result(&p, m, false), PingOutcome::Healthy);
    }

    #[test]
    fn test_monitor_is_idempotent() {
        let s = scheduler();
        let p = peer();
        let m = MachineId::generate();
        s.monitor(&p, m);
        s.record_ping_result(&p, m, false);
        s.monitor(&p, m);

        // Re-monitoring must not reset the missed count
        s.record_ping_result(&p, m, false);
        assert_eq!(s.record_ping_result(&p, m, false), PingOutcome::Failed);
    }
}
