//! NAT inference from peer observations
//!
//! Every pong tells us how the remote side saw our endpoint. If everyone
//! agrees on one `ip:port`, our NAT keeps a stable mapping (or we are
//! simply public). If reporters disagree, the NAT assigns a fresh mapping
//! per destination: symmetric, the kind that breaks hole punching.
//!
//! STUN is deliberately absent; observations from real traffic are both
//! free and harder to spoof in aggregate.

use std::collections::HashSet;
use std::sync::Mutex;

use dashmap::DashMap;
use tracing::debug;

use omerta_core::{NatType, PeerId};

/// Minimum distinct reporters before a verdict
pub const DEFAULT_MIN_OBSERVATIONS: usize = 2;

/// Outcome of NAT inference
#[derive(Debug, Clone, PartialEq)]
pub struct NatPrediction {
    pub nat_type: NatType,
    /// Number of distinct reporters behind the verdict
    pub confidence: usize,
    /// Our stable external endpoint, when one exists
    pub public_endpoint: Option<String>,
}

/// Infers our own NAT type from `pong.your_endpoint` observations
pub struct NatPredictor {
    min_observations: usize,
    /// Latest observation per reporting peer
    observations: DashMap<PeerId, String>,
    /// Endpoints of our local interfaces, for distinguishing `public`
    local_endpoints: Mutex<Vec<String>>,
}

impl NatPredictor {
    pub fn new(min_observations: usize) -> Self {
        Self {
            min_observations: min_observations.max(1),
            observations: DashMap::new(),
            local_endpoints: Mutex::new(Vec::new()),
        }
    }

    /// Tell the predictor what our local sockets look like
    pub fn set_local_endpoints(&self, endpoints: Vec<String>) {
        *self.local_endpoints.lock().expect("local endpoints lock") = endpoints;
    }

    /// Record how `reporter` saw our endpoint; newest report wins
    pub fn record_observation(&self, reporter: &PeerId, endpoint: &str) {
        debug!(reporter = %reporter.short_id(), endpoint, "NAT observation");
        self.observations.insert(reporter.clone(), endpoint.to_string());
    }

    /// Distinct reporters seen so far
    pub fn observation_count(&self) -> usize {
        self.observations.len()
    }

    /// Current verdict
    pub fn predict(&self) -> NatPrediction {
        let observed: Vec<String> = self.observations.iter().map(|e| e.value().clone()).collect();
        let confidence = observed.len();

        if confidence < self.min_observations {
            return NatPrediction {
                nat_type: NatType::Unknown,
                confidence,
                public_endpoint: None,
            };
        }

        let distinct: HashSet<&String> = observed.iter().collect();
        if distinct.len() == 1 {
            let endpoint = observed[0].clone();
            let is_local = self
                .local_endpoints
                .lock()
                .expect("local endpoints lock")
                .contains(&endpoint);

            let nat_type = if is_local {
                NatType::Public
            } else {
                // Stable mapping behind NAT: assume the common case
                NatType::PortRestrictedCone
            };
            NatPrediction {
                nat_type,
                confidence,
                public_endpoint: Some(endpoint),
            }
        } else {
            NatPrediction {
                nat_type: NatType::Symmetric,
                confidence,
                public_endpoint: None,
            }
        }
    }

    /// Forget all observations
    pub fn reset(&self) {
        self.observations.clear();
    }
}

impl Default for NatPredictor {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_OBSERVATIONS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> PeerId {
        PeerId::from_public_key_bytes(&rand::random::<[u8; 32]>())
    }

    #[test]
    fn test_too_few_reporters_is_unknown() {
        let predictor = NatPredictor::default();
        assert_eq!(predictor.predict().nat_type, NatType::Unknown);

        predictor.record_observation(&peer(), "1.2.3.4:5000");
        let prediction = predictor.predict();
        assert_eq!(prediction.nat_type, NatType::Unknown);
        assert_eq!(prediction.confidence, 1);
    }

    #[test]
    fn test_agreeing_reporters_mean_stable_mapping() {
        let predictor = NatPredictor::default();
        predictor.record_observation(&peer(), "1.2.3.4:5000");
        predictor.record_observation(&peer(), "1.2.3.4:5000");

        let prediction = predictor.predict();
        assert_eq!(prediction.nat_type, NatType::PortRestrictedCone);
        assert_eq!(prediction.confidence, 2);
        assert_eq!(prediction.public_endpoint.as_deref(), Some("1.2.3.4:5000"));
    }

    #[test]
    fn test_local_match_means_public() {
        let predictor = NatPredictor::default();
        predictor.set_local_endpoints(vec!["1.2.3.4:5000".to_string()]);
        predictor.record_observation(&peer(), "1.2.3.4:5000");
        predictor.record_observation(&peer(), "1.2.3.4:5000");

        assert_eq!(predictor.predict().nat_type, NatType::Public);
    }

    #[test]
    fn test_disagreeing_ports_mean_symmetric() {
        let predictor = NatPredictor::default();
        let reporter2 = peer();
        predictor.record_observation(&peer(), "1.2.3.4:5000");
        predictor.record_observation(&reporter2, "1.2.3.4:5000");
        assert_eq!(predictor.predict().nat_type, NatType::PortRestrictedCone);

        // The second reporter's newer observation replaces its old one
        predictor.record_observation(&reporter2, "1.2.3.4:5001");
        let prediction = predictor.predict();
        assert_eq!(prediction.nat_type, NatType::Symmetric);
        assert_eq!(prediction.public_endpoint, None);
    }

    #[test]
    fn test_disagreeing_hosts_mean_symmetric() {
        let predictor = NatPredictor::default();
        predictor.record_observation(&peer(), "1.2.3.4:5000");
        predictor.record_observation(&peer(), "5.6.7.8:5000");
        assert_eq!(predictor.predict().nat_type, NatType::Symmetric);
    }

    #[test]
    fn test_latest_observation_per_reporter_wins() {
        let predictor = NatPredictor::default();
        let reporter = peer();
        predictor.record_observation(&reporter, "1.2.3.4:5000");
        predictor.record_observation(&reporter, "1.2.3.4:6000");
        assert_eq!(predictor.observation_count(), 1);
    }

    #[test]
    fn test_reset() {
        let predictor = NatPredictor::default();
        predictor.record_observation(&peer(), "1.2.3.4:5000");
        predictor.record_observation(&peer(), "1.2.3.4:5000");
        predictor.reset();
        assert_eq!(predictor.observation_count(), 0);
        assert_eq!(predictor.predict().nat_type, NatType::Unknown);
    }
}
