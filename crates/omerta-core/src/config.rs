//! Node and subsystem configuration
//!
//! Plain structs with `Default` impls and `with_*` builders. Sub-configs
//! live here (rather than in their owning crates) so the top-level
//! [`MeshConfig`] can carry them without dependency cycles.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::endpoint::EndpointValidationMode;
use crate::error::{CoreError, CoreResult};
use crate::network::NetworkKey;
use crate::retry::RetryConfig;

/// Keepalive scheduler tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepaliveConfig {
    /// Seconds between keepalive cycles
    pub interval_secs: u64,
    /// Half-life of the recency weight, in seconds
    pub half_life_secs: u64,
    /// Weight floor so stale machines are still occasionally probed
    pub min_weight: f64,
    /// Ping budget per cycle
    pub max_machines_per_cycle: usize,
    /// Consecutive missed pings before a machine is declared dead
    pub missed_threshold: u32,
    /// How long to wait for a pong, in milliseconds
    pub ping_timeout_ms: u64,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval_secs: 15,
            half_life_secs: 300,
            min_weight: 0.05,
            max_machines_per_cycle: 10,
            missed_threshold: 3,
            ping_timeout_ms: 5_000,
        }
    }
}

/// Gossip propagation tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipConfig {
    /// How many peers each newly learned fact is propagated to
    pub fanout: u32,
    /// Seconds between gossip cycles
    pub interval_secs: u64,
    /// Hop budget for forwarded queries
    pub max_hops: u8,
    /// Upper bound on the peer list inside one message
    pub max_per_message: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            fanout: 5,
            interval_secs: 30,
            max_hops: 3,
            max_per_message: 10,
        }
    }
}

/// Freshness tracking tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreshnessConfig {
    /// Maximum age of a cached contact, in seconds
    pub max_age_secs: u64,
    /// LRU bound on tracked contacts
    pub max_contacts: usize,
    /// Hop budget for `who_has_recent` queries
    pub query_max_hops: u8,
    /// Per-peer floor between freshness queries, in seconds
    pub query_interval_secs: u64,
    /// Per-(peer, path) floor between failure reports, in seconds
    pub report_interval_secs: u64,
}

impl Default for FreshnessConfig {
    fn default() -> Self {
        Self {
            max_age_secs: 300,
            max_contacts: 500,
            query_max_hops: 3,
            query_interval_secs: 30,
            report_interval_secs: 60,
        }
    }
}

/// Hole-punch coordinator tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Seconds to wait for the target to accept an invite
    pub invite_timeout_secs: u64,
    /// Seconds before an unfinished request expires
    pub request_timeout_secs: u64,
    /// Concurrent request cap
    pub max_concurrent: usize,
    /// Seconds between expiry sweeps
    pub cleanup_interval_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            invite_timeout_secs: 10,
            request_timeout_secs: 30,
            max_concurrent: 50,
            cleanup_interval_secs: 10,
        }
    }
}

/// UDP probe exchange tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PunchConfig {
    /// Probes sent per attempt
    pub probe_count: u32,
    /// Milliseconds between probes
    pub probe_interval_ms: u64,
    /// Confirmation probes sent after success
    pub response_probe_count: u32,
    /// Seconds before the attempt times out
    pub timeout_secs: u64,
}

impl Default for PunchConfig {
    fn default() -> Self {
        Self {
            probe_count: 5,
            probe_interval_ms: 200,
            response_probe_count: 3,
            timeout_secs: 10,
        }
    }
}

/// Top-level node configuration
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// The network to join; carries the required 32-byte envelope key
    pub network: NetworkKey,
    /// UDP port to bind (0 = ephemeral)
    pub port: u16,
    /// Extra bootstrap endpoints, merged with the network key's own list
    pub bootstrap_peers: Vec<String>,
    /// Whether this node forwards for symmetric peers
    pub can_relay: bool,
    /// Whether this node coordinates hole punches
    pub can_coordinate_hole_punch: bool,
    /// How many relays to keep warm
    pub target_relays: usize,
    /// Cap on the potential-relay table per peer
    pub max_relays: usize,
    pub keepalive: KeepaliveConfig,
    /// Seconds to wait for a response in request/response exchanges
    pub connection_timeout_secs: u64,
    pub endpoint_validation: EndpointValidationMode,
    /// LRU bound on the announcement cache
    pub max_cached_peers: usize,
    pub retry: RetryConfig,
    pub coordinator: CoordinatorConfig,
    pub gossip: GossipConfig,
    pub freshness: FreshnessConfig,
    pub punch: PunchConfig,
    /// Directory for persisted stores and event logs (`None` = in-memory only)
    pub data_dir: Option<PathBuf>,
}

impl MeshConfig {
    /// Create a configuration for the given network with defaults
    pub fn new(network: NetworkKey) -> Self {
        Self {
            network,
            port: 0,
            bootstrap_peers: Vec::new(),
            can_relay: false,
            can_coordinate_hole_punch: false,
            target_relays: 3,
            max_relays: 10,
            keepalive: KeepaliveConfig::default(),
            connection_timeout_secs: 10,
            endpoint_validation: EndpointValidationMode::Strict,
            max_cached_peers: 500,
            retry: RetryConfig::network(),
            coordinator: CoordinatorConfig::default(),
            gossip: GossipConfig::default(),
            freshness: FreshnessConfig::default(),
            punch: PunchConfig::default(),
            data_dir: None,
        }
    }

    /// Set the UDP port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Add bootstrap endpoints beyond the network key's own
    pub fn with_bootstrap_peers(mut self, peers: Vec<String>) -> Self {
        self.bootstrap_peers = peers;
        self
    }

    /// Enable or disable relaying for symmetric peers
    pub fn with_relay(mut self, can_relay: bool) -> Self {
        self.can_relay = can_relay;
        self
    }

    /// Enable or disable hole-punch coordination
    pub fn with_coordinator(mut self, can_coordinate: bool) -> Self {
        self.can_coordinate_hole_punch = can_coordinate;
        self
    }

    /// Set the endpoint validation policy
    pub fn with_endpoint_validation(mut self, mode: EndpointValidationMode) -> Self {
        self.endpoint_validation = mode;
        self
    }

    /// Set the retry policy
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the persistence directory
    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(data_dir.into());
        self
    }

    /// Check the configuration for nonsense combinations
    pub fn validate(&self) -> CoreResult<()> {
        if self.gossip.fanout == 0 {
            return Err(CoreError::InvalidConfiguration(
                "gossip fanout must be at least 1".to_string(),
            ));
        }
        if self.gossip.max_per_message == 0 {
            return Err(CoreError::InvalidConfiguration(
                "gossip max_per_message must be at least 1".to_string(),
            ));
        }
        if self.max_relays < self.target_relays {
            return Err(CoreError::InvalidConfiguration(format!(
                "max_relays ({}) below target_relays ({})",
                self.max_relays, self.target_relays
            )));
        }
        if self.keepalive.max_machines_per_cycle == 0 {
            return Err(CoreError::InvalidConfiguration(
                "keepalive budget must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.keepalive.min_weight) {
            return Err(CoreError::InvalidConfiguration(
                "keepalive min_weight must be within [0, 1]".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(CoreError::InvalidConfiguration(
                "retry max_attempts must be at least 1".to_string(),
            ));
        }
        if self.freshness.max_contacts == 0 || self.max_cached_peers == 0 {
            return Err(CoreError::InvalidConfiguration(
                "cache bounds must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = MeshConfig::new(NetworkKey::generate("test"));
        config.validate().unwrap();
        assert_eq!(config.gossip.fanout, 5);
        assert_eq!(config.freshness.max_age_secs, 300);
        assert_eq!(config.keepalive.missed_threshold, 3);
        assert_eq!(config.coordinator.max_concurrent, 50);
    }

    #[test]
    fn test_validate_rejects_bad_bounds() {
        let mut config = MeshConfig::new(NetworkKey::generate("test"));
        config.gossip.fanout = 0;
        assert!(config.validate().is_err());

        let mut config = MeshConfig::new(NetworkKey::generate("test"));
        config.target_relays = 20;
        assert!(config.validate().is_err());

        let mut config = MeshConfig::new(NetworkKey::generate("test"));
        config.keepalive.min_weight = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builders() {
        let config = MeshConfig::new(NetworkKey::generate("test"))
            .with_port(4800)
            .with_relay(true)
            .with_coordinator(true)
            .with_endpoint_validation(EndpointValidationMode::AllowAll);
        assert_eq!(config.port, 4800);
        assert!(config.can_relay);
        assert!(config.can_coordinate_hole_punch);
    }
}
