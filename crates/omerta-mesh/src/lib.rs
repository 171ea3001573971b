//! # Omerta Mesh
//!
//! The stateful heart of the mesh: who we know, how to reach them, how
//! fresh that knowledge is, and what to tell the neighbors.
//!
//! - [`EndpointManager`]: ordered endpoint lists per (peer, machine) with
//!   the sliding-window retry plan
//! - [`AssociationRegistry`]: machine ↔ peer history
//! - [`PeerStore`]: TTL + LRU announcement cache with reliability scoring
//! - [`NatPredictor`]: own-NAT inference from peer observations
//! - [`RecentContactTracker`] / [`PathFailureReporter`] /
//!   [`FreshnessQueryTracker`]: freshness state
//! - [`PropagationQueue`] / [`FirstHandTracker`]: bounded-fanout gossip
//! - [`KeepaliveScheduler`]: weighted-sample ping budget

pub mod endpoint_manager;
pub mod error;
pub mod freshness;
pub mod gossip;
pub mod keepalive;
pub mod nat_predictor;
pub mod peer_store;
pub mod registry;

// Re-export main types
pub use endpoint_manager::{sliding_windows, EndpointManager, MachineRecord, MAX_ENDPOINTS_PER_MACHINE};
pub use error::{MeshError, MeshResult};
pub use freshness::{FreshnessQueryTracker, PathFailureReporter, RecentContactTracker};
pub use gossip::{FirstHandTracker, PropagationItem, PropagationQueue};
pub use keepalive::{KeepaliveScheduler, PingOutcome};
pub use nat_predictor::{NatPrediction, NatPredictor, DEFAULT_MIN_OBSERVATIONS};
pub use peer_store::{CachedPeer, PeerStore};
pub use registry::AssociationRegistry;
