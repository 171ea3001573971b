//! # Omerta Core
//!
//! Identity, network admission and shared types for the Omerta mesh.
//!
//! This crate provides the vocabulary the rest of the stack speaks:
//!
//! - [`Identity`] / [`PeerId`] / [`MachineId`]: Ed25519 peer identity and
//!   per-install machine ids
//! - [`NetworkKey`] / [`NetworkStore`]: shared network secrets, invite
//!   links and the joined-network store
//! - [`NatType`] / [`ReachabilityPath`] / [`PeerAnnouncement`]: the mesh
//!   data model
//! - [`MeshConfig`] and its sub-configs, plus the [`RetryConfig`] backoff
//!   policy
//! - [`MeshEvent`]: the node's observable event stream

pub mod config;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod identity;
pub mod keystore;
pub mod network;
pub mod retry;
pub mod types;

// Re-export main types
pub use config::*;
pub use endpoint::*;
pub use error::*;
pub use event::*;
pub use identity::*;
pub use keystore::*;
pub use network::*;
pub use retry::*;
pub use types::*;
