//! # Omerta Relay
//!
//! Opportunistic application-level relaying for peers whose symmetric
//! NATs rule out direct contact: the forwarding policy on the relay side
//! and the potential-relay table on the sender side.

pub mod forwarder;
pub mod table;

// Re-export main types
pub use forwarder::{ForwardDecision, RelayForwarder, RelayStats};
pub use table::{PotentialRelayTable, RelayCandidate};
