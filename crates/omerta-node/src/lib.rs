//! # Omerta Node
//!
//! The long-running mesh node: binds the UDP socket, speaks the signed
//! envelope protocol, and wires together endpoint tracking, gossip,
//! freshness, keepalive, hole punching and relaying into one
//! send/receive/channel API.
//!
//! ```rust,ignore
//! use omerta_core::{MeshConfig, NetworkKey};
//! use omerta_node::MeshNode;
//!
//! let network = NetworkKey::from_invite(&invite_link)?;
//! let node = MeshNode::new(MeshConfig::new(network))?;
//! node.start().await?;
//!
//! node.on_channel("chat", |from_machine, data| {
//!     println!("{}: {}", from_machine, String::from_utf8_lossy(&data));
//! })?;
//! ```

pub mod dispatch;
pub mod error;
pub mod event_log;
pub mod node;
pub mod pending;
pub mod socket;

// Re-export main types
pub use error::{NodeError, NodeResult};
pub use event_log::{EventLog, EventLogKind, PeerSeenRecord};
pub use node::{ChannelHandler, MeshNode, MeshStats, Recipient};
pub use pending::{PendingResponses, PendingSlot};
pub use socket::{MeshSocket, MAX_DATAGRAM};
