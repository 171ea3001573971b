//! # Omerta Punch
//!
//! NAT traversal for the Omerta mesh: strategy selection from NAT pairs,
//! the fixed-size probe packet, the per-target probe exchange session,
//! and the coordinator that sequences a punch between two peers who
//! cannot yet reach each other.

pub mod compat;
pub mod coordinator;
pub mod error;
pub mod probe;
pub mod puncher;

// Re-export main types
pub use compat::{check_compatibility, PunchDifficulty, PunchMethod, PunchPlan};
pub use coordinator::{
    CoordinatedRequest, CoordinatorAction, HolePunchCoordinator, HolePunchRequestState,
};
pub use error::{PunchError, PunchResult};
pub use probe::{is_hole_punch_probe, monotonic_millis, ProbePacket, PROBE_MAGIC, PROBE_SIZE};
pub use puncher::{HolePunchFailReason, HolePunchResult, ProbeEvent, Puncher};
