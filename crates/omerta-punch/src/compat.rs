//! NAT compatibility: which punch strategy fits a peer pair
//!
//! Two cone NATs open simultaneously and cross probes in flight. A
//! symmetric side must let the cone side go through the opening order
//! that gives it a predictable port to aim at. Two symmetric sides cannot
//! punch at all; callers fall back to a relay.

use serde::{Deserialize, Serialize};

use omerta_core::NatType;

/// The probe-opening order for a punch attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PunchMethod {
    /// Both sides probe at the same moment
    Simultaneous,
    /// The initiator opens first (initiator symmetric, responder cone)
    InitiatorFirst,
    /// The responder opens first (responder symmetric, initiator cone)
    ResponderFirst,
    /// No strategy works; use a relay
    Impossible,
}

/// Rough odds of the strategy working
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PunchDifficulty {
    Easy,
    Moderate,
    Hard,
}

/// The plan a coordinator hands to both parties
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PunchPlan {
    pub method: PunchMethod,
    pub can_succeed: bool,
    pub difficulty: PunchDifficulty,
    /// Whether both sides should fire their probes at once
    pub simultaneous_send: bool,
}

/// Pick a punch strategy for an (initiator, responder) NAT pair
pub fn check_compatibility(initiator: NatType, responder: NatType) -> PunchPlan {
    use NatType::*;

    // Unknown on either side: try the general-purpose open, expect pain
    if initiator == Unknown || responder == Unknown {
        return PunchPlan {
            method: PunchMethod::Simultaneous,
            can_succeed: true,
            difficulty: PunchDifficulty::Hard,
            simultaneous_send: true,
        };
    }

    match (initiator.is_symmetric(), responder.is_symmetric()) {
        (true, true) => PunchPlan {
            method: PunchMethod::Impossible,
            can_succeed: false,
            difficulty: PunchDifficulty::Hard,
            simultaneous_send: false,
        },
        (false, true) => PunchPlan {
            method: PunchMethod::ResponderFirst,
            can_succeed: true,
            difficulty: PunchDifficulty::Hard,
            simultaneous_send: false,
        },
        (true, false) => PunchPlan {
            method: PunchMethod::InitiatorFirst,
            can_succeed: true,
            difficulty: PunchDifficulty::Hard,
            simultaneous_send: false,
        },
        (false, false) => {
            let easy = matches!(initiator, Public | FullCone) || matches!(responder, Public | FullCone);
            PunchPlan {
                method: PunchMethod::Simultaneous,
                can_succeed: true,
                difficulty: if easy {
                    PunchDifficulty::Easy
                } else {
                    PunchDifficulty::Moderate
                },
                simultaneous_send: true,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_both_symmetric_is_impossible() {
        let plan = check_compatibility(NatType::Symmetric, NatType::Symmetric);
        assert_eq!(plan.method, PunchMethod::Impossible);
        assert!(!plan.can_succeed);
    }

    #[test]
    fn test_cone_pair_is_simultaneous() {
        let plan = check_compatibility(NatType::PortRestrictedCone, NatType::PortRestrictedCone);
        assert_eq!(plan.method, PunchMethod::Simultaneous);
        assert!(plan.can_succeed);
        assert!(plan.simultaneous_send);
        assert_eq!(plan.difficulty, PunchDifficulty::Moderate);
    }

    #[test]
    fn test_symmetric_initiator_goes_first() {
        let plan = check_compatibility(NatType::Symmetric, NatType::RestrictedCone);
        assert_eq!(plan.method, PunchMethod::InitiatorFirst);
        assert!(plan.can_succeed);
        assert!(!plan.simultaneous_send);
    }

    #[test]
    fn test_symmetric_responder_goes_first() {
        let plan = check_compatibility(NatType::FullCone, NatType::Symmetric);
        assert_eq!(plan.method, PunchMethod::ResponderFirst);
        assert!(plan.can_succeed);
    }

    #[test]
    fn test_unknown_side_means_hard_simultaneous() {
        for other in [
            NatType::Unknown,
            NatType::Public,
            NatType::Symmetric,
            NatType::PortRestrictedCone,
        ] {
            let plan = check_compatibility(NatType::Unknown, other);
            assert_eq!(plan.method, PunchMethod::Simultaneous);
            assert_eq!(plan.difficulty, PunchDifficulty::Hard);
        }
    }

    #[test]
    fn test_public_side_is_easy() {
        let plan = check_compatibility(NatType::Public, NatType::PortRestrictedCone);
        assert_eq!(plan.difficulty, PunchDifficulty::Easy);
    }
}
