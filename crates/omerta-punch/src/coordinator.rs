//! Hole-punch coordination
//!
//! A coordinator sits where both parties can reach it (often a public
//! node) and sequences the punch: the initiator asks, the coordinator
//! invites the target, the target accepts, and the coordinator fires
//! `hole_punch_execute` at both parties at once so their probe bursts
//! cross in flight.
//!
//! The coordinator itself never touches a socket; it consumes protocol
//! messages and returns the messages to send, leaving transport to the
//! node. Requests expire, the in-flight set is capped, and a periodic
//! sweep clears the table.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, info, warn};

use omerta_core::{CoordinatorConfig, NatType, PeerId};
use omerta_wire::MeshMessage;

use crate::compat::{check_compatibility, PunchMethod};
use crate::error::{PunchError, PunchResult};

/// Lifecycle of one coordinated request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HolePunchRequestState {
    Pending,
    InviteSent,
    Executing,
    Completed { success: bool },
    Expired,
}

/// One tracked request
#[derive(Debug, Clone)]
pub struct CoordinatedRequest {
    pub request_id: String,
    pub initiator: PeerId,
    pub initiator_endpoint: String,
    pub initiator_nat: NatType,
    pub target: PeerId,
    pub state: HolePunchRequestState,
    created_at: Instant,
}

/// A message the coordinator wants sent
#[derive(Debug, Clone)]
pub struct CoordinatorAction {
    pub to: PeerId,
    pub message: MeshMessage,
}

/// Tracks and sequences hole-punch requests
pub struct HolePunchCoordinator {
    config: CoordinatorConfig,
    requests: DashMap<String, CoordinatedRequest>,
}

impl HolePunchCoordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            requests: DashMap::new(),
        }
    }

    /// Handle an initiator's `hole_punch_request`
    ///
    /// Returns the invite to send to the target.
    pub fn handle_request(
        &self,
        initiator: &PeerId,
        request_id: &str,
        target: &PeerId,
        initiator_endpoint: &str,
        initiator_nat: NatType,
    ) -> PunchResult<CoordinatorAction> {
        let in_flight = self
            .requests
            .iter()
            .filter(|r| !matches!(r.state, HolePunchRequestState::Completed { .. } | HolePunchRequestState::Expired))
            .count();
        if in_flight >= self.config.max_concurrent {
            warn!(in_flight, "Rejecting hole punch request: coordinator at capacity");
            return Err(PunchError::TooManyRequests(in_flight));
        }

        let request = CoordinatedRequest {
            request_id: request_id.to_string(),
            initiator: initiator.clone(),
            initiator_endpoint: initiator_endpoint.to_string(),
            initiator_nat,
            target: target.clone(),
            state: HolePunchRequestState::InviteSent,
            created_at: Instant::now(),
        };
        self.requests.insert(request_id.to_string(), request);

        info!(
            request_id,
            initiator = %initiator.short_id(),
            target = %target.short_id(),
            "Coordinating hole punch"
        );
        Ok(CoordinatorAction {
            to: target.clone(),
            message: MeshMessage::HolePunchInvite {
                request_id: request_id.to_string(),
                initiator_peer_id: initiator.clone(),
                initiator_endpoint: initiator_endpoint.to_string(),
                initiator_nat_type: initiator_nat,
                accepted: false,
            },
        })
    }

    /// Handle the target's acceptance (its invite echoed with
    /// `accepted = true`)
    ///
    /// `target_endpoint` and `target_nat` come from the caller's endpoint
    /// state for the accepting machine. Returns the execute messages for
    /// both parties, built to go out concurrently.
    pub fn handle_accept(
        &self,
        request_id: &str,
        target_endpoint: &str,
        target_nat: NatType,
    ) -> PunchResult<Vec<CoordinatorAction>> {
        let mut request = self
            .requests
            .get_mut(request_id)
            .ok_or_else(|| PunchError::UnknownRequest(request_id.to_string()))?;

        let plan = check_compatibility(request.initiator_nat, target_nat);
        if plan.method == PunchMethod::Impossible {
            request.state = HolePunchRequestState::Completed { success: false };
            debug!(request_id, "Punch impossible, telling initiator");
            return Ok(vec![CoordinatorAction {
                to: request.initiator.clone(),
                message: MeshMessage::Response {
                    request_id: request_id.to_string(),
                    data: b"impossible".to_vec(),
                },
            }]);
        }

        request.state = HolePunchRequestState::Executing;
        Ok(vec![
            // Initiator aims at the target...
            CoordinatorAction {
                to: request.initiator.clone(),
                message: MeshMessage::HolePunchExecute {
                    request_id: request_id.to_string(),
                    target_endpoint: target_endpoint.to_string(),
                    peer_endpoint: None,
                    simultaneous_send: plan.simultaneous_send,
                },
            },
            // ...while the target aims back at the initiator
            CoordinatorAction {
                to: request.target.clone(),
                message: MeshMessage::HolePunchExecute {
                    request_id: request_id.to_string(),
                    target_endpoint: request.initiator_endpoint.clone(),
                    peer_endpoint: None,
                    simultaneous_send: plan.simultaneous_send,
                },
            },
        ])
    }

    /// Record a party's reported outcome
    pub fn handle_outcome(&self, request_id: &str, success: bool) {
        if let Some(mut request) = self.requests.get_mut(request_id) {
            request.state = HolePunchRequestState::Completed { success };
        }
    }

    /// Current state of a request
    pub fn request_state(&self, request_id: &str) -> Option<HolePunchRequestState> {
        self.requests.get(request_id).map(|r| r.state)
    }

    /// Requests not yet completed or expired
    pub fn active_count(&self) -> usize {
        self.requests
            .iter()
            .filter(|r| !matches!(r.state, HolePunchRequestState::Completed { .. } | HolePunchRequestState::Expired))
            .count()
    }

    /// Expire overdue requests and drop finished ones
    ///
    /// Invites unanswered past `invite_timeout` and anything older than
    /// `request_timeout` expire; completed and expired entries leave the
    /// table.
    pub fn cleanup(&self) {
        let invite_timeout = Duration::from_secs(self.config.invite_timeout_secs);
        let request_timeout = Duration::from_secs(self.config.request_timeout_secs);
        let now = Instant::now();

        for mut entry in self.requests.iter_mut() {
            let age = now.duration_since(entry.created_at);
            let overdue = match entry.state {
                HolePunchRequestState::Pending | HolePunchRequestState::InviteSent => age > invite_timeout,
                HolePunchRequestState::Executing => age > request_timeout,
                _ => false,
            };
            if overdue {
                debug!(request_id = %entry.request_id, "Expiring hole punch request");
                entry.state = HolePunchRequestState::Expired;
            }
        }

        self.requests.retain(|_, request| {
            !matches!(
                request.state,
                HolePunchRequestState::Completed { .. } | HolePunchRequestState::Expired
            )
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> PeerId {
        PeerId::from_public_key_bytes(&rand::random::<[u8; 32]>())
    }

    fn coordinator() -> HolePunchCoordinator {
        HolePunchCoordinator::new(CoordinatorConfig::default())
    }

    #[test]
    fn test_request_produces_invite() {
        let coord = coordinator();
        let initiator = peer();
        let target = peer();

        let action = coord
            .handle_request(&initiator, "req-1", &target, "203.0.113.1:1000", NatType::PortRestrictedCone)
            .unwrap();

        assert_eq!(action.to, target);
        match action.message {
            MeshMessage::HolePunchInvite {
                ref request_id,
                ref initiator_peer_id,
                accepted,
                ..
            } => {
                assert_eq!(request_id, "req-1");
                assert_eq!(initiator_peer_id, &initiator);
                assert!(!accepted);
            }
            other => panic!("expected invite, got {:?}", other.kind()),
        }
        assert_eq!(
            coord.request_state("req-1"),
            Some(HolePunchRequestState::InviteSent)
        );
    }

    #[test]
    fn test_accept_executes_both_parties() {
        let coord = coordinator();
        let initiator = peer();
        let target = peer();
        coord
            .handle_request(&initiator, "req-1", &target, "203.0.113.1:1000", NatType::PortRestrictedCone)
            .unwrap();

        let actions = coord
            .handle_accept("req-1", "203.0.113.2:2000", NatType::RestrictedCone)
            .unwrap();

        assert_eq!(actions.len(), 2);
        let to_initiator = actions.iter().find(|a| a.to == initiator).unwrap();
        let to_target = actions.iter().find(|a| a.to == target).unwrap();

        match (&to_initiator.message, &to_target.message) {
            (
                MeshMessage::HolePunchExecute {
                    target_endpoint: initiator_aims_at,
                    simultaneous_send: s1,
                    ..
                },
                MeshMessage::HolePunchExecute {
                    target_endpoint: target_aims_at,
                    simultaneous_send: s2,
                    ..
                },
            ) => {
                assert_eq!(initiator_aims_at, "203.0.113.2:2000");
                assert_eq!(target_aims_at, "203.0.113.1:1000");
                assert!(*s1 && *s2);
            }
            _ => panic!("expected execute messages"),
        }
        assert_eq!(
            coord.request_state("req-1"),
            Some(HolePunchRequestState::Executing)
        );
    }

    #[test]
    fn test_impossible_pair_tells_initiator() {
        let coord = coordinator();
        let initiator = peer();
        coord
            .handle_request(&initiator, "req-1", &peer(), "203.0.113.1:1000", NatType::Symmetric)
            .unwrap();

        let actions = coord
            .handle_accept("req-1", "203.0.113.2:2000", NatType::Symmetric)
            .unwrap();

        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].to, initiator);
        assert!(matches!(actions[0].message, MeshMessage::Response { .. }));
        assert_eq!(
            coord.request_state("req-1"),
            Some(HolePunchRequestState::Completed { success: false })
        );
    }

    #[test]
    fn test_concurrent_cap() {
        let config = CoordinatorConfig {
            max_concurrent: 2,
            ..CoordinatorConfig::default()
        };
        let coord = HolePunchCoordinator::new(config);

        for i in 0..2 {
            coord
                .handle_request(
                    &peer(),
                    &format!("req-{}", i),
                    &peer(),
                    "203.0.113.1:1000",
                    NatType::Unknown,
                )
                .unwrap();
        }
        let result = coord.handle_request(&peer(), "req-over", &peer(), "203.0.113.1:1000", NatType::Unknown);
        assert!(matches!(result, Err(PunchError::TooManyRequests(2))));
    }

    #[test]
    fn test_unknown_accept_rejected() {
        let coord = coordinator();
        assert!(matches!(
            coord.handle_accept("nope", "203.0.113.2:2000", NatType::Unknown),
            Err(PunchError::UnknownRequest(_))
        ));
    }

    #[test]
    fn test_cleanup_expires_stale_invites() {
        let config = CoordinatorConfig {
            invite_timeout_secs: 0,
            ..CoordinatorConfig::default()
        };
        let coord = HolePunchCoordinator::new(config);
        coord
            .handle_request(&peer(), "req-1", &peer(), "203.0.113.1:1000", NatType::Unknown)
            .unwrap();

        std::thread::sleep(Duration::from_millis(5));
        coord.cleanup();
        assert_eq!(coord.request_state("req-1"), None);
        assert_eq!(coord.active_count(), 0);
    }

    #[test]
    fn test_completed_requests_swept() {
        let coord = coordinator();
        coord
            .handle_request(&peer(), "req-1", &peer(), "203.0.113.1:1000", NatType::Unknown)
            .unwrap();
        coord.handle_accept("req-1", "203.0.113.2:2000", NatType::Unknown).unwrap();
        coord.handle_outcome("req-1", true);

        assert_eq!(
            coord.request_state("req-1"),
            Some(HolePunchRequestState::Completed { success: true })
        );
        coord.cleanup();
        assert_eq!(coord.request_state("req-1"), None);
    }
}
