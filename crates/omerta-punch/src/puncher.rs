//! UDP probe exchange state machine
//!
//! One puncher session per (target peer, target endpoint). The session
//! fires a burst of probes at the target while listening for anything the
//! target sends back; the first probe or response from the target's
//! endpoint proves the mapping is open. Sessions normally share the
//! node's socket, with probe datagrams routed in by the owner of the
//! receive loop; `punch_standalone` binds its own socket for tests and
//! out-of-band use.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use omerta_core::{parse_endpoint, NatType, PeerId, PunchConfig};

use crate::probe::{is_hole_punch_probe, monotonic_millis, ProbePacket, PROBE_SIZE};

/// Why a punch attempt failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HolePunchFailReason {
    Timeout,
    BothSymmetric,
    BindFailed,
    InvalidEndpoint,
    Cancelled,
    SocketError(String),
}

impl std::fmt::Display for HolePunchFailReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::BothSymmetric => write!(f, "both peers behind symmetric NAT"),
            Self::BindFailed => write!(f, "could not bind punch socket"),
            Self::InvalidEndpoint => write!(f, "invalid target endpoint"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::SocketError(msg) => write!(f, "socket error: {}", msg),
        }
    }
}

/// Outcome of a punch attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HolePunchResult {
    Success { endpoint: String, rtt: Duration },
    Failed { reason: HolePunchFailReason },
}

impl HolePunchResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    fn failed(reason: HolePunchFailReason) -> Self {
        Self::Failed { reason }
    }
}

/// A probe datagram routed to a punch session by the socket owner
#[derive(Debug, Clone)]
pub struct ProbeEvent {
    pub probe: ProbePacket,
    pub from: SocketAddr,
}

/// Runs probe exchanges toward target endpoints
pub struct Puncher {
    local_peer: PeerId,
    config: PunchConfig,
}

impl Puncher {
    pub fn new(local_peer: PeerId, config: PunchConfig) -> Self {
        Self { local_peer, config }
    }

    /// Run one punch attempt over a shared socket
    ///
    /// `probes` must deliver every hole-punch probe datagram the socket
    /// receives (the owner of the receive loop filters by magic). Returns
    /// on first contact from the target endpoint, timeout, cancellation or
    /// socket error. With both sides symmetric, fails immediately without
    /// sending a single probe.
    pub async fn punch(
        &self,
        socket: &UdpSocket,
        probes: &mut mpsc::Receiver<ProbeEvent>,
        target_endpoint: &str,
        local_nat: NatType,
        remote_nat: NatType,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> HolePunchResult {
        if local_nat.is_symmetric() && remote_nat.is_symmetric() {
            return HolePunchResult::failed(HolePunchFailReason::BothSymmetric);
        }
        let target = match parse_endpoint(target_endpoint) {
            Ok(addr) => addr,
            Err(_) => return HolePunchResult::failed(HolePunchFailReason::InvalidEndpoint),
        };

        let start = tokio::time::Instant::now();
        let deadline = start + Duration::from_secs(self.config.timeout_secs);
        let mut interval = tokio::time::interval(Duration::from_millis(self.config.probe_interval_ms));
        let mut sent = 0u32;

        debug!(
            peer = %self.local_peer.short_id(),
            target = target_endpoint,
            probes = self.config.probe_count,
            "Starting hole punch"
        );

        loop {
            tokio::select! {
                _ = interval.tick(), if sent < self.config.probe_count => {
                    let probe = ProbePacket::new(sent, &self.local_peer);
                    if let Err(e) = socket.send_to(&probe.encode(), target).await {
                        return HolePunchResult::failed(HolePunchFailReason::SocketError(e.to_string()));
                    }
                    sent += 1;
                }
                event = probes.recv() => {
                    let Some(event) = event else {
                        return HolePunchResult::failed(HolePunchFailReason::Cancelled);
                    };
                    if event.from != target {
                        debug!(from = %event.from, "Ignoring probe from unexpected source");
                        continue;
                    }

                    // Contact: the target's NAT now has a mapping for us.
                    let rtt = if event.probe.is_response {
                        Duration::from_millis(
                            monotonic_millis().saturating_sub(event.probe.timestamp_millis),
                        )
                    } else {
                        start.elapsed()
                    };

                    let response = ProbePacket::response_to(&event.probe, &self.local_peer);
                    for _ in 0..self.config.response_probe_count {
                        if let Err(e) = socket.send_to(&response.encode(), target).await {
                            warn!(error = %e, "Confirmation probe send failed");
                            break;
                        }
                    }

                    info!(
                        target = target_endpoint,
                        rtt_ms = rtt.as_millis() as u64,
                        "Hole punch succeeded"
                    );
                    return HolePunchResult::Success {
                        endpoint: target_endpoint.to_string(),
                        rtt,
                    };
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return HolePunchResult::failed(HolePunchFailReason::Timeout);
                }
                _ = shutdown.recv() => {
                    return HolePunchResult::failed(HolePunchFailReason::Cancelled);
                }
            }
        }
    }

    /// Run one punch attempt on a freshly bound socket
    ///
    /// Binds `bind_addr`, feeds received probes into the session itself,
    /// and tears everything down when the attempt resolves.
    pub async fn punch_standalone(
        &self,
        bind_addr: &str,
        target_endpoint: &str,
        local_nat: NatType,
        remote_nat: NatType,
    ) -> HolePunchResult {
        if local_nat.is_symmetric() && remote_nat.is_symmetric() {
            return HolePunchResult::failed(HolePunchFailReason::BothSymmetric);
        }

        let socket = match UdpSocket::bind(bind_addr).await {
            Ok(socket) => Arc::new(socket),
            Err(_) => return HolePunchResult::failed(HolePunchFailReason::BindFailed),
        };

        let (probe_tx, mut probe_rx) = mpsc::channel(64);
        let reader_socket = Arc::clone(&socket);
        let reader = tokio::spawn(async move {
            let mut buf = [0u8; PROBE_SIZE + 16];
            loop {
                let Ok((len, from)) = reader_socket.recv_from(&mut buf).await else {
                    break;
                };
                if !is_hole_punch_probe(&buf[..len]) {
                    continue;
                }
                if let Some(probe) = ProbePacket::parse(&buf[..len]) {
                    if probe_tx.send(ProbeEvent { probe, from }).await.is_err() {
                        break;
                    }
                }
            }
        });

        let (_shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let result = self
            .punch(&socket, &mut probe_rx, target_endpoint, local_nat, remote_nat, &mut shutdown_rx)
            .await;
        reader.abort();
        result
    }

    /// The local socket address of a punch-capable socket, as an endpoint
    pub fn local_endpoint(socket: &UdpSocket) -> Option<String> {
        socket.local_addr().ok().map(|addr| addr.to_string())
    }
}
