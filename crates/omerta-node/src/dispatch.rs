//! Inbound datagram pipeline
//!
//! The order here is load-bearing: probe check → decrypt → decode →
//! deduplicate → verify signature → record sender state → dispatch by
//! payload. Nothing mutates node state before the signature and peer-id
//! derivation check out, and a duplicate message id never re-runs side
//! effects. Replies always go to the source address and the machine id
//! carried in the inbound envelope, never a re-looked-up "most recent
//! machine": one identity may span several machines.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use omerta_core::{
    format_endpoint, parse_endpoint, ConnectionType, DropReason, MeshEvent, NatType,
    PeerAnnouncement, PeerEndpointInfo, PeerId, ReachabilityPath,
};
use omerta_punch::{is_hole_punch_probe, ProbeEvent, ProbePacket};
use omerta_relay::{ForwardDecision, RelayForwarder};
use omerta_wire::{Envelope, MeshMessage, CORE_CHANNEL};

use crate::error::NodeResult;
use crate::event_log::{EventLogKind, PeerSeenRecord};
use crate::node::NodeInner;

impl NodeInner {
    /// Process one raw datagram from the socket
    pub(crate) async fn handle_datagram(self: Arc<Self>, datagram: Vec<u8>, from: SocketAddr) {
        // Probes are recognized by magic before any decryption.
        if is_hole_punch_probe(&datagram) {
            self.handle_probe(&datagram, from).await;
            return;
        }

        let plaintext = match self.cipher.open(&datagram) {
            Ok(plaintext) => plaintext,
            Err(_) => {
                // Not on our network, or damaged. Dropped silently on the
                // wire; counted for operators.
                debug!(%from, "Dropping undecryptable datagram");
                self.emit(MeshEvent::message_dropped(DropReason::DecryptFailed));
                if let Some(log) = &self.event_log {
                    log.error("wire", "decrypt", "decrypt_failed", format!("from {}", from));
                }
                return;
            }
        };

        let envelope = match Envelope::decode(&plaintext) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(%from, error = %e, "Dropping malformed envelope");
                self.emit(MeshEvent::message_dropped(DropReason::MalformedEnvelope));
                if let Some(log) = &self.event_log {
                    log.error("wire", "decode", "malformed_envelope", e.to_string());
                }
                return;
            }
        };

        // Deduplicate before anything observable happens.
        if !self.dedup.observe(&envelope.message_id) {
            debug!(message_id = %envelope.message_id, "Dropping duplicate message");
            self.emit(MeshEvent::message_dropped(DropReason::Duplicate));
            return;
        }

        if envelope.verify().is_err() {
            warn!(%from, claimed = %envelope.from_peer_id, "Dropping envelope with bad signature");
            self.emit(MeshEvent::message_dropped(DropReason::SignatureInvalid));
            if let Some(log) = &self.event_log {
                log.error("wire", "verify", "signature_invalid", format!("from {}", from));
            }
            return;
        }

        let local = self.local_peer_id();
        if envelope.from_peer_id == local {
            return; // our own gossip reflected back
        }
        if let Some(to) = &envelope.to_peer_id {
            if to != &local {
                debug!(%from, to = %to, "Dropping envelope addressed to another peer");
                return;
            }
        }

        self.record_sender(&envelope, from);
        self.dispatch(envelope, from).await;
    }

    /// Route a probe datagram to its punch session, or answer it
    async fn handle_probe(&self, datagram: &[u8], from: SocketAddr) {
        let Some(probe) = ProbePacket::parse(datagram) else {
            return;
        };

        if let Some(session) = self.punch_sessions.get(&from) {
            let _ = session.try_send(ProbeEvent { probe, from });
            return;
        }

        // No session: a peer is punching toward us outside a coordinated
        // exchange. Answering costs one datagram and opens our mapping.
        if !probe.is_response {
            let response = ProbePacket::response_to(&probe, &self.local_peer_id());
            if let Ok(socket) = self.socket() {
                let _ = socket.send_to(&response.encode(), from).await;
            }
        }
    }

    /// Verified-sender bookkeeping shared by every payload kind
    fn record_sender(&self, envelope: &Envelope, from: SocketAddr) {
        let peer = &envelope.from_peer_id;
        let machine = envelope.machine_id;
        let endpoint = format_endpoint(&from);

        self.registry.record(peer, machine);
        if let Err(e) = self.endpoints.record_message_received(peer, machine, &endpoint) {
            debug!(peer = %peer.short_id(), endpoint, error = %e, "Endpoint rejected by policy");
        }
        self.first_hand.mark(peer);
        self.peers_seen
            .entry(peer.clone())
            .and_modify(PeerSeenRecord::touch)
            .or_insert_with(PeerSeenRecord::first_contact);
        self.keepalive.monitor(peer, machine);
        self.keepalive.record_successful_communication(peer, machine);
        self.contacts.record_contact(
            peer,
            ReachabilityPath::Direct {
                endpoint: endpoint.clone(),
            },
            None,
            ConnectionType::InboundDirect,
        );
        self.propagation.add(PeerEndpointInfo {
            peer_id: peer.clone(),
            machine_id: machine,
            endpoint,
            nat_type: self.endpoints.get_nat_type(peer).unwrap_or_default(),
            is_first_hand: true,
        });

        if self.connected.insert(peer.clone()) {
            info!(peer = %peer.short_id(), %from, "Peer connected");
            self.emit(MeshEvent::peer_connected(peer.clone(), true));
            if let Some(log) = &self.event_log {
                log.append(
                    EventLogKind::Connections,
                    &serde_json::json!({
                        "timestamp": Utc::now(),
                        "peer_id": peer,
                        "endpoint": format_endpoint(&from),
                        "direction": "inbound",
                    }),
                );
            }
        }
    }

    /// Absorb a gossiped peer list from a ping or pong
    fn absorb_peer_list(&self, reporter: &PeerId, peers: &[PeerEndpointInfo]) {
        let local = self.local_peer_id();
        for info in peers {
            if info.peer_id == local {
                continue;
            }
            self.registry.record(&info.peer_id, info.machine_id);
            if self
                .endpoints
                .record_message_received(&info.peer_id, info.machine_id, &info.endpoint)
                .is_ok()
                && info.nat_type != NatType::Unknown
            {
                self.endpoints.update_nat_type(&info.peer_id, info.nat_type);
            }

            // A symmetric peer's reporter has a working path to it: that
            // makes the reporter a relay candidate for the peer.
            if info.nat_type == NatType::Symmetric {
                self.relay_table.record(&info.peer_id, reporter);
            }

            self.propagation.add(info.clone());
        }
    }

    /// Dispatch one verified envelope by payload kind
    async fn dispatch(self: Arc<Self>, envelope: Envelope, from: SocketAddr) {
        match envelope.payload.clone() {
            MeshMessage::Ping {
                recent_peers,
                my_nat_type,
                request_full_list,
            } => {
                self.handle_ping(&envelope, from, recent_peers, my_nat_type, request_full_list)
                    .await;
            }
            MeshMessage::Pong {
                recent_peers,
                your_endpoint,
                my_nat_type,
            } => {
                self.handle_pong(&envelope, recent_peers, your_endpoint, my_nat_type);
            }
            MeshMessage::Data { data } => self.handle_data(&envelope, data),
            MeshMessage::Request { data, .. } => {
                // Requests ride channels like data; the application replies
                // through its own send path with the request id.
                self.handle_data(&envelope, data);
            }
            MeshMessage::Response { request_id, data } => {
                if let Some(unclaimed) = self.pending.complete(envelope) {
                    // An unclaimed outcome report belongs to the coordinator.
                    if let Some(coordinator) = &self.coordinator {
                        let success = data == b"ok";
                        coordinator.handle_outcome(&request_id, success);
                    } else {
                        debug!(
                            request_id,
                            from = %unclaimed.from_peer_id.short_id(),
                            "Response with no waiting request"
                        );
                    }
                }
            }
            MeshMessage::Announce { announcement } | MeshMessage::PeerInfo { announcement } => {
                self.handle_announcement(envelope, announcement, from).await;
            }
            MeshMessage::FindPeer { peer_id } => {
                self.handle_find_peer(&envelope, from, peer_id).await;
            }
            MeshMessage::PeerNotFound { .. } => {
                self.pending.complete(envelope);
            }
            MeshMessage::HolePunchRequest {
                request_id,
                target_peer_id,
                initiator_endpoint,
                initiator_nat_type,
            } => {
                self.handle_hole_punch_request(
                    &envelope,
                    from,
                    request_id,
                    target_peer_id,
                    initiator_endpoint,
                    initiator_nat_type,
                )
                .await;
            }
            MeshMessage::HolePunchInvite {
                request_id,
                initiator_peer_id,
                initiator_endpoint,
                initiator_nat_type,
                accepted,
            } => {
                self.handle_hole_punch_invite(
                    &envelope,
                    from,
                    request_id,
                    initiator_peer_id,
                    initiator_endpoint,
                    initiator_nat_type,
                    accepted,
                )
                .await;
            }
            MeshMessage::HolePunchExecute {
                request_id,
                target_endpoint,
                peer_endpoint: _,
                simultaneous_send: _,
            } => {
                Arc::clone(&self).handle_hole_punch_execute(&envelope, from, request_id, target_endpoint);
            }
            MeshMessage::RelayForward {
                target_peer_id,
                payload,
            } => {
                self.handle_relay_forward(&envelope, from, target_peer_id, payload).await;
            }
            MeshMessage::RelayForwardResult {
                target_peer_id,
                success,
            } => {
                self.emit(MeshEvent::relay_forwarded(target_peer_id.clone(), success));
                if !success {
                    // The relay could not reach the target through this path.
                    self.relay_table.remove(&target_peer_id, &envelope.from_peer_id);
                }
                self.pending.complete(envelope);
            }
            MeshMessage::WhoHasRecent {
                peer_id,
                max_age_seconds,
            } => {
                self.handle_who_has_recent(&envelope, from, peer_id, max_age_seconds).await;
            }
            MeshMessage::IHaveRecent { .. } => {
                self.pending.complete(envelope);
            }
            MeshMessage::PathFailed {
                peer_id,
                path,
                failed_at: _,
            } => {
                // Accepted from the wire but never emitted by this node.
                self.path_failures
                    .report_failure(&peer_id, path.clone(), Some(envelope.from_peer_id.clone()));
                self.contacts.remove_contacts_using_path(&path);
            }
        }
    }

    async fn handle_ping(
        &self,
        envelope: &Envelope,
        from: SocketAddr,
        recent_peers: Vec<PeerEndpointInfo>,
        my_nat_type: NatType,
        request_full_list: bool,
    ) {
        let sender = &envelope.from_peer_id;
        if my_nat_type != NatType::Unknown {
            self.endpoints.update_nat_type(sender, my_nat_type);
        }
        self.absorb_peer_list(sender, &recent_peers);

        let reply_peers = if request_full_list {
            self.build_full_peer_list(sender)
        } else {
            self.propagation
                .build_peer_list(sender, self.config.gossip.max_per_message, &self.first_hand)
        };

        let pong = MeshMessage::Pong {
            recent_peers: reply_peers,
            your_endpoint: format_endpoint(&from),
            my_nat_type: self.refresh_nat_prediction().nat_type,
        };
        // Reply to the source address: the machine that pinged, not the
        // peer's most recent machine.
        if let Err(e) = self
            .send_payload_to_addr(Some(sender.clone()), CORE_CHANNEL, pong, from)
            .await
        {
            debug!(peer = %sender.short_id(), error = %e, "Pong send failed");
        }
    }

    fn handle_pong(
        &self,
        envelope: &Envelope,
        recent_peers: Vec<PeerEndpointInfo>,
        your_endpoint: String,
        my_nat_type: NatType,
    ) {
        let sender = &envelope.from_peer_id;
        if my_nat_type != NatType::Unknown {
            self.endpoints.update_nat_type(sender, my_nat_type);
        }
        self.predictor.record_observation(sender, &your_endpoint);
        self.refresh_nat_prediction();
        self.absorb_peer_list(sender, &recent_peers);
        self.pending.complete(envelope.clone());
    }

    fn handle_data(&self, envelope: &Envelope, data: Vec<u8>) {
        if envelope.channel.is_empty() {
            debug!(from = %envelope.from_peer_id.short_id(), "Core-channel data with no meaning, dropping");
            return;
        }
        let Some(handler) = self.channels.get(&envelope.channel).map(|h| h.clone()) else {
            debug!(channel = %envelope.channel, "No handler for channel");
            return;
        };
        if let Some(log) = &self.event_log {
            log.append(
                EventLogKind::Messages,
                &serde_json::json!({
                    "timestamp": Utc::now(),
                    "from_peer_id": envelope.from_peer_id,
                    "channel": envelope.channel,
                    "bytes": data.len(),
                }),
            );
        }
        handler(envelope.machine_id, data);
    }

    async fn handle_announcement(
        &self,
        envelope: Envelope,
        announcement: PeerAnnouncement,
        _from: SocketAddr,
    ) {
        if announcement.verify().is_err() {
            warn!(claimed = %announcement.peer_id.short_id(), "Dropping announcement with bad signature");
            return;
        }

        // Relay reachability paths double as relay candidates.
        for path in &announcement.reachability {
            if let ReachabilityPath::Relay { relay_peer_id, .. } = path {
                self.relay_table.record(&announcement.peer_id, relay_peer_id);
            }
        }

        let is_new = self.peer_store.get(&announcement.peer_id).is_none();
        let peer_id = announcement.peer_id.clone();
        self.peer_store.insert(announcement);

        if is_new {
            if let Some(log) = &self.event_log {
                log.append(
                    EventLogKind::PeerDiscovery,
                    &serde_json::json!({
                        "timestamp": Utc::now(),
                        "peer_id": peer_id,
                    }),
                );
            }
        }

        // A peer-info answer may be the result of a query we forwarded.
        if let Some((origin, _)) = self.find_origins.remove(&peer_id).map(|(_, v)| v) {
            if let Some(stored) = self.peer_store.get(&peer_id) {
                let reply = MeshMessage::PeerInfo { announcement: stored };
                if let Err(e) = self.send_payload_to_addr(None, CORE_CHANNEL, reply, origin).await {
                    debug!(error = %e, "Could not forward peer info to query origin");
                }
            }
        }

        self.pending.complete(envelope);
    }

    async fn handle_find_peer(&self, envelope: &Envelope, from: SocketAddr, sought: PeerId) {
        let asker = &envelope.from_peer_id;

        if sought == self.local_peer_id() {
            // Questions about ourselves get a fresh self-announcement.
            let announcement = PeerAnnouncement::create(
                &self.identity,
                self.own_reachability(),
                self.own_capabilities(),
                crate::node::ANNOUNCEMENT_TTL_SECS,
            );
            let reply = MeshMessage::PeerInfo { announcement };
            let _ = self.send_payload_to_addr(Some(asker.clone()), CORE_CHANNEL, reply, from).await;
            return;
        }

        if let Some(announcement) = self.peer_store.get(&sought) {
            let reply = MeshMessage::PeerInfo { announcement };
            let _ = self.send_payload_to_addr(Some(asker.clone()), CORE_CHANNEL, reply, from).await;
            return;
        }

        if envelope.hop_count < self.config.gossip.max_hops {
            // Remember who asked so the answer can find its way back.
            self.find_origins.insert(sought.clone(), (from, Instant::now()));
            self.forward_to_first_hand(
                MeshMessage::FindPeer { peer_id: sought },
                asker,
                envelope.hop_count + 1,
            )
            .await;
        } else {
            let reply = MeshMessage::PeerNotFound { peer_id: sought };
            let _ = self.send_payload_to_addr(Some(asker.clone()), CORE_CHANNEL, reply, from).await;
        }
    }

    async fn handle_hole_punch_request(
        &self,
        envelope: &Envelope,
        from: SocketAddr,
        request_id: String,
        target: PeerId,
        initiator_endpoint: String,
        initiator_nat: NatType,
    ) {
        let Some(coordinator) = &self.coordinator else {
            debug!("Ignoring hole punch request: not a coordinator");
            return;
        };

        // Prefer the endpoint we observed over what the initiator claims;
        // the initiator may not know its own mapping.
        let observed = format_endpoint(&from);
        let endpoint = if initiator_nat == NatType::Symmetric {
            initiator_endpoint
        } else {
            observed
        };

        match coordinator.handle_request(
            &envelope.from_peer_id,
            &request_id,
            &target,
            &endpoint,
            initiator_nat,
        ) {
            Ok(action) => {
                if let Err(e) = self.send_core_to_peer(action.message, &action.to).await {
                    warn!(target = %target.short_id(), error = %e, "Could not deliver punch invite");
                    coordinator.handle_outcome(&request_id, false);
                }
            }
            Err(e) => {
                debug!(request_id, error = %e, "Punch request refused");
                let reply = MeshMessage::Response {
                    request_id,
                    data: b"busy".to_vec(),
                };
                let _ = self
                    .send_payload_to_addr(Some(envelope.from_peer_id.clone()), CORE_CHANNEL, reply, from)
                    .await;
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_hole_punch_invite(
        &self,
        envelope: &Envelope,
        from: SocketAddr,
        request_id: String,
        initiator_peer_id: PeerId,
        initiator_endpoint: String,
        initiator_nat: NatType,
        accepted: bool,
    ) {
        if !accepted {
            // We are the target: remember whom we are punching and accept.
            self.punch_peers.insert(request_id.clone(), initiator_peer_id.clone());
            let echo = MeshMessage::HolePunchInvite {
                request_id,
                initiator_peer_id,
                initiator_endpoint,
                initiator_nat_type: initiator_nat,
                accepted: true,
            };
            let _ = self
                .send_payload_to_addr(Some(envelope.from_peer_id.clone()), CORE_CHANNEL, echo, from)
                .await;
            return;
        }

        // We are the coordinator and the target accepted.
        let Some(coordinator) = &self.coordinator else {
            return;
        };
        let target_nat = self
            .endpoints
            .get_nat_type(&envelope.from_peer_id)
            .unwrap_or_default();
        match coordinator.handle_accept(&request_id, &format_endpoint(&from), target_nat) {
            Ok(actions) => {
                for action in actions {
                    if let Err(e) = self.send_core_to_peer(action.message, &action.to).await {
                        warn!(to = %action.to.short_id(), error = %e, "Could not deliver punch execute");
                    }
                }
            }
            Err(e) => debug!(request_id, error = %e, "Unusable punch acceptance"),
        }
    }

    /// Spawn a punch session; the coordinator told us to go
    fn handle_hole_punch_execute(
        self: Arc<Self>,
        envelope: &Envelope,
        from: SocketAddr,
        request_id: String,
        target_endpoint: String,
    ) {
        let Ok(target_addr) = parse_endpoint(&target_endpoint) else {
            warn!(target_endpoint, "Unusable punch target endpoint");
            return;
        };

        let (probe_tx, mut probe_rx) = mpsc::channel(64);
        self.punch_sessions.insert(target_addr, probe_tx);

        let inner = self;
        let coordinator_addr = from;
        let coordinator_peer = envelope.from_peer_id.clone();
        tokio::spawn(async move {
            let Ok(socket) = inner.socket() else {
                inner.punch_sessions.remove(&target_addr);
                return;
            };
            let local_nat = inner.predictor.predict().nat_type;
            let mut shutdown = inner.shutdown.subscribe();

            let result = inner
                .puncher
                .punch(
                    socket.udp(),
                    &mut probe_rx,
                    &target_endpoint,
                    local_nat,
                    NatType::Unknown,
                    &mut shutdown,
                )
                .await;
            inner.punch_sessions.remove(&target_addr);

            let success = result.is_success();
            let punched_peer = inner.punch_peers.remove(&request_id).map(|(_, peer)| peer);

            if let Some(peer) = &punched_peer {
                if success {
                    if let Some(machine) = inner.registry.most_recent_machine(peer) {
                        inner.endpoints.record_send_success(peer, machine, &target_endpoint);
                    }
                    inner.contacts.record_contact(
                        peer,
                        ReachabilityPath::Direct {
                            endpoint: target_endpoint.clone(),
                        },
                        None,
                        ConnectionType::HolePunched,
                    );
                }
                inner.emit(MeshEvent::hole_punch_completed(peer.clone(), success));
            }
            if let Some(log) = &inner.event_log {
                log.append(
                    EventLogKind::HolePunch,
                    &serde_json::json!({
                        "timestamp": Utc::now(),
                        "request_id": request_id,
                        "target_endpoint": target_endpoint,
                        "peer_id": punched_peer,
                        "success": success,
                    }),
                );
            }

            // Tell the coordinator how it went.
            let report = MeshMessage::Response {
                request_id,
                data: if success { b"ok".to_vec() } else { b"fail".to_vec() },
            };
            let _ = inner
                .send_payload_to_addr(Some(coordinator_peer), CORE_CHANNEL, report, coordinator_addr)
                .await;
        });
    }

    async fn handle_relay_forward(
        &self,
        envelope: &Envelope,
        from: SocketAddr,
        target: PeerId,
        payload: Vec<u8>,
    ) {
        let target_endpoint = self
            .registry
            .most_recent_machine(&target)
            .and_then(|machine| self.endpoints.get_best_endpoint(&target, machine));

        let success = match self.relay_forwarder.decide(&target, target_endpoint, payload) {
            ForwardDecision::Send { endpoint, payload } => match parse_endpoint(&endpoint) {
                Ok(addr) => self.transmit(&payload, addr).await.is_ok(),
                Err(_) => false,
            },
            ForwardDecision::Refuse => false,
        };

        if let Some(log) = &self.event_log {
            log.append(
                EventLogKind::Relay,
                &serde_json::json!({
                    "timestamp": Utc::now(),
                    "requester": envelope.from_peer_id,
                    "target_peer_id": target,
                    "success": success,
                }),
            );
        }
        self.emit(MeshEvent::relay_forwarded(target.clone(), success));

        let result = RelayForwarder::result_message(&target, success);
        let _ = self
            .send_payload_to_addr(Some(envelope.from_peer_id.clone()), CORE_CHANNEL, result, from)
            .await;
    }

    async fn handle_who_has_recent(
        &self,
        envelope: &Envelope,
        from: SocketAddr,
        peer_id: PeerId,
        max_age_seconds: u64,
    ) {
        let max_age = std::time::Duration::from_secs(max_age_seconds);
        if self.contacts.has_recent_contact(&peer_id, max_age) {
            if let Some(contact) = self.contacts.get(&peer_id) {
                let age = Utc::now()
                    .signed_duration_since(contact.last_seen)
                    .num_seconds()
                    .max(0) as u64;
                let reply = MeshMessage::IHaveRecent {
                    peer_id,
                    last_seen_seconds_ago: age,
                    reachability: contact.reachability,
                };
                let _ = self
                    .send_payload_to_addr(Some(envelope.from_peer_id.clone()), CORE_CHANNEL, reply, from)
                    .await;
            }
            return;
        }

        if envelope.hop_count < self.config.freshness.query_max_hops {
            self.forward_to_first_hand(
                MeshMessage::WhoHasRecent {
                    peer_id,
                    max_age_seconds,
                },
                &envelope.from_peer_id,
                envelope.hop_count + 1,
            )
            .await;
        }
    }

    // ========== shared send helpers ==========

    /// Direct best-endpoint send to a peer's most recent machine
    pub(crate) async fn send_direct_on_channel(
        &self,
        message: MeshMessage,
        peer: &PeerId,
        channel: &str,
    ) -> NodeResult<()> {
        let machine = self
            .registry
            .most_recent_machine(peer)
            .or_else(|| self.endpoints.machines_for_peer(peer).into_iter().next())
            .ok_or_else(|| crate::error::NodeError::PeerNotFound(peer.clone()))?;
        let endpoint = self
            .endpoints
            .get_best_endpoint(peer, machine)
            .ok_or_else(|| crate::error::NodeError::PeerNotFound(peer.clone()))?;
        let addr = parse_endpoint(&endpoint)?;
        self.send_payload_to_addr(Some(peer.clone()), channel, message, addr).await
    }

    /// Direct core-protocol send
    pub(crate) async fn send_core_to_peer(&self, message: MeshMessage, peer: &PeerId) -> NodeResult<()> {
        self.send_direct_on_channel(message, peer, CORE_CHANNEL).await
    }

    /// Re-wrap a payload under our identity and pass it to first-hand
    /// peers, excluding the peer it came from
    pub(crate) async fn forward_to_first_hand(&self, message: MeshMessage, exclude: &PeerId, hop_count: u8) {
        let local = self.local_peer_id();
        let mut forwarded = 0u32;
        for peer in self.first_hand.peers() {
            if forwarded >= self.config.gossip.fanout {
                break;
            }
            if &peer == exclude || peer == local {
                continue;
            }
            let Some(machine) = self.registry.most_recent_machine(&peer) else {
                continue;
            };
            let Some(endpoint) = self.endpoints.get_best_endpoint(&peer, machine) else {
                continue;
            };
            let Ok(addr) = parse_endpoint(&endpoint) else {
                continue;
            };
            let Ok(plaintext) =
                self.seal_payload(Some(peer.clone()), CORE_CHANNEL, message.clone(), hop_count)
            else {
                continue;
            };
            if self.transmit(&plaintext, addr).await.is_ok() {
                forwarded += 1;
            }
        }
    }

    /// All first-hand peers with endpoints, for a full-list exchange
    fn build_full_peer_list(&self, exclude: &PeerId) -> Vec<PeerEndpointInfo> {
        let local = self.local_peer_id();
        let mut list = Vec::new();
        for peer in self.first_hand.peers() {
            if list.len() >= self.config.gossip.max_per_message {
                break;
            }
            if &peer == exclude || peer == local {
                continue;
            }
            let Some(machine) = self.registry.most_recent_machine(&peer) else {
                continue;
            };
            let Some(endpoint) = self.endpoints.get_best_endpoint(&peer, machine) else {
                continue;
            };
            list.push(PeerEndpointInfo {
                peer_id: peer.clone(),
                machine_id: machine,
                endpoint,
                nat_type: self.endpoints.get_nat_type(&peer).unwrap_or_default(),
                is_first_hand: true,
            });
        }
        list
    }

    /// Paths under which other peers can currently reach us
    pub(crate) fn own_reachability(&self) -> Vec<ReachabilityPath> {
        let mut paths = Vec::new();
        if let Some(endpoint) = self.predictor.predict().public_endpoint {
            paths.push(ReachabilityPath::Direct { endpoint });
        } else if let Ok(socket) = self.socket() {
            paths.push(ReachabilityPath::Direct {
                endpoint: format_endpoint(&socket.local_addr()),
            });
        }
        paths
    }

    /// Capabilities this node advertises
    pub(crate) fn own_capabilities(&self) -> Vec<String> {
        let mut capabilities = Vec::new();
        if self.config.can_relay {
            capabilities.push("relay".to_string());
        }
        if self.config.can_coordinate_hole_punch {
            capabilities.push("coordinator".to_string());
        }
        capabilities
    }
}
