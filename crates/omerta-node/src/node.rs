//! The mesh node
//!
//! Owns the socket and wires every subsystem together: identity, envelope
//! codec, endpoint state, gossip, freshness, keepalive, hole punching and
//! relaying. All background work runs in spawned tasks answering to one
//! broadcast shutdown channel; no subsystem lock is ever held across an
//! await.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::{DashMap, DashSet};
use rand::seq::SliceRandom;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use omerta_core::{
    format_endpoint, split_endpoint, DisconnectReason, Identity, Keystore, MachineId, MeshConfig,
    MeshEvent, NatType, PeerAnnouncement, PeerId, ReachabilityPath,
};
use omerta_mesh::{
    sliding_windows, AssociationRegistry, EndpointManager, FirstHandTracker, FreshnessQueryTracker,
    KeepaliveScheduler, NatPredictor, NatPrediction, PathFailureReporter, PeerStore, PingOutcome,
    PropagationQueue, RecentContactTracker,
};
use omerta_punch::{HolePunchCoordinator, ProbeEvent, Puncher};
use omerta_relay::{PotentialRelayTable, RelayForwarder};
use omerta_wire::{
    Envelope, MeshMessage, MessageCipher, MessageDeduplicator, MessageKind, CORE_CHANNEL,
};

use crate::error::{NodeError, NodeResult};
use crate::event_log::{EventLog, EventLogKind, PeerSeenRecord};
use crate::pending::PendingResponses;
use crate::socket::{MeshSocket, MAX_DATAGRAM};

/// Handler for application data on a channel
pub type ChannelHandler = Arc<dyn Fn(MachineId, Vec<u8>) + Send + Sync>;

/// A snapshot of node-wide counters
///
/// Exposed via [`MeshNode::stats`] and appended to `hourly_stats.jsonl`.
#[derive(Debug, Clone, Serialize)]
pub struct MeshStats {
    /// Peers ever observed in the association registry
    pub known_peers: usize,
    /// (peer, machine) pairs with endpoint state
    pub tracked_machines: usize,
    /// Cached announcements
    pub cached_announcements: usize,
    /// Contacts inside the freshness window
    pub recent_contacts: usize,
    /// Facts still queued for gossip
    pub propagation_queue: usize,
    /// Machines under keepalive monitoring
    pub monitored_machines: usize,
    /// Message ids inside the dedup window
    pub dedup_window: usize,
    /// Relay forwarding counters
    pub relay: omerta_relay::RelayStats,
}

/// Where to send a channel message
#[derive(Debug, Clone)]
pub enum Recipient {
    Peer(PeerId),
    Machine(MachineId),
}

/// Considered "new or reconnecting" without contact within this window;
/// triggers a full-list gossip exchange
const FULL_LIST_THRESHOLD: Duration = Duration::from_secs(60);

/// How long a forwarded find-peer query remembers its origin
const FIND_ORIGIN_TTL: Duration = Duration::from_secs(60);

/// TTL on announcements this node signs about itself
pub(crate) const ANNOUNCEMENT_TTL_SECS: u64 = 300;

/// Cadence of the aggregate-stats log entries
const HOURLY_STATS_INTERVAL: Duration = Duration::from_secs(3_600);

pub(crate) struct NodeInner {
    pub(crate) config: MeshConfig,
    pub(crate) identity: Identity,
    pub(crate) machine_id: MachineId,
    pub(crate) network_id: String,
    pub(crate) cipher: MessageCipher,

    pub(crate) socket: StdRwLock<Option<Arc<MeshSocket>>>,
    pub(crate) endpoints: EndpointManager,
    pub(crate) registry: AssociationRegistry,
    pub(crate) peer_store: PeerStore,
    pub(crate) predictor: NatPredictor,
    pub(crate) contacts: RecentContactTracker,
    pub(crate) path_failures: PathFailureReporter,
    pub(crate) freshness_queries: FreshnessQueryTracker,
    pub(crate) propagation: PropagationQueue,
    pub(crate) first_hand: FirstHandTracker,
    pub(crate) keepalive: KeepaliveScheduler,
    pub(crate) relay_table: PotentialRelayTable,
    pub(crate) relay_forwarder: RelayForwarder,
    pub(crate) coordinator: Option<HolePunchCoordinator>,
    pub(crate) puncher: Puncher,
    pub(crate) punch_sessions: DashMap<SocketAddr, mpsc::Sender<ProbeEvent>>,
    /// Which peer each in-flight punch request is aimed at
    pub(crate) punch_peers: DashMap<String, PeerId>,
    pub(crate) find_origins: DashMap<PeerId, (SocketAddr, Instant)>,
    pub(crate) dedup: MessageDeduplicator,
    pub(crate) pending: PendingResponses,
    pub(crate) channels: DashMap<String, ChannelHandler>,
    pub(crate) connected: DashSet<PeerId>,
    /// Lifetime roster behind the peers_seen.json snapshot
    pub(crate) peers_seen: DashMap<PeerId, PeerSeenRecord>,
    pub(crate) last_hourly_stats: StdMutex<Instant>,
    pub(crate) last_nat: StdMutex<NatType>,
    pub(crate) events: broadcast::Sender<MeshEvent>,
    pub(crate) shutdown: broadcast::Sender<()>,
    pub(crate) tasks: StdMutex<Vec<JoinHandle<()>>>,
    pub(crate) running: AtomicBool,
    pub(crate) event_log: Option<EventLog>,
}

impl NodeInner {
    pub(crate) fn socket(&self) -> NodeResult<Arc<MeshSocket>> {
        self.socket
            .read()
            .expect("socket lock")
            .clone()
            .ok_or(NodeError::NotStarted)
    }

    pub(crate) fn emit(&self, event: MeshEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn local_peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    /// Seal a payload into plaintext envelope bytes (binary form)
    pub(crate) fn seal_payload(
        &self,
        to: Option<PeerId>,
        channel: &str,
        payload: MeshMessage,
        hop_count: u8,
    ) -> NodeResult<Vec<u8>> {
        let envelope = Envelope::seal_with_hops(
            &self.identity,
            self.machine_id,
            to,
            channel,
            payload,
            hop_count,
        )?;
        Ok(omerta_wire::encode_binary(&envelope)?)
    }

    /// Encrypt and transmit plaintext envelope bytes
    pub(crate) async fn transmit(&self, plaintext: &[u8], addr: SocketAddr) -> NodeResult<()> {
        let sealed = self.cipher.seal(plaintext)?;
        self.socket()?.send_to(&sealed, addr).await
    }

    /// Seal, encrypt and transmit a payload to an address
    pub(crate) async fn send_payload_to_addr(
        &self,
        to: Option<PeerId>,
        channel: &str,
        payload: MeshMessage,
        addr: SocketAddr,
    ) -> NodeResult<()> {
        let plaintext = self.seal_payload(to, channel, payload, 0)?;
        self.transmit(&plaintext, addr).await
    }

    /// The current NAT verdict, publishing an event when it changes
    pub(crate) fn refresh_nat_prediction(&self) -> NatPrediction {
        let prediction = self.predictor.predict();
        let mut last = self.last_nat.lock().expect("nat lock");
        if *last != prediction.nat_type && prediction.nat_type != NatType::Unknown {
            *last = prediction.nat_type;
            info!(nat = %prediction.nat_type, confidence = prediction.confidence, "NAT type inferred");
            self.emit(MeshEvent::nat_detected(prediction.nat_type, prediction.confidence));
        }
        prediction
    }

    /// Build the gossip payload for a ping to `peer`
    pub(crate) fn build_ping(&self, peer: &PeerId) -> MeshMessage {
        MeshMessage::Ping {
            recent_peers: self.propagation.build_peer_list(
                peer,
                self.config.gossip.max_per_message,
                &self.first_hand,
            ),
            my_nat_type: self.refresh_nat_prediction().nat_type,
            request_full_list: !self.contacts.has_recent_contact(peer, FULL_LIST_THRESHOLD),
        }
    }
}

/// A peer-to-peer mesh node
///
/// Cheap to clone; all state is shared behind the handle.
#[derive(Clone)]
pub struct MeshNode {
    pub(crate) inner: Arc<NodeInner>,
}

impl MeshNode {
    /// Build a node from configuration
    ///
    /// With a data directory configured, identity and machine id are
    /// loaded from (or created in) the keystore there; otherwise both are
    /// generated fresh for this process.
    pub fn new(config: MeshConfig) -> NodeResult<Self> {
        config.validate()?;

        let (identity, machine_id) = match &config.data_dir {
            Some(dir) => {
                let keystore = Keystore::new(dir);
                (
                    keystore.load_or_generate_identity()?,
                    keystore.load_or_generate_machine_id()?,
                )
            }
            None => (Identity::generate(), MachineId::generate()),
        };

        let network_id = config.network.network_id();
        let local_peer = identity.peer_id();
        let cipher = MessageCipher::new(&config.network.key);

        let coordinator = config
            .can_coordinate_hole_punch
            .then(|| HolePunchCoordinator::new(config.coordinator.clone()));
        let event_log = config
            .data_dir
            .as_ref()
            .map(|dir| EventLog::new(dir.join("events")));

        let (events, _) = broadcast::channel(256);
        let (shutdown, _) = broadcast::channel(1);

        info!(
            peer = %local_peer.short_id(),
            machine = %machine_id,
            network = %network_id,
            "Mesh node created"
        );

        let inner = NodeInner {
            identity,
            machine_id,
            network_id: network_id.clone(),
            cipher,
            socket: StdRwLock::new(None),
            endpoints: EndpointManager::new(network_id, config.endpoint_validation),
            registry: AssociationRegistry::new(),
            peer_store: PeerStore::new(config.max_cached_peers),
            predictor: NatPredictor::default(),
            contacts: RecentContactTracker::new(
                config.freshness.max_contacts,
                Duration::from_secs(config.freshness.max_age_secs),
            ),
            path_failures: PathFailureReporter::new(Duration::from_secs(
                config.freshness.report_interval_secs,
            )),
            freshness_queries: FreshnessQueryTracker::new(Duration::from_secs(
                config.freshness.query_interval_secs,
            )),
            propagation: PropagationQueue::new(local_peer.clone(), config.gossip.fanout),
            first_hand: FirstHandTracker::new(),
            keepalive: KeepaliveScheduler::new(config.keepalive.clone()),
            relay_table: PotentialRelayTable::new(local_peer.clone(), config.max_relays),
            relay_forwarder: RelayForwarder::new(config.can_relay),
            coordinator,
            puncher: Puncher::new(local_peer, config.punch.clone()),
            punch_sessions: DashMap::new(),
            punch_peers: DashMap::new(),
            find_origins: DashMap::new(),
            dedup: MessageDeduplicator::default(),
            pending: PendingResponses::new(),
            channels: DashMap::new(),
            connected: DashSet::new(),
            peers_seen: DashMap::new(),
            last_hourly_stats: StdMutex::new(Instant::now()),
            last_nat: StdMutex::new(NatType::Unknown),
            events,
            shutdown,
            tasks: StdMutex::new(Vec::new()),
            running: AtomicBool::new(false),
            event_log,
            config,
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Start the node: bind, load persisted state, spawn background tasks
    ///
    /// Starting an already-started node fails with `AlreadyStarted`.
    pub async fn start(&self) -> NodeResult<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(NodeError::AlreadyStarted);
        }

        let socket = match MeshSocket::bind(self.inner.config.port).await {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                self.inner.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        let port = socket.local_port();
        *self.inner.socket.write().expect("socket lock") = Some(Arc::clone(&socket));

        self.load_persisted_state();

        let mut tasks = Vec::new();
        tasks.push(self.spawn_recv_loop(Arc::clone(&socket)));
        tasks.push(self.spawn_keepalive_ticker());
        tasks.push(self.spawn_gossip_ticker());
        tasks.push(self.spawn_maintenance_ticker());
        *self.inner.tasks.lock().expect("task lock") = tasks;

        self.bootstrap();

        info!(port, peer = %self.inner.local_peer_id().short_id(), "Mesh node started");
        self.inner.emit(MeshEvent::started(port));
        Ok(())
    }

    /// Stop the node: cancel tasks, fail in-flight waits, persist state
    ///
    /// Stopping a stopped node is a no-op.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(peer = %self.inner.local_peer_id().short_id(), "Stopping mesh node");

        let _ = self.inner.shutdown.send(());
        for task in self.inner.tasks.lock().expect("task lock").drain(..) {
            task.abort();
        }
        self.inner.pending.fail_all();
        self.inner.punch_sessions.clear();
        self.save_persisted_state();
        self.flush_observability(true);
        *self.inner.socket.write().expect("socket lock") = None;

        self.inner.emit(MeshEvent::stopped());
    }

    /// Whether the node is currently started
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Our peer id
    pub fn local_peer_id(&self) -> PeerId {
        self.inner.local_peer_id()
    }

    /// Our machine id
    pub fn machine_id(&self) -> MachineId {
        self.inner.machine_id
    }

    /// The bound UDP port
    pub fn local_port(&self) -> NodeResult<u16> {
        Ok(self.inner.socket()?.local_port())
    }

    /// Current NAT inference
    pub fn nat_prediction(&self) -> NatPrediction {
        self.inner.predictor.predict()
    }

    /// Subscribe to mesh events
    ///
    /// Slow subscribers lag and lose the oldest events; they never
    /// back-pressure the node.
    pub fn events(&self) -> broadcast::Receiver<MeshEvent> {
        self.inner.events.subscribe()
    }

    /// A snapshot of node-wide counters
    pub fn stats(&self) -> MeshStats {
        MeshStats {
            known_peers: self.inner.registry.peer_count(),
            tracked_machines: self.inner.endpoints.machine_count(),
            cached_announcements: self.inner.peer_store.len(),
            recent_contacts: self.inner.contacts.len(),
            propagation_queue: self.inner.propagation.len(),
            monitored_machines: self.inner.keepalive.monitored_count(),
            dedup_window: self.inner.dedup.len(),
            relay: self.inner.relay_forwarder.stats(),
        }
    }

    /// Endpoint state, exposed for route inspection and tests
    pub fn endpoints(&self) -> &EndpointManager {
        &self.inner.endpoints
    }

    /// Machine ↔ peer association history
    pub fn associations(&self) -> &AssociationRegistry {
        &self.inner.registry
    }

    /// The announcement cache
    pub fn peer_store(&self) -> &PeerStore {
        &self.inner.peer_store
    }

    /// Register a handler for an application channel
    ///
    /// The empty channel is reserved for the core protocol.
    pub fn on_channel(
        &self,
        channel: &str,
        handler: impl Fn(MachineId, Vec<u8>) + Send + Sync + 'static,
    ) -> NodeResult<()> {
        if channel.is_empty() {
            return Err(NodeError::InvalidConfiguration(
                "empty channel is reserved for the core protocol".to_string(),
            ));
        }
        omerta_wire::validate_channel(channel).map_err(|e| NodeError::InvalidConfiguration(e.to_string()))?;
        self.inner.channels.insert(channel.to_string(), Arc::new(handler));
        Ok(())
    }

    /// Remove a channel handler
    pub fn remove_channel(&self, channel: &str) {
        self.inner.channels.remove(channel);
    }

    /// Send application data on a channel
    pub async fn send_on_channel(
        &self,
        data: Vec<u8>,
        to: Recipient,
        channel: &str,
    ) -> NodeResult<()> {
        if channel.is_empty() {
            return Err(NodeError::InvalidConfiguration(
                "empty channel is reserved for the core protocol".to_string(),
            ));
        }
        match to {
            Recipient::Peer(peer) => {
                self.send_message(MeshMessage::Data { data }, &peer, channel).await
            }
            Recipient::Machine(machine) => {
                let peer = self
                    .inner
                    .registry
                    .most_recent_peer(machine)
                    .ok_or_else(|| NodeError::SendFailed(format!("unknown machine {}", machine)))?;
                let endpoint = self
                    .inner
                    .endpoints
                    .get_best_endpoint(&peer, machine)
                    .ok_or_else(|| NodeError::PeerNotFound(peer.clone()))?;
                let plaintext = self.inner.seal_payload(
                    Some(peer),
                    channel,
                    MeshMessage::Data { data },
                    0,
                )?;
                let addr = omerta_core::parse_endpoint(&endpoint)?;
                self.inner.transmit(&plaintext, addr).await
            }
        }
    }

    /// Send a core-protocol message to a peer
    pub async fn send_to_peer(&self, message: MeshMessage, peer: &PeerId) -> NodeResult<()> {
        self.send_message(message, peer, CORE_CHANNEL).await
    }

    /// Route a message to a peer: relay first for symmetric peers, then
    /// direct to the most recent machine's best endpoint
    async fn send_message(&self, message: MeshMessage, peer: &PeerId, channel: &str) -> NodeResult<()> {
        if self.inner.endpoints.get_nat_type(peer) == Some(NatType::Symmetric) {
            match self.send_via_relay_on_channel(message.clone(), peer, channel).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!(peer = %peer.short_id(), error = %e, "Relay path failed, trying direct");
                }
            }
        }
        self.send_direct(message, peer, channel).await
    }

    /// Send straight to the peer's most recent machine
    async fn send_direct(&self, message: MeshMessage, peer: &PeerId, channel: &str) -> NodeResult<()> {
        self.inner.send_direct_on_channel(message, peer, channel).await
    }

    /// Send a message through a relay
    pub async fn send_via_relay(&self, message: MeshMessage, to: &PeerId) -> NodeResult<()> {
        self.send_via_relay_on_channel(message, to, CORE_CHANNEL).await
    }

    async fn send_via_relay_on_channel(
        &self,
        message: MeshMessage,
        to: &PeerId,
        channel: &str,
    ) -> NodeResult<()> {
        // Gossip-learned candidates first; otherwise fall back to cached
        // announcements advertising the relay capability, best reliability
        // first.
        let mut relays = self.inner.relay_table.relays_for(to);
        if relays.is_empty() {
            relays = self
                .inner
                .peer_store
                .peers_with_capability("relay")
                .into_iter()
                .map(|announcement| announcement.peer_id)
                .filter(|relay| relay != to && *relay != self.local_peer_id())
                .take(self.inner.config.target_relays)
                .collect();
        }
        if relays.is_empty() {
            return Err(NodeError::NoRelaysAvailable);
        }

        // The inner envelope is signed for the target; the relay cannot
        // alter it undetected.
        let inner_bytes = self.inner.seal_payload(Some(to.clone()), channel, message, 0)?;

        for relay in relays {
            let Some(endpoint) = self.relay_endpoint(&relay) else {
                continue;
            };
            let Ok(addr) = omerta_core::parse_endpoint(&endpoint) else {
                continue;
            };

            let forward = MeshMessage::RelayForward {
                target_peer_id: to.clone(),
                payload: inner_bytes.clone(),
            };
            match self
                .inner
                .send_payload_to_addr(Some(relay.clone()), CORE_CHANNEL, forward, addr)
                .await
            {
                Ok(()) => {
                    debug!(target = %to.short_id(), relay = %relay.short_id(), "Sent via relay");
                    return Ok(());
                }
                Err(e) => {
                    warn!(relay = %relay.short_id(), error = %e, "Relay send failed");
                    self.inner.peer_store.record_failure(&relay);
                }
            }
        }
        Err(NodeError::NoRelayAvailable(to.clone()))
    }

    /// Best known endpoint for a relay: live endpoint state first, then
    /// the relay's own advertised direct reachability
    fn relay_endpoint(&self, relay: &PeerId) -> Option<String> {
        if let Some(machine) = self.inner.registry.most_recent_machine(relay) {
            if let Some(endpoint) = self.inner.endpoints.get_best_endpoint(relay, machine) {
                return Some(endpoint);
            }
        }
        self.inner.peer_store.get(relay).and_then(|announcement| {
            announcement.reachability.iter().find_map(|path| match path {
                ReachabilityPath::Direct { endpoint } => Some(endpoint.clone()),
                _ => None,
            })
        })
    }

    /// Send a core-protocol message and await its response
    ///
    /// Responses match by request id when the message carries one,
    /// otherwise by response kind from the expected sender.
    pub async fn send_and_receive(
        &self,
        message: MeshMessage,
        to: &PeerId,
        timeout: Duration,
    ) -> NodeResult<Envelope> {
        self.send_and_receive_on_channel(message, to, CORE_CHANNEL, timeout).await
    }

    /// Send a message on a channel and await its response
    pub async fn send_and_receive_on_channel(
        &self,
        message: MeshMessage,
        to: &PeerId,
        channel: &str,
        timeout: Duration,
    ) -> NodeResult<Envelope> {
        let (_slot, receiver) = match &message {
            MeshMessage::Request { request_id, .. } => self.inner.pending.register_request(request_id),
            other => {
                let kinds = response_kinds(other);
                self.inner.pending.register_kinds(&kinds, Some(to.clone()))
            }
        };

        self.send_message(message, to, channel).await?;

        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::select! {
            result = receiver => result.map_err(|_| NodeError::Stopped),
            _ = tokio::time::sleep(timeout) => Err(NodeError::Timeout),
            _ = shutdown.recv() => Err(NodeError::Stopped),
        }
    }

    /// Ping a peer with sliding-window fallback across its endpoints
    ///
    /// Endpoints of the most recent machine are attempted per the window
    /// plan; the first pong promotes its endpoint and wins.
    pub async fn ping_peer(&self, peer: &PeerId) -> NodeResult<Envelope> {
        let machine = self
            .inner
            .registry
            .most_recent_machine(peer)
            .or_else(|| self.inner.endpoints.machines_for_peer(peer).into_iter().next())
            .ok_or_else(|| NodeError::PeerNotFound(peer.clone()))?;
        let endpoints = self.inner.endpoints.get_endpoints(peer, machine);
        if endpoints.is_empty() {
            return Err(NodeError::PeerNotFound(peer.clone()));
        }

        let attempt_timeout = Duration::from_millis(self.inner.config.keepalive.ping_timeout_ms);
        let budget = self.inner.config.retry.max_attempts as usize;
        let deadline =
            Instant::now() + Duration::from_secs(self.inner.config.connection_timeout_secs);

        for window in sliding_windows(endpoints.len(), budget) {
            for index in window {
                if Instant::now() >= deadline {
                    return Err(NodeError::Timeout);
                }
                let endpoint = &endpoints[index];
                match self.ping_endpoint(peer, endpoint, attempt_timeout).await {
                    Ok(envelope) => {
                        self.inner.endpoints.record_send_success(peer, machine, endpoint);
                        return Ok(envelope);
                    }
                    Err(NodeError::Stopped) => return Err(NodeError::Stopped),
                    Err(e) => {
                        debug!(peer = %peer.short_id(), endpoint, error = %e, "Ping attempt failed");
                    }
                }
            }
        }
        Err(NodeError::Timeout)
    }

    /// One ping attempt to one endpoint
    pub(crate) async fn ping_endpoint(
        &self,
        peer: &PeerId,
        endpoint: &str,
        timeout: Duration,
    ) -> NodeResult<Envelope> {
        let addr = omerta_core::parse_endpoint(endpoint)?;
        let ping = self.inner.build_ping(peer);
        let (_slot, receiver) = self
            .inner
            .pending
            .register_kinds(&[MessageKind::Pong], Some(peer.clone()));

        self.inner
            .send_payload_to_addr(Some(peer.clone()), CORE_CHANNEL, ping, addr)
            .await?;

        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::select! {
            result = receiver => result.map_err(|_| NodeError::Stopped),
            _ = tokio::time::sleep(timeout) => Err(NodeError::Timeout),
            _ = shutdown.recv() => Err(NodeError::Stopped),
        }
    }

    /// Ping an endpoint whose peer identity we do not know yet
    ///
    /// Used for bootstrap contacts; the pong introduces the peer and its
    /// endpoint into every tracker.
    pub async fn ping_address(&self, endpoint: &str, timeout: Duration) -> NodeResult<Envelope> {
        let addr = omerta_core::parse_endpoint(endpoint)?;
        let ping = MeshMessage::Ping {
            recent_peers: Vec::new(),
            my_nat_type: self.inner.predictor.predict().nat_type,
            request_full_list: true,
        };
        let (_slot, receiver) = self.inner.pending.register_kinds(&[MessageKind::Pong], None);
        self.inner
            .send_payload_to_addr(None, CORE_CHANNEL, ping, addr)
            .await?;

        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::select! {
            result = receiver => result.map_err(|_| NodeError::Stopped),
            _ = tokio::time::sleep(timeout) => Err(NodeError::Timeout),
            _ = shutdown.recv() => Err(NodeError::Stopped),
        }
    }

    /// Ask the mesh whether anyone heard from `peer` recently
    ///
    /// The query fans out to first-hand peers with a hop budget and is
    /// rate limited per target peer. Resolves with the first
    /// `i_have_recent` answer.
    pub async fn query_freshness(
        &self,
        peer: &PeerId,
        max_age: Duration,
        timeout: Duration,
    ) -> NodeResult<Envelope> {
        if !self.inner.freshness_queries.try_begin_query(peer) {
            return Err(NodeError::ConnectionFailed(format!(
                "freshness query for {} rate limited",
                peer.short_id()
            )));
        }

        let (_slot, receiver) = self
            .inner
            .pending
            .register_kinds(&[MessageKind::IHaveRecent], None);
        self.inner
            .forward_to_first_hand(
                MeshMessage::WhoHasRecent {
                    peer_id: peer.clone(),
                    max_age_seconds: max_age.as_secs(),
                },
                peer,
                0,
            )
            .await;

        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::select! {
            result = receiver => result.map_err(|_| NodeError::Stopped),
            _ = tokio::time::sleep(timeout) => Err(NodeError::Timeout),
            _ = shutdown.recv() => Err(NodeError::Stopped),
        }
    }

    /// Look up a peer's announcement, asking the mesh on a cache miss
    pub async fn find_peer(&self, peer: &PeerId, timeout: Duration) -> NodeResult<PeerAnnouncement> {
        if let Some(announcement) = self.inner.peer_store.get(peer) {
            return Ok(announcement);
        }

        let (_slot, receiver) = self
            .inner
            .pending
            .register_kinds(&[MessageKind::PeerInfo, MessageKind::PeerNotFound], None);
        self.inner
            .forward_to_first_hand(MeshMessage::FindPeer { peer_id: peer.clone() }, peer, 0)
            .await;

        let mut shutdown = self.inner.shutdown.subscribe();
        let envelope = tokio::select! {
            result = receiver => result.map_err(|_| NodeError::Stopped)?,
            _ = tokio::time::sleep(timeout) => return Err(NodeError::Timeout),
            _ = shutdown.recv() => return Err(NodeError::Stopped),
        };

        match envelope.payload {
            MeshMessage::PeerInfo { announcement } if announcement.peer_id == *peer => Ok(announcement),
            _ => Err(NodeError::PeerNotFound(peer.clone())),
        }
    }

    /// Sign and gossip a fresh announcement of ourselves
    pub async fn announce(&self) -> NodeResult<()> {
        let announcement = PeerAnnouncement::create(
            &self.inner.identity,
            self.inner.own_reachability(),
            self.inner.own_capabilities(),
            ANNOUNCEMENT_TTL_SECS,
        );
        self.inner
            .forward_to_first_hand(
                MeshMessage::Announce { announcement },
                &self.local_peer_id(),
                0,
            )
            .await;
        Ok(())
    }

    /// Ask a coordinator to arrange a hole punch toward `target`
    pub async fn request_hole_punch(&self, via: &PeerId, target: &PeerId) -> NodeResult<()> {
        let socket = self.inner.socket()?;
        let prediction = self.inner.predictor.predict();
        let our_endpoint = prediction
            .public_endpoint
            .unwrap_or_else(|| format_endpoint(&socket.local_addr()));

        let request_id = Uuid::new_v4().to_string();
        self.inner.punch_peers.insert(request_id.clone(), target.clone());
        let request = MeshMessage::HolePunchRequest {
            request_id,
            target_peer_id: target.clone(),
            initiator_endpoint: our_endpoint,
            initiator_nat_type: prediction.nat_type,
        };
        self.send_to_peer(request, via).await
    }

    /// Remember that `via_relay` may reach the symmetric peer `for_peer`
    pub fn record_potential_relay(&self, for_peer: &PeerId, via_relay: &PeerId) {
        self.inner.relay_table.record(for_peer, via_relay);
    }

    // ========== internals ==========

    fn load_persisted_state(&self) {
        let Some(dir) = &self.inner.config.data_dir else {
            return;
        };
        if let Err(e) = self.inner.endpoints.load(&dir.join("peer_endpoints.json")) {
            warn!(error = %e, "Could not load endpoint state");
        }
        if let Err(e) = self.inner.peer_store.load(&dir.join("peers.json")) {
            warn!(error = %e, "Could not load peer cache");
        }
    }

    pub(crate) fn save_persisted_state(&self) {
        let Some(dir) = &self.inner.config.data_dir else {
            return;
        };
        if let Err(e) = self.inner.endpoints.save(&dir.join("peer_endpoints.json")) {
            warn!(error = %e, "Could not save endpoint state");
        }
        if let Err(e) = self.inner.peer_store.save(&dir.join("peers.json")) {
            warn!(error = %e, "Could not save peer cache");
        }
    }

    /// Ping every bootstrap endpoint once, in the background
    fn bootstrap(&self) {
        let mut bootstrap = self.inner.config.network.bootstrap_peers.clone();
        for extra in &self.inner.config.bootstrap_peers {
            if !bootstrap.contains(extra) {
                bootstrap.push(extra.clone());
            }
        }
        if bootstrap.is_empty() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            for endpoint in bootstrap {
                let Ok((host, port)) = split_endpoint(&endpoint) else {
                    warn!(endpoint, "Skipping malformed bootstrap endpoint");
                    continue;
                };
                let addr = match tokio::net::lookup_host((host.as_str(), port)).await {
                    Ok(mut addrs) => addrs.next(),
                    Err(e) => {
                        warn!(endpoint, error = %e, "Bootstrap resolution failed");
                        None
                    }
                };
                let Some(addr) = addr else { continue };

                // We do not know the bootstrap peer's identity yet; its
                // pong will introduce it.
                let ping = MeshMessage::Ping {
                    recent_peers: Vec::new(),
                    my_nat_type: inner.predictor.predict().nat_type,
                    request_full_list: true,
                };
                if let Err(e) = inner.send_payload_to_addr(None, CORE_CHANNEL, ping, addr).await {
                    warn!(endpoint, error = %e, "Bootstrap ping failed");
                }
            }
        });
        self.inner.tasks.lock().expect("task lock").push(handle);
    }

    fn spawn_recv_loop(&self, socket: Arc<MeshSocket>) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    result = socket.recv_from(&mut buf) => {
                        let (len, from) = match result {
                            Ok(ok) => ok,
                            Err(e) => {
                                warn!(error = %e, "Socket receive failed");
                                continue;
                            }
                        };
                        let datagram = buf[..len].to_vec();
                        let inner = Arc::clone(&inner);
                        tokio::spawn(async move {
                            inner.handle_datagram(datagram, from).await;
                        });
                    }
                }
            }
        })
    }

    fn spawn_keepalive_ticker(&self) -> JoinHandle<()> {
        let node = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        let interval = Duration::from_secs(self.inner.config.keepalive.interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // immediate first tick is pointless
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => node.keepalive_cycle().await,
                }
            }
        })
    }

    /// One keepalive cycle: weighted-sample machines, ping, track misses
    async fn keepalive_cycle(&self) {
        let targets = self.inner.keepalive.select_targets();
        let timeout = Duration::from_millis(self.inner.config.keepalive.ping_timeout_ms);

        for (peer, machine) in targets {
            let Some(endpoint) = self.inner.endpoints.get_best_endpoint(&peer, machine) else {
                continue;
            };
            let success = self.ping_endpoint(&peer, &endpoint, timeout).await.is_ok();
            match self.inner.keepalive.record_ping_result(&peer, machine, success) {
                PingOutcome::Healthy => {}
                PingOutcome::Failed => {
                    info!(peer = %peer.short_id(), endpoint, "Machine declared dead by keepalive");
                    let path = ReachabilityPath::Direct {
                        endpoint: endpoint.clone(),
                    };
                    self.inner.path_failures.report_failure(&peer, path.clone(), None);
                    self.inner.contacts.remove_contacts_using_path(&path);
                    self.inner.connected.remove(&peer);
                    self.inner.emit(MeshEvent::peer_disconnected(
                        peer.clone(),
                        DisconnectReason::KeepaliveTimeout,
                    ));
                }
            }
        }
    }

    fn spawn_gossip_ticker(&self) -> JoinHandle<()> {
        let node = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        let interval = Duration::from_secs(self.inner.config.gossip.interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => node.gossip_cycle().await,
                }
            }
        })
    }

    /// One gossip cycle: ping a handful of known machines with peer lists
    async fn gossip_cycle(&self) {
        let mut machines = self.inner.endpoints.all_machines();
        machines.shuffle(&mut rand::rng());
        machines.truncate(self.inner.config.gossip.fanout as usize);

        for (peer, machine) in machines {
            let Some(endpoint) = self.inner.endpoints.get_best_endpoint(&peer, machine) else {
                continue;
            };
            let Ok(addr) = omerta_core::parse_endpoint(&endpoint) else {
                continue;
            };
            let ping = self.inner.build_ping(&peer);
            if let Err(e) = self
                .inner
                .send_payload_to_addr(Some(peer.clone()), CORE_CHANNEL, ping, addr)
                .await
            {
                debug!(peer = %peer.short_id(), error = %e, "Gossip ping failed");
            }
        }
    }

    fn spawn_maintenance_ticker(&self) -> JoinHandle<()> {
        let node = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        let interval = Duration::from_secs(self.inner.config.coordinator.cleanup_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => node.maintenance_cycle(),
                }
            }
        })
    }

    /// One maintenance sweep across every TTL-bounded cache
    fn maintenance_cycle(&self) {
        self.inner.dedup.purge_expired();
        self.inner.contacts.purge_expired();
        self.inner.peer_store.prune_expired();
        self.inner.path_failures.purge_older_than(Duration::from_secs(3_600));
        if let Some(coordinator) = &self.inner.coordinator {
            coordinator.cleanup();
        }
        let now = Instant::now();
        self.inner
            .find_origins
            .retain(|_, (_, at)| now.duration_since(*at) < FIND_ORIGIN_TTL);
        self.save_persisted_state();
        self.flush_observability(false);
    }

    /// Rewrite the peers-seen snapshot and, when due (or forced at stop),
    /// append an aggregate-stats entry
    fn flush_observability(&self, force_stats: bool) {
        let Some(log) = &self.inner.event_log else {
            return;
        };

        let records: BTreeMap<String, PeerSeenRecord> = self
            .inner
            .peers_seen
            .iter()
            .map(|entry| (entry.key().to_string(), entry.value().clone()))
            .collect();
        log.write_peers_seen(records);

        let due = {
            let mut last = self.inner.last_hourly_stats.lock().expect("stats clock lock");
            if force_stats || last.elapsed() >= HOURLY_STATS_INTERVAL {
                *last = Instant::now();
                true
            } else {
                false
            }
        };
        if due {
            log.append(
                EventLogKind::HourlyStats,
                &serde_json::json!({
                    "timestamp": Utc::now(),
                    "stats": self.stats(),
                }),
            );
        }
    }
}

/// Which payload kinds answer a given outbound message
fn response_kinds(message: &MeshMessage) -> Vec<MessageKind> {
    match message {
        MeshMessage::Ping { .. } => vec![MessageKind::Pong],
        MeshMessage::FindPeer { .. } => vec![MessageKind::PeerInfo, MessageKind::PeerNotFound],
        MeshMessage::WhoHasRecent { .. } => vec![MessageKind::IHaveRecent],
        MeshMessage::RelayForward { .. } => vec![MessageKind::RelayForwardResult],
        _ => vec![MessageKind::Response],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use omerta_core::{EndpointValidationMode, NetworkKey};

    fn config() -> MeshConfig {
        MeshConfig::new(NetworkKey::generate("test"))
            .with_endpoint_validation(EndpointValidationMode::AllowAll)
    }

    #[tokio::test]
    async fn test_lifecycle_idempotence() {
        let node = MeshNode::new(config()).unwrap();
        assert!(!node.is_running());
        assert!(matches!(node.local_port(), Err(NodeError::NotStarted)));

        node.start().await.unwrap();
        assert!(node.is_running());
        assert!(node.local_port().unwrap() > 0);
        assert!(matches!(node.start().await, Err(NodeError::AlreadyStarted)));

        node.stop().await;
        assert!(!node.is_running());
        node.stop().await; // second stop is a no-op
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let node = MeshNode::new(config()).unwrap();
        node.start().await.unwrap();
        node.stop().await;
        node.start().await.unwrap();
        assert!(node.is_running());
        node.stop().await;
    }

    #[tokio::test]
    async fn test_channel_registration_rules() {
        let node = MeshNode::new(config()).unwrap();
        assert!(node.on_channel("updates", |_, _| {}).is_ok());
        assert!(node.on_channel("", |_, _| {}).is_err());
        assert!(node.on_channel("bad channel", |_, _| {}).is_err());
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer() {
        let node = MeshNode::new(config()).unwrap();
        node.start().await.unwrap();

        let stranger = PeerId::from_public_key_bytes(&rand::random::<[u8; 32]>());
        let result = node
            .send_to_peer(MeshMessage::data(b"hello".to_vec()), &stranger)
            .await;
        assert!(matches!(result, Err(NodeError::PeerNotFound(_))));

        node.stop().await;
    }

    #[tokio::test]
    async fn test_relay_without_candidates() {
        let node = MeshNode::new(config()).unwrap();
        node.start().await.unwrap();

        let stranger = PeerId::from_public_key_bytes(&rand::random::<[u8; 32]>());
        let result = node
            .send_via_relay(MeshMessage::data(b"x".to_vec()), &stranger)
            .await;
        assert!(matches!(result, Err(NodeError::NoRelaysAvailable)));

        node.stop().await;
    }

    #[test]
    fn test_response_kind_mapping() {
        assert_eq!(
            response_kinds(&MeshMessage::ping(NatType::Unknown)),
            vec![MessageKind::Pong]
        );
        let find = MeshMessage::FindPeer {
            peer_id: PeerId::from_public_key_bytes(&[0u8; 32]),
        };
        assert_eq!(
            response_kinds(&find),
            vec![MessageKind::PeerInfo, MessageKind::PeerNotFound]
        );
    }
}
