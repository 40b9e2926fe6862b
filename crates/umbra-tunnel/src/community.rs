//! The tunnel community: one node's view of the overlay data plane.
//!
//! [`TunnelCommunity`] owns every circuit this node originated, every
//! relay route and exit socket it provides to others, and the correlation
//! caches for in-flight handshakes. All handlers run to completion on one
//! event loop; the owner drives them with UDP receives, the 5-second
//! maintenance tick, the ping tick and drained exit datagrams.
//!
//! ## Packet pipeline
//!
//! An incoming frame with circuit id `c` is relayed verbatim (one crypto
//! layer applied or stripped, id rewritten) when `c` is a known relay
//! route and no handshake of ours is pending on it; otherwise it is
//! processed locally. Outbound frames on own circuits get one encryption
//! layer per hop, outermost for the first hop.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Instant;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

use umbra_crypto::blake3;
use umbra_crypto::ed25519;
use umbra_crypto::tunnel::{self, Direction, NodeIdentity, SessionKeys};
use umbra_crypto::x25519::{is_key_compatible, X25519PublicKey};
use umbra_wire::cell::{self, CellBody};
use umbra_wire::data;
use umbra_wire::{self as wire, Address, PacketKind};

use crate::cache::{
    CircuitRequest, CreateParams, CreatedRequest, PingRequest, RequestCache, RetrySpec,
    StatsHandler, StatsRequest,
};
use crate::circuit::{Circuit, CircuitType, Hop, PendingHop, ReadyCallback, RequiredEndpoint};
use crate::exit::{ExitDatagram, ExitDecision, ExitSocket, SendOutcome};
use crate::external::{Candidate, Endpoint, ExitCandidate, Overlay, SocksGateway};
use crate::relay::RelayRoute;
use crate::selection::{ip_to_circuit_id, RoundRobin, CIRCUIT_ID_PORT};
use crate::settings::TunnelSettings;
use crate::stats::{ByteDirection, EntityKind, Metrics, TunnelStats};
use crate::{
    Result, TunnelError, CIRCUIT_REQUEST_TIMEOUT, CREATED_REQUEST_TIMEOUT,
    MAX_CANDIDATES_IN_CREATED, RETRY_DELAY, STATS_REQUEST_TIMEOUT,
};

/// Options for [`TunnelCommunity::create_circuit`].
#[derive(Default)]
pub struct CircuitOptions {
    /// One-shot callback fired when the circuit becomes ready.
    pub callback: Option<ReadyCallback>,
    /// Failed builds are re-attempted this many times, 5 s apart.
    pub max_retries: u32,
    /// Pin the terminal hop instead of picking an exit candidate.
    pub required_endpoint: Option<RequiredEndpoint>,
    /// Torrent this circuit is built for, if any.
    pub info_hash: Option<[u8; 20]>,
}

/// One node's tunnel data plane.
pub struct TunnelCommunity {
    identity: NodeIdentity,
    settings: TunnelSettings,
    endpoint: Box<dyn Endpoint>,
    overlay: Box<dyn Overlay>,
    gateway: Box<dyn SocksGateway>,
    metrics: Box<dyn Metrics>,

    circuits: BTreeMap<u32, Circuit>,
    relay_from_to: BTreeMap<u32, RelayRoute>,
    relay_session_keys: HashMap<u32, SessionKeys>,
    directions: HashMap<u32, Direction>,
    waiting_for: HashSet<u32>,
    exit_sockets: BTreeMap<u32, ExitSocket>,
    exit_candidates: HashMap<[u8; 32], ExitCandidate>,
    circuits_needed: BTreeMap<u8, usize>,

    circuit_requests: RequestCache<u32, CircuitRequest>,
    created_requests: RequestCache<u32, CreatedRequest>,
    ping_requests: RequestCache<u32, PingRequest>,
    stats_requests: RequestCache<u32, StatsRequest>,
    pending_retries: Vec<(Instant, CreateParams)>,
    stranded_peers: HashSet<SocketAddr>,

    selection: RoundRobin,
    stats: TunnelStats,
    creation_time: Instant,
    exit_events: UnboundedSender<ExitDatagram>,
}

impl TunnelCommunity {
    /// Build a community. The returned receiver carries datagrams arriving
    /// on exit sockets; the owner feeds them back via
    /// [`Self::on_exit_datagram`].
    pub fn new(
        identity: NodeIdentity,
        settings: TunnelSettings,
        endpoint: Box<dyn Endpoint>,
        overlay: Box<dyn Overlay>,
        gateway: Box<dyn SocksGateway>,
        metrics: Box<dyn Metrics>,
    ) -> (Self, UnboundedReceiver<ExitDatagram>) {
        let (exit_events, exit_rx) = mpsc::unbounded_channel();
        let community = Self {
            identity,
            settings,
            endpoint,
            overlay,
            gateway,
            metrics,
            circuits: BTreeMap::new(),
            relay_from_to: BTreeMap::new(),
            relay_session_keys: HashMap::new(),
            directions: HashMap::new(),
            waiting_for: HashSet::new(),
            exit_sockets: BTreeMap::new(),
            exit_candidates: HashMap::new(),
            circuits_needed: BTreeMap::new(),
            circuit_requests: RequestCache::new(),
            created_requests: RequestCache::new(),
            ping_requests: RequestCache::new(),
            stats_requests: RequestCache::new(),
            pending_retries: Vec::new(),
            stranded_peers: HashSet::new(),
            selection: RoundRobin::new(),
            stats: TunnelStats::default(),
            creation_time: Instant::now(),
            exit_events,
        };
        (community, exit_rx)
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn settings(&self) -> &TunnelSettings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut TunnelSettings {
        &mut self.settings
    }

    pub fn circuits(&self) -> &BTreeMap<u32, Circuit> {
        &self.circuits
    }

    pub fn relays(&self) -> &BTreeMap<u32, RelayRoute> {
        &self.relay_from_to
    }

    pub fn exit_sockets(&self) -> &BTreeMap<u32, ExitSocket> {
        &self.exit_sockets
    }

    pub fn stats(&self) -> &TunnelStats {
        &self.stats
    }

    /// Pings still waiting for their pong.
    pub fn outstanding_pings(&self) -> usize {
        self.ping_requests.len()
    }

    /// The relay-crypto direction tag for a circuit id, when one exists.
    pub fn direction_of(&self, circuit_id: u32) -> Option<Direction> {
        self.directions.get(&circuit_id).copied()
    }

    /// Install end-to-end session keys on an RP/rendezvous circuit.
    pub fn set_hs_session_keys(&mut self, circuit_id: u32, keys: SessionKeys) -> bool {
        match self.circuits.get_mut(&circuit_id) {
            Some(circuit) => {
                circuit.set_hs_session_keys(keys);
                true
            }
            None => false,
        }
    }

    /// Overlay callback: a verified candidate introduced itself, carrying
    /// its willingness to exit.
    pub fn on_candidate(&mut self, candidate: &Candidate, become_exit: bool) {
        self.exit_candidates
            .entry(candidate.public_key.to_bytes())
            .and_modify(|e| e.become_exit = become_exit)
            .or_insert(ExitCandidate {
                become_exit,
                first_seen: Instant::now(),
            });
    }

    // ------------------------------------------------------------------
    // Circuit builder
    // ------------------------------------------------------------------

    /// Set the desired number of data circuits of the given length; the
    /// maintenance tick builds toward it.
    pub fn ensure_circuits(&mut self, hops: u8, count: usize) {
        self.circuits_needed.insert(hops, count);
    }

    /// Readiness of the data-circuit pool for the given length, in
    /// `0.0..=1.0`. Also registers demand for that length.
    pub fn tunnels_ready(&mut self, hops: u8) -> f64 {
        if hops == 0 {
            return 1.0;
        }
        self.circuits_needed
            .insert(hops, self.settings.max_circuits.max(1));
        let active = self.active_data_circuits(Some(hops)).len();
        if self.settings.min_circuits > 0 {
            (active as f64 / self.settings.min_circuits as f64).min(1.0)
        } else if active > 0 {
            1.0
        } else {
            0.0
        }
    }

    /// Ready data circuits, optionally restricted to one length,
    /// ascending by id.
    pub fn active_data_circuits(&self, hops: Option<u8>) -> Vec<u32> {
        self.circuits
            .iter()
            .filter(|(_, c)| {
                c.is_ready()
                    && c.ctype == CircuitType::Data
                    && hops.is_none_or(|h| c.goal_hops == h)
            })
            .map(|(id, _)| *id)
            .collect()
    }

    /// Initiate one circuit of `goal_hops` hops. Picks the terminal
    /// endpoint (an exit candidate for data circuits) and a fresh first
    /// hop, then emits `create`. On failure a retry is scheduled when
    /// `max_retries` allows.
    pub fn create_circuit(
        &mut self,
        goal_hops: u8,
        ctype: CircuitType,
        opts: CircuitOptions,
    ) -> Result<u32> {
        let CircuitOptions {
            callback,
            max_retries,
            required_endpoint: original_endpoint,
            info_hash,
        } = opts;

        let verified = self.overlay.verified_candidates();

        let mut required_endpoint = original_endpoint.clone();
        if required_endpoint.is_none() {
            for c in &verified {
                if ctype == CircuitType::Data {
                    let willing = self
                        .exit_candidates
                        .get(&c.public_key.to_bytes())
                        .is_some_and(|e| e.become_exit);
                    if willing {
                        required_endpoint = Some(RequiredEndpoint {
                            address: c.address,
                            public_key: c.public_key,
                        });
                        break;
                    }
                } else {
                    required_endpoint = Some(RequiredEndpoint {
                        address: c.address,
                        public_key: c.public_key,
                    });
                    if c.connectable {
                        break;
                    }
                }
            }
        }

        let Some(required_endpoint) = required_endpoint else {
            debug!("could not create circuit, no available exit candidates");
            self.schedule_retry(goal_hops, ctype, callback, max_retries, original_endpoint, info_hash);
            return Err(TunnelError::NoExitCandidate);
        };

        // A 1-hop circuit goes straight to the required endpoint; longer
        // circuits start at a hop not already fronting another circuit.
        let first_hop = if goal_hops == 1 {
            Some((required_endpoint.address, required_endpoint.public_key))
        } else {
            let used: HashSet<SocketAddr> = self.circuits.values().map(|c| c.first_hop).collect();
            verified
                .iter()
                .find(|c| {
                    !used.contains(&c.address)
                        && is_key_compatible(&c.public_key)
                        && c.address != required_endpoint.address
                })
                .map(|c| (c.address, c.public_key))
        };
        let Some((first_hop_addr, first_hop_pk)) = first_hop else {
            debug!("could not create circuit, no available relay for first hop");
            self.schedule_retry(goal_hops, ctype, callback, max_retries, original_endpoint, info_hash);
            return Err(TunnelError::NoFirstHop);
        };

        let circuit_id = self.generate_circuit_id(Some(first_hop_addr));
        let mut circuit = Circuit::new(
            circuit_id,
            goal_hops,
            first_hop_addr,
            ctype,
            Some(required_endpoint),
            info_hash,
            callback,
        );

        let handshake = tunnel::generate_diffie_secret();
        let node_id = blake3::hash(first_hop_pk.as_bytes());
        let first_part = handshake.first_part.to_bytes();
        circuit.unverified_hop = Some(PendingHop {
            public_key: first_hop_pk,
            address: Some(first_hop_addr),
            handshake,
        });

        debug!(
            circuit_id,
            goal_hops, "creating circuit, first hop {first_hop_addr}"
        );

        let retry = (max_retries > 0).then(|| RetrySpec {
            remaining: max_retries,
            params: CreateParams {
                goal_hops,
                ctype,
                callback: None,
                max_retries: max_retries.saturating_sub(1),
                required_endpoint: original_endpoint,
                info_hash,
            },
        });
        self.circuit_requests
            .insert(circuit_id, CircuitRequest { retry }, CIRCUIT_REQUEST_TIMEOUT);

        self.circuits.insert(circuit_id, circuit);
        self.waiting_for.insert(circuit_id);
        self.metrics.on_created(EntityKind::Circuit);

        let sent = self.send_cell(
            first_hop_addr,
            circuit_id,
            &CellBody::Create(cell::CreatePayload {
                node_id,
                node_public_key: first_hop_pk.to_bytes(),
                key: first_part,
            }),
        );
        self.circuit_bytes_sent(circuit_id, sent as u64);
        Ok(circuit_id)
    }

    fn schedule_retry(
        &mut self,
        goal_hops: u8,
        ctype: CircuitType,
        callback: Option<ReadyCallback>,
        max_retries: u32,
        required_endpoint: Option<RequiredEndpoint>,
        info_hash: Option<[u8; 20]>,
    ) {
        if max_retries == 0 {
            return;
        }
        debug!("will retry circuit creation in {RETRY_DELAY:?}");
        self.pending_retries.push((
            Instant::now() + RETRY_DELAY,
            CreateParams {
                goal_hops,
                ctype,
                callback,
                max_retries: max_retries - 1,
                required_endpoint,
                info_hash,
            },
        ));
    }

    /// Allocate a fresh circuit id: uniformly random, re-sampled on
    /// collision with our circuits or with a relay entry toward the same
    /// neighbour.
    fn generate_circuit_id(&self, neighbour: Option<SocketAddr>) -> u32 {
        loop {
            let circuit_id: u32 = rand::random();
            if circuit_id == 0 || self.circuits.contains_key(&circuit_id) {
                continue;
            }
            if let Some(addr) = neighbour {
                if self
                    .relay_from_to
                    .get(&circuit_id)
                    .is_some_and(|r| r.peer == addr)
                {
                    continue;
                }
            }
            return circuit_id;
        }
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// The 5-second maintenance tick: due retries, circuit pacing, the
    /// lifecycle sweep and request-cache expiry.
    pub fn on_tick(&mut self) {
        let now = Instant::now();

        let (due, later): (Vec<_>, Vec<_>) = self
            .pending_retries
            .drain(..)
            .partition(|(deadline, _)| *deadline <= now);
        self.pending_retries = later;
        for (_, p) in due {
            let _ = self.create_circuit(
                p.goal_hops,
                p.ctype,
                CircuitOptions {
                    callback: p.callback,
                    max_retries: p.max_retries,
                    required_endpoint: p.required_endpoint,
                    info_hash: p.info_hash,
                },
            );
        }

        let needed: Vec<(u8, usize)> = self
            .circuits_needed
            .iter()
            .map(|(hops, target)| (*hops, *target))
            .collect();
        for (hops, target) in needed {
            let have = self
                .circuits
                .values()
                .filter(|c| c.ctype == CircuitType::Data && c.goal_hops == hops)
                .count();
            let missing = target.saturating_sub(have);
            if missing > 0 {
                debug!("want {missing} data circuits of length {hops}");
            }
            for _ in 0..missing {
                if self
                    .create_circuit(hops, CircuitType::Data, CircuitOptions::default())
                    .is_err()
                {
                    break;
                }
            }
        }

        self.do_remove(now);
        self.check_request_timeouts(now);
    }

    /// Sweep circuits, relays and exit sockets past their idle, age or
    /// byte caps, and garbage-collect exit candidates no longer verified.
    fn do_remove(&mut self, now: Instant) {
        let max_inactive = self.settings.max_time_inactive();
        let max_time = self.settings.max_time();
        let max_traffic = self.settings.max_traffic;

        let dead: Vec<(u32, &'static str)> = self
            .circuits
            .iter()
            .filter_map(|(id, c)| {
                if now.duration_since(c.last_incoming) > max_inactive {
                    Some((*id, "no activity"))
                } else if now.duration_since(c.creation_time) > max_time {
                    Some((*id, "too old"))
                } else if c.bytes_up + c.bytes_down > max_traffic {
                    Some((*id, "traffic limit exceeded"))
                } else {
                    None
                }
            })
            .collect();
        for (id, reason) in dead {
            self.remove_circuit(id, reason, false);
        }

        let dead: Vec<(u32, &'static str)> = self
            .relay_from_to
            .iter()
            .filter_map(|(id, r)| {
                if now.duration_since(r.last_incoming) > max_inactive {
                    Some((*id, "no activity"))
                } else if now.duration_since(r.creation_time) > max_time {
                    Some((*id, "too old"))
                } else if r.bytes_up + r.bytes_down > max_traffic {
                    Some((*id, "traffic limit exceeded"))
                } else {
                    None
                }
            })
            .collect();
        for (id, reason) in dead {
            if self.relay_from_to.contains_key(&id) {
                self.remove_relay(id, reason, false, None, false);
            }
        }

        // Exit sockets stay latent legitimately, so only age and byte
        // caps apply; liveness is the originator's problem.
        let dead: Vec<(u32, &'static str)> = self
            .exit_sockets
            .iter()
            .filter_map(|(id, e)| {
                if now.duration_since(e.creation_time) > max_time {
                    Some((*id, "too old"))
                } else if e.bytes_up + e.bytes_down > max_traffic {
                    Some((*id, "traffic limit exceeded"))
                } else {
                    None
                }
            })
            .collect();
        for (id, reason) in dead {
            self.remove_exit_socket(id, reason, false);
        }

        let current: HashSet<[u8; 32]> = self
            .overlay
            .verified_candidates()
            .iter()
            .map(|c| c.public_key.to_bytes())
            .collect();
        let before = self.exit_candidates.len();
        self.exit_candidates.retain(|pk, _| current.contains(pk));
        if self.exit_candidates.len() < before {
            debug!(
                "dropped {} unverified exit candidates",
                before - self.exit_candidates.len()
            );
        }
    }

    fn check_request_timeouts(&mut self, now: Instant) {
        for (circuit_id, request) in self.circuit_requests.take_expired(now) {
            let pending = self
                .circuits
                .get(&circuit_id)
                .is_some_and(|c| !c.is_ready());
            if !pending {
                continue;
            }
            let callback = self
                .circuits
                .get_mut(&circuit_id)
                .and_then(|c| c.ready_callback.take());
            warn!(circuit_id, "timeout waiting for handshake response");
            self.remove_circuit(circuit_id, "timeout", false);
            if let Some(mut retry) = request.retry {
                if retry.remaining > 0 {
                    retry.params.callback = callback;
                    self.pending_retries
                        .push((now + RETRY_DELAY, retry.params));
                }
            }
        }

        let _ = self.created_requests.take_expired(now);

        let ping_timeout = self.settings.ping_timeout();
        for (identifier, ping) in self.ping_requests.take_expired(now) {
            let timed_out = self
                .circuits
                .get(&ping.circuit_id)
                .is_some_and(|c| now.duration_since(c.last_incoming) > ping_timeout);
            if timed_out {
                debug!(identifier, circuit_id = ping.circuit_id, "no response on ping");
                self.remove_circuit(ping.circuit_id, "ping timeout", false);
            }
        }

        let _ = self.stats_requests.take_expired(now);
    }

    /// The slower ping tick: probe every ready circuit except rendezvous
    /// ones, which carry their own end-to-end traffic.
    pub fn on_ping_tick(&mut self) {
        let targets: Vec<(u32, SocketAddr)> = self
            .circuits
            .values()
            .filter(|c| c.is_ready() && c.ctype != CircuitType::Rendezvous)
            .map(|c| (c.circuit_id, c.first_hop))
            .collect();
        for (circuit_id, first_hop) in targets {
            let identifier = loop {
                let id: u32 = rand::random();
                if !self.ping_requests.has(&id) {
                    break id;
                }
            };
            self.ping_requests.insert(
                identifier,
                PingRequest { circuit_id },
                self.settings.ping_timeout(),
            );
            let sent = self.send_cell(
                first_hop,
                circuit_id,
                &CellBody::Ping(cell::PingPayload { identifier }),
            );
            self.circuit_bytes_sent(circuit_id, sent as u64);
        }
    }

    // ------------------------------------------------------------------
    // Ingress
    // ------------------------------------------------------------------

    /// Single ingress callback for every tunnel frame arriving on the UDP
    /// endpoint.
    pub fn on_packet(&mut self, source: SocketAddr, packet: &[u8]) {
        if wire::is_data(packet) {
            self.on_data(source, packet);
            return;
        }
        let Ok(circuit_id) = wire::circuit_id(packet, PacketKind::Cell) else {
            return;
        };
        let Ok(cell_type) = cell::cell_type(packet) else {
            return;
        };
        if cell::is_relayable(cell_type) {
            self.handle_cell(source, circuit_id, cell_type, packet);
        } else {
            self.handle_link_cell(source, circuit_id, cell_type, packet);
        }
    }

    /// True when packets on this id are forwarded rather than processed.
    fn is_relay(&self, circuit_id: u32) -> bool {
        circuit_id > 0
            && self.relay_from_to.contains_key(&circuit_id)
            && !self.waiting_for.contains(&circuit_id)
    }

    /// Pure forward: one crypto layer, id rewrite, emit to the next
    /// neighbour. Returns false when the packet is ours to process.
    fn relay_packet(&mut self, circuit_id: u32, kind: PacketKind, packet: &[u8]) -> bool {
        if !self.is_relay(circuit_id) {
            return false;
        }
        let Some(next) = self.relay_from_to.get(&circuit_id) else {
            return false;
        };
        let (next_circuit_id, next_addr, rendezvous) =
            (next.circuit_id, next.peer, next.rendezvous_relay);

        if let Some(this_relay) = self.relay_from_to.get_mut(&next_circuit_id) {
            this_relay.last_incoming = Instant::now();
        }
        self.relay_bytes_received(next_circuit_id, packet.len() as u64);

        let Ok((plaintext, encrypted)) = wire::split_encrypted(packet, kind) else {
            return true;
        };

        // A rendezvous point bridges two independent onion layers:
        // decrypt with the inbound circuit's keys, re-encrypt with the
        // outbound circuit's keys.
        let processed = if rendezvous {
            self.crypto_in(circuit_id, encrypted, false)
                .and_then(|plain| self.crypto_out(next_circuit_id, plain, false))
        } else {
            self.crypto_relay(circuit_id, encrypted)
        };
        let processed = match processed {
            Ok(p) => p,
            Err(e) => {
                warn!(circuit_id, "relay crypto failed, dropping packet: {e}");
                return true;
            }
        };

        let mut out = Vec::with_capacity(plaintext.len() + processed.len());
        out.extend_from_slice(plaintext);
        out.extend_from_slice(&processed);
        if wire::swap_circuit_id(&mut out, kind, next_circuit_id).is_err() {
            return true;
        }

        let sent = self.send_packet(next_addr, &out);
        self.relay_bytes_sent(circuit_id, sent as u64);
        true
    }

    fn handle_cell(&mut self, source: SocketAddr, circuit_id: u32, cell_type: u8, packet: &[u8]) {
        if self.relay_packet(circuit_id, PacketKind::Cell, packet) {
            return;
        }

        let Ok((_, encrypted)) = wire::split_encrypted(packet, PacketKind::Cell) else {
            return;
        };
        let body = if cell::is_encrypted(cell_type) {
            match self.crypto_in(circuit_id, encrypted, false) {
                Ok(b) => b,
                Err(e) => {
                    warn!(
                        circuit_id,
                        "failed to decrypt {} cell: {e}",
                        cell::cell_name(cell_type)
                    );
                    return;
                }
            }
        } else {
            encrypted.to_vec()
        };

        let cell_body = match cell::decode_cell_body(cell_type, &body) {
            Ok(c) => c,
            Err(e) => {
                warn!(circuit_id, "undecodable cell from {source}: {e}");
                return;
            }
        };
        debug!(circuit_id, "got {} from {source}", cell_body.name());

        if let Some(circuit) = self.circuits.get_mut(&circuit_id) {
            circuit.beat_heart();
        }
        self.circuit_bytes_received(circuit_id, packet.len() as u64);

        match cell_body {
            CellBody::Create(p) => self.on_create(source, circuit_id, p),
            CellBody::Created(p) => self.on_created(source, circuit_id, p),
            CellBody::Extend(p) => self.on_extend(source, circuit_id, p),
            CellBody::Extended(p) => self.on_extended(source, circuit_id, p),
            CellBody::Ping(p) => self.on_ping(source, circuit_id, p),
            CellBody::Pong(p) => self.on_pong(source, circuit_id, p),
            other => warn!(circuit_id, "unexpected {} on circuit path", other.name()),
        }
    }

    fn handle_link_cell(
        &mut self,
        source: SocketAddr,
        circuit_id: u32,
        cell_type: u8,
        packet: &[u8],
    ) {
        let Ok((_, body)) = wire::split_encrypted(packet, PacketKind::Cell) else {
            return;
        };
        match cell::decode_cell_body(cell_type, body) {
            Ok(CellBody::Destroy(p)) => self.on_destroy(source, circuit_id, p),
            Ok(CellBody::StatsRequest(p)) => self.on_stats_request(source, p),
            Ok(CellBody::StatsResponse(p)) => self.on_stats_response(source, p),
            Ok(other) => warn!("unexpected {} on link path", other.name()),
            Err(e) => warn!("undecodable link cell from {source}: {e}"),
        }
    }

    // ------------------------------------------------------------------
    // Handshake handlers
    // ------------------------------------------------------------------

    fn on_create(&mut self, source: SocketAddr, circuit_id: u32, payload: cell::CreatePayload) {
        // A replayed create addressed to another node fails here.
        if payload.node_id != self.identity.node_id()
            || payload.node_public_key != self.identity.tunnel_public().to_bytes()
        {
            warn!(circuit_id, "dropping create from {source}: node identity mismatch");
            return;
        }
        if self.relay_from_to.len() + self.exit_sockets.len() >= self.settings.max_relays_or_exits
        {
            error!(
                circuit_id,
                "ignoring create from {source}: too many relays ({})",
                self.relay_from_to.len() + self.exit_sockets.len()
            );
            return;
        }
        if self.created_requests.has(&circuit_id) {
            error!(circuit_id, "circuit id collision in create from {source}");
            return;
        }

        let first_part = X25519PublicKey::from_bytes(payload.key);
        let (secret, y, auth) =
            match tunnel::generate_diffie_shared_secret(&first_part, self.identity.tunnel_secret())
            {
                Ok(v) => v,
                Err(e) => {
                    warn!(circuit_id, "create handshake failed: {e}");
                    return;
                }
            };

        self.directions.insert(circuit_id, Direction::ExitNode);
        self.relay_session_keys
            .insert(circuit_id, SessionKeys::derive(&secret));
        info!(circuit_id, "joined circuit with neighbour {source}");

        // Offer the initiator relay material for its next extend. Exit
        // candidates are reserved for the initiator's own terminal pick.
        let verified = self.overlay.verified_candidates();
        let member_id = verified
            .iter()
            .find(|c| c.address == source)
            .and_then(|c| c.member_id);
        let mut candidates: HashMap<[u8; 32], SocketAddr> = HashMap::new();
        let mut candidate_keys: Vec<[u8; 32]> = Vec::new();
        for c in &verified {
            let pk = c.public_key.to_bytes();
            if self
                .exit_candidates
                .get(&pk)
                .is_some_and(|e| e.become_exit)
            {
                continue;
            }
            if candidates.contains_key(&pk) {
                continue;
            }
            candidates.insert(pk, c.address);
            candidate_keys.push(pk);
            if candidates.len() >= MAX_CANDIDATES_IN_CREATED {
                break;
            }
        }

        self.created_requests.insert(
            circuit_id,
            CreatedRequest {
                peer: source,
                candidates,
            },
            CREATED_REQUEST_TIMEOUT,
        );
        self.exit_sockets
            .insert(circuit_id, ExitSocket::new(circuit_id, source, member_id));
        self.metrics.on_created(EntityKind::ExitSocket);

        let sealed_list = match wire::cbor::to_vec(&candidate_keys).map_err(TunnelError::from).and_then(
            |plain| {
                let keys = self
                    .relay_session_keys
                    .get_mut(&circuit_id)
                    .ok_or(TunnelError::UnknownCircuit(circuit_id))?;
                Ok(keys.seal(Direction::ExitNode, &plain)?)
            },
        ) {
            Ok(sealed) => sealed,
            Err(e) => {
                warn!(circuit_id, "cannot seal candidate list: {e}");
                return;
            }
        };
        self.send_cell(
            source,
            circuit_id,
            &CellBody::Created(cell::CreatedPayload {
                key: y.to_bytes(),
                auth,
                candidate_list: sealed_list,
            }),
        );
    }

    fn on_created(&mut self, source: SocketAddr, circuit_id: u32, payload: cell::CreatedPayload) {
        if !self.waiting_for.remove(&circuit_id) {
            error!(circuit_id, "unexpected created from {source}");
            return;
        }
        self.directions.insert(circuit_id, Direction::Originator);

        if let Some(forward) = self.relay_from_to.get(&circuit_id) {
            // We extended this circuit for someone else; hand the reply
            // back as extended.
            let (forward_id, forward_addr) = (forward.circuit_id, forward.peer);
            debug!(circuit_id, "forwarding created as extended to {forward_addr}");
            self.send_cell(
                forward_addr,
                forward_id,
                &CellBody::Extended(cell::ExtendedPayload {
                    key: payload.key,
                    auth: payload.auth,
                    candidate_list: payload.candidate_list,
                }),
            );
            return;
        }

        if self.circuits.contains_key(&circuit_id) {
            if !self.circuit_requests.has(&circuit_id) {
                warn!(circuit_id, "created with no matching circuit request");
                return;
            }
            self.ours_on_created_extended(
                circuit_id,
                payload.key,
                payload.auth,
                payload.candidate_list,
            );
        }
    }

    fn on_extended(&mut self, source: SocketAddr, circuit_id: u32, payload: cell::ExtendedPayload) {
        if !self.circuits.contains_key(&circuit_id) {
            warn!(circuit_id, "extended for unknown circuit from {source}");
            return;
        }
        if !self.circuit_requests.has(&circuit_id) {
            warn!(circuit_id, "extended with no matching circuit request");
            return;
        }
        self.ours_on_created_extended(circuit_id, payload.key, payload.auth, payload.candidate_list);
    }

    /// Shared tail of `created`/`extended` on a circuit we originated:
    /// finish the hop handshake, then either issue the next `extend` or
    /// declare the circuit ready.
    fn ours_on_created_extended(
        &mut self,
        circuit_id: u32,
        key: [u8; 32],
        auth: [u8; 32],
        candidate_list: Vec<u8>,
    ) {
        let my_pubkey = self.identity.tunnel_public().to_bytes();

        let verified = {
            let Some(circuit) = self.circuits.get_mut(&circuit_id) else {
                return;
            };
            let Some(pending) = circuit.unverified_hop.take() else {
                warn!(circuit_id, "created/extended without a pending hop");
                return;
            };
            let y = X25519PublicKey::from_bytes(key);
            match tunnel::verify_and_generate_shared_secret(
                &pending.handshake,
                &y,
                &auth,
                &pending.public_key,
            ) {
                Ok(secret) => {
                    circuit.hops.push(Hop {
                        public_key: pending.public_key,
                        address: pending.address,
                        session_keys: SessionKeys::derive(&secret),
                    });
                    true
                }
                Err(e) => {
                    warn!(circuit_id, "hop verification failed: {e}");
                    false
                }
            }
        };
        if !verified {
            self.remove_circuit(circuit_id, "error while verifying shared secret", false);
            return;
        }

        enum Step {
            Ready,
            Extend {
                public_key: X25519PublicKey,
                address: Option<SocketAddr>,
                first_hop: SocketAddr,
            },
            NoCandidates,
            BadCandidateList,
        }

        let step = {
            let Some(circuit) = self.circuits.get(&circuit_id) else {
                return;
            };
            if circuit.is_ready() {
                Step::Ready
            } else {
                let mut ignore: Vec<[u8; 32]> =
                    circuit.hops.iter().map(|h| h.public_key.to_bytes()).collect();
                ignore.push(my_pubkey);
                if let Some(re) = &circuit.required_endpoint {
                    ignore.push(re.public_key.to_bytes());
                }

                let become_exit = circuit.goal_hops as usize == circuit.hops.len() + 1;
                let pinned = if become_exit {
                    circuit.required_endpoint.clone()
                } else {
                    None
                };

                if let Some(re) = pinned {
                    // The terminal hop is pinned, e.g. when linking e2e
                    // circuits or targeting a chosen exit.
                    Step::Extend {
                        public_key: re.public_key,
                        address: Some(re.address),
                        first_hop: circuit.first_hop,
                    }
                } else {
                    let Some(last_hop) = circuit.hops.last() else {
                        return;
                    };
                    match last_hop
                        .session_keys
                        .open(Direction::ExitNode, &candidate_list)
                        .map_err(TunnelError::from)
                        .and_then(|plain| {
                            Ok(wire::cbor::from_slice::<Vec<[u8; 32]>>(&plain)?)
                        }) {
                        Err(e) => {
                            warn!(circuit_id, "cannot read candidate list: {e}");
                            Step::BadCandidateList
                        }
                        Ok(list) => {
                            let pick = list
                                .into_iter()
                                .filter(|pk| !ignore.contains(pk))
                                .map(X25519PublicKey::from_bytes)
                                .find(is_key_compatible);
                            match pick {
                                Some(public_key) => Step::Extend {
                                    public_key,
                                    address: None,
                                    first_hop: circuit.first_hop,
                                },
                                None => Step::NoCandidates,
                            }
                        }
                    }
                }
            }
        };

        match step {
            Step::Ready => {
                self.circuit_requests.pop(&circuit_id);
                info!(circuit_id, "circuit ready");
                self.readd_stranded_peers();
                if let Some(callback) = self
                    .circuits
                    .get_mut(&circuit_id)
                    .and_then(|c| c.ready_callback.take())
                {
                    callback(circuit_id);
                }
            }
            Step::NoCandidates => {
                self.remove_circuit(circuit_id, "no candidates to extend", false);
            }
            Step::BadCandidateList => {
                self.remove_circuit(circuit_id, "error decrypting candidate list", false);
            }
            Step::Extend {
                public_key,
                address,
                first_hop,
            } => {
                let handshake = tunnel::generate_diffie_secret();
                let node_id = blake3::hash(public_key.as_bytes());
                let first_part = handshake.first_part.to_bytes();
                if let Some(circuit) = self.circuits.get_mut(&circuit_id) {
                    circuit.unverified_hop = Some(PendingHop {
                        public_key,
                        address,
                        handshake,
                    });
                }
                info!(
                    circuit_id,
                    "extending circuit with {}",
                    hex::encode(&public_key.as_bytes()[..8])
                );
                let sent = self.send_cell(
                    first_hop,
                    circuit_id,
                    &CellBody::Extend(cell::ExtendPayload {
                        node_id,
                        node_public_key: public_key.to_bytes(),
                        node_addr: address.map(Address::from),
                        key: first_part,
                    }),
                );
                self.circuit_bytes_sent(circuit_id, sent as u64);
            }
        }
    }

    fn on_extend(&mut self, source: SocketAddr, circuit_id: u32, payload: cell::ExtendPayload) {
        let Some(request) = self.created_requests.pop(&circuit_id) else {
            warn!(circuit_id, "dropping extend with no matching created request");
            return;
        };

        let extend_addr = if let Some(addr) = request.candidates.get(&payload.node_public_key) {
            *addr
        } else if let Some(addr) = payload
            .node_addr
            .as_ref()
            .and_then(|a| SocketAddr::try_from(a).ok())
        {
            addr
        } else {
            error!(circuit_id, "cancelling extend, no candidate");
            return;
        };

        // A previous extend attempt on this circuit is forgotten; the
        // initiator is retrying with another candidate.
        if let Some(stale) = self.relay_from_to.remove(&circuit_id) {
            self.relay_from_to.remove(&stale.circuit_id);
            self.waiting_for.remove(&stale.circuit_id);
        }

        // Not the exit after all: drop the latent exit socket, keep the
        // session keys for the relay role.
        self.remove_exit_socket_inner(circuit_id, "extending", false, true);

        let new_circuit_id = self.generate_circuit_id(Some(extend_addr));
        self.waiting_for.insert(new_circuit_id);

        let mut toward_origin = RelayRoute::new(circuit_id, source, false);
        toward_origin.member_id = self.member_id_for(source);
        let mut toward_exit = RelayRoute::new(new_circuit_id, extend_addr, false);
        toward_exit.member_id = self.member_id_for(extend_addr);
        self.relay_from_to.insert(new_circuit_id, toward_origin);
        self.relay_from_to.insert(circuit_id, toward_exit);
        self.metrics.on_created(EntityKind::Relay);

        self.directions.insert(new_circuit_id, Direction::Originator);
        self.directions.insert(circuit_id, Direction::ExitNode);

        info!(
            circuit_id,
            new_circuit_id, "extending circuit toward {extend_addr}"
        );
        self.send_cell(
            extend_addr,
            new_circuit_id,
            &CellBody::Create(cell::CreatePayload {
                node_id: payload.node_id,
                node_public_key: payload.node_public_key,
                key: payload.key,
            }),
        );
    }

    fn member_id_for(&self, addr: SocketAddr) -> Option<[u8; 32]> {
        self.overlay
            .verified_candidates()
            .iter()
            .find(|c| c.address == addr)
            .and_then(|c| c.member_id)
    }

    // ------------------------------------------------------------------
    // Ping
    // ------------------------------------------------------------------

    fn on_ping(&mut self, source: SocketAddr, circuit_id: u32, payload: cell::PingPayload) {
        // Only a terminal hop answers; everything else relays the cell.
        if self.exit_sockets.is_empty() {
            error!(circuit_id, "got ping from {source}, not responding");
            return;
        }
        self.send_cell(
            source,
            circuit_id,
            &CellBody::Pong(cell::PongPayload {
                identifier: payload.identifier,
            }),
        );
    }

    fn on_pong(&mut self, source: SocketAddr, _circuit_id: u32, payload: cell::PongPayload) {
        if self.ping_requests.pop(&payload.identifier).is_none() {
            warn!("invalid pong identifier from {source}");
        }
    }

    // ------------------------------------------------------------------
    // Link cells: destroy and stats
    // ------------------------------------------------------------------

    fn on_destroy(&mut self, source: SocketAddr, circuit_id: u32, payload: cell::DestroyPayload) {
        let Ok(verifying_key) = ed25519::VerifyingKey::from_bytes(&payload.public_key) else {
            warn!(circuit_id, "destroy with invalid key from {source}");
            return;
        };
        let Ok(sig_bytes) = <[u8; 64]>::try_from(payload.signature.as_slice()) else {
            warn!(circuit_id, "destroy with malformed signature from {source}");
            return;
        };
        let signature = ed25519::Signature::from_bytes(&sig_bytes);
        if verifying_key
            .verify(&cell::destroy_signed_bytes(circuit_id, payload.reason), &signature)
            .is_err()
        {
            warn!(circuit_id, "destroy with bad signature from {source}");
            return;
        }

        debug!(circuit_id, reason = payload.reason, "got destroy from {source}");
        if self.relay_from_to.contains_key(&circuit_id) {
            self.remove_relay(circuit_id, "got destroy", true, Some((circuit_id, source)), true);
        } else if let Some(exit) = self.exit_sockets.get(&circuit_id) {
            if exit.origin != source {
                error!(circuit_id, "{source} not allowed to send destroy");
                return;
            }
            self.remove_exit_socket(circuit_id, "got destroy", false);
        } else if let Some(circuit) = self.circuits.get(&circuit_id) {
            if circuit.first_hop != source {
                error!(circuit_id, "{source} not allowed to send destroy");
                return;
            }
            self.remove_circuit(circuit_id, "got destroy", false);
        } else {
            error!(circuit_id, "destroy for unknown circuit from {source}");
        }
    }

    /// Crawl a peer's tunnel statistics.
    pub fn do_stats(&mut self, peer: SocketAddr, handler: StatsHandler) {
        let identifier = loop {
            let id: u32 = rand::random();
            if !self.stats_requests.has(&id) {
                break id;
            }
        };
        self.stats_requests
            .insert(identifier, StatsRequest { handler }, STATS_REQUEST_TIMEOUT);
        let signature = self
            .identity
            .sign(&cell::stats_request_signed_bytes(identifier));
        self.send_cell(
            peer,
            0,
            &CellBody::StatsRequest(cell::StatsRequestPayload {
                identifier,
                public_key: self.identity.verifying_key().to_bytes(),
                signature: signature.to_bytes().to_vec(),
            }),
        );
    }

    fn on_stats_request(&mut self, source: SocketAddr, payload: cell::StatsRequestPayload) {
        if !verify_link_signature(
            &payload.public_key,
            &payload.signature,
            &cell::stats_request_signed_bytes(payload.identifier),
        ) {
            warn!("stats request with bad signature from {source}");
            return;
        }
        let member_id = blake3::hash(&payload.public_key);
        if !self.settings.crawler_member_ids.contains(&member_id) {
            error!("got stats request from unknown crawler {source}");
            return;
        }

        let stats = self.stats.snapshot(self.creation_time.elapsed());
        let Ok(signed) = cell::stats_response_signed_bytes(payload.identifier, &stats) else {
            return;
        };
        let signature = self.identity.sign(&signed);
        self.send_cell(
            source,
            0,
            &CellBody::StatsResponse(cell::StatsResponsePayload {
                identifier: payload.identifier,
                stats,
                public_key: self.identity.verifying_key().to_bytes(),
                signature: signature.to_bytes().to_vec(),
            }),
        );
    }

    fn on_stats_response(&mut self, source: SocketAddr, payload: cell::StatsResponsePayload) {
        let Ok(signed) = cell::stats_response_signed_bytes(payload.identifier, &payload.stats)
        else {
            return;
        };
        if !verify_link_signature(&payload.public_key, &payload.signature, &signed) {
            warn!("stats response with bad signature from {source}");
            return;
        }
        let Some(request) = self.stats_requests.pop(&payload.identifier) else {
            error!("unexpected stats response from {source}");
            return;
        };
        info!("received stats response from {source}");
        (request.handler)(source, payload.stats);
    }

    // ------------------------------------------------------------------
    // Data plane
    // ------------------------------------------------------------------

    /// Pick a circuit for an egress destination. Rendezvous circuits are
    /// addressed through the synthetic circuit-id address on the reserved
    /// port; everything else round-robins over ready data circuits.
    pub fn select_circuit(&mut self, destination: Option<&Address>, hops: Option<u8>) -> Option<u32> {
        if let Some(Address::V4(ip, port)) = destination {
            if *port == CIRCUIT_ID_PORT {
                let circuit_id = ip_to_circuit_id(*ip);
                if let Some(circuit) = self.circuits.get(&circuit_id) {
                    if circuit.is_ready() && circuit.ctype == CircuitType::Rendezvous {
                        return Some(circuit_id);
                    }
                }
            }
        }
        let ids = self.active_data_circuits(hops);
        self.selection.next(&ids)
    }

    /// Send an application datagram through a circuit toward its ultimate
    /// destination.
    pub fn tunnel_data_to_end(&mut self, destination: &Address, data: &[u8], circuit_id: u32) {
        let Some(first_hop) = self.circuits.get(&circuit_id).map(|c| c.first_hop) else {
            warn!(circuit_id, "cannot tunnel data on unknown circuit");
            return;
        };
        debug!(circuit_id, "tunnelling data toward {destination}");
        let packet = data::encode_data(circuit_id, destination, &Address::NULL, data);
        let sent = self.send_data(first_hop, circuit_id, packet);
        self.circuit_bytes_sent(circuit_id, sent as u64);
    }

    /// Wrap a datagram arriving from the Internet and send it back toward
    /// the circuit's originator.
    fn tunnel_data_to_origin(
        &mut self,
        circuit_id: u32,
        previous_hop: SocketAddr,
        source: Address,
        data: &[u8],
    ) {
        debug!(circuit_id, "tunnelling data back to origin via {previous_hop}");
        let packet = data::encode_data(circuit_id, &Address::NULL, &source, data);
        self.send_data(previous_hop, circuit_id, packet);
    }

    /// Ingress for data frames.
    pub fn on_data(&mut self, source: SocketAddr, packet: &[u8]) {
        let Ok(circuit_id) = wire::circuit_id(packet, PacketKind::Data) else {
            return;
        };
        debug!(circuit_id, "got data from {source}");
        if self.relay_packet(circuit_id, PacketKind::Data, packet) {
            return;
        }

        let Ok((plaintext, encrypted)) = wire::split_encrypted(packet, PacketKind::Data) else {
            return;
        };
        let decrypted = match self.crypto_in(circuit_id, encrypted, true) {
            Ok(d) => d,
            Err(e) => {
                warn!(circuit_id, "failed to decrypt data: {e}");
                return;
            }
        };
        let mut full = plaintext.to_vec();
        full.extend_from_slice(&decrypted);
        let Ok((_, destination, origin, payload)) = data::decode_data(&full) else {
            warn!(circuit_id, "undecodable data frame from {source}");
            return;
        };

        // Ours when it came down our own circuit: from the first hop,
        // with a real origin (or on an e2e circuit, whose far initiator
        // sends with the null origin).
        let ours = self
            .circuits
            .get(&circuit_id)
            .is_some_and(|c| c.first_hop == source && (!origin.is_null() || c.ctype != CircuitType::Data));
        if ours {
            if let Some(circuit) = self.circuits.get_mut(&circuit_id) {
                circuit.beat_heart();
            }
            self.circuit_bytes_received(circuit_id, packet.len() as u64);
            if self.overlay.is_overlay_payload(&payload) {
                self.overlay.deliver_overlay(&origin, &payload);
            } else {
                let anon_seed = self
                    .circuits
                    .get(&circuit_id)
                    .is_some_and(|c| c.ctype == CircuitType::Rp);
                self.gateway
                    .on_incoming_from_tunnel(circuit_id, &origin, &payload, anon_seed);
            }
        } else if !destination.is_null() {
            self.exit_data(circuit_id, source, destination, &payload);
        } else {
            error!(circuit_id, "cannot exit data, destination is null");
        }
    }

    /// Egress at the last hop.
    fn exit_data(&mut self, circuit_id: u32, source: SocketAddr, destination: Address, data: &[u8]) {
        if !self.settings.become_exitnode && !self.overlay.is_overlay_payload(data) {
            error!(
                circuit_id,
                "dropping data packet, refusing to be an exit node"
            );
            return;
        }
        let max = self.settings.max_packets_without_reply;
        let events = self.exit_events.clone();
        let Some(exit) = self.exit_sockets.get_mut(&circuit_id) else {
            error!(circuit_id, "dropping data packet with unknown circuit");
            return;
        };
        if !exit.enabled() {
            if exit.origin != source {
                error!(
                    circuit_id,
                    "data from {source} does not match exit origin {}", exit.origin
                );
                return;
            }
            if let Err(e) = exit.enable(events) {
                error!(circuit_id, "cannot enable exit socket: {e}");
                return;
            }
        }
        match exit.send_to(data, &destination, max) {
            SendOutcome::Sent(sent) => self.exit_bytes_sent(circuit_id, sent as u64),
            SendOutcome::AbuseTripped => {
                error!(
                    circuit_id,
                    "too many packets to a destination without a reply, removing exit socket"
                );
                self.remove_exit_socket(circuit_id, "too many packets without reply", true);
            }
            SendOutcome::Dropped => {}
        }
    }

    /// A datagram arrived from the public Internet on an exit socket.
    pub fn on_exit_datagram(&mut self, datagram: ExitDatagram) {
        let ExitDatagram {
            circuit_id,
            source,
            data,
        } = datagram;
        self.exit_bytes_received(circuit_id, data.len() as u64);
        let max = self.settings.max_packets_without_reply;
        let Some(exit) = self.exit_sockets.get_mut(&circuit_id) else {
            return;
        };
        match exit.check_num_packets(source.ip(), true, max) {
            ExitDecision::Exceeded => {
                error!(
                    circuit_id,
                    "too many packets to a destination without a reply, removing exit socket"
                );
                self.remove_exit_socket(circuit_id, "too many packets without reply", true);
            }
            ExitDecision::Allow => {
                if data::is_allowed(&data) {
                    let previous_hop = exit.origin;
                    self.tunnel_data_to_origin(
                        circuit_id,
                        previous_hop,
                        Address::from(source),
                        &data,
                    );
                } else {
                    warn!(circuit_id, "dropping forbidden packet to exit socket");
                }
            }
        }
    }

    /// Join two circuits terminating at this node into a rendezvous
    /// bridge. Both must still be latent exit endpoints.
    pub fn link_rendezvous(&mut self, circuit_a: u32, circuit_b: u32) -> Result<()> {
        if circuit_a == circuit_b {
            return Err(TunnelError::RendezvousLink(
                "cannot link a circuit to itself".into(),
            ));
        }
        for circuit_id in [circuit_a, circuit_b] {
            let Some(exit) = self.exit_sockets.get(&circuit_id) else {
                return Err(TunnelError::RendezvousLink(format!(
                    "no exit endpoint for circuit {circuit_id}"
                )));
            };
            if exit.enabled() {
                return Err(TunnelError::RendezvousLink(format!(
                    "circuit {circuit_id} already exits traffic"
                )));
            }
            if !self.relay_session_keys.contains_key(&circuit_id) {
                return Err(TunnelError::RendezvousLink(format!(
                    "no session keys for circuit {circuit_id}"
                )));
            }
        }

        let origin_a = self.exit_sockets.get(&circuit_a).map(|e| e.origin);
        let origin_b = self.exit_sockets.get(&circuit_b).map(|e| e.origin);
        let (Some(origin_a), Some(origin_b)) = (origin_a, origin_b) else {
            return Err(TunnelError::RendezvousLink("exit endpoint vanished".into()));
        };

        self.remove_exit_socket_inner(circuit_a, "rendezvous", false, true);
        self.remove_exit_socket_inner(circuit_b, "rendezvous", false, true);

        self.relay_from_to
            .insert(circuit_a, RelayRoute::new(circuit_b, origin_b, true));
        self.relay_from_to
            .insert(circuit_b, RelayRoute::new(circuit_a, origin_a, true));
        self.metrics.on_created(EntityKind::Relay);
        info!(circuit_a, circuit_b, "linked rendezvous circuits");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Remove a circuit we originated. Idempotent.
    pub fn remove_circuit(&mut self, circuit_id: u32, reason: &str, destroy: bool) -> bool {
        if !self.circuits.contains_key(&circuit_id) {
            return false;
        }
        info!(circuit_id, "removing circuit: {reason}");
        if destroy {
            if let Some(first_hop) = self.circuits.get(&circuit_id).map(|c| c.first_hop) {
                self.send_destroy(first_hop, circuit_id, 0);
            }
        }
        self.circuits.remove(&circuit_id);
        self.waiting_for.remove(&circuit_id);
        self.directions.remove(&circuit_id);
        self.circuit_requests.pop(&circuit_id);
        self.metrics.on_removed(EntityKind::Circuit);

        let affected = self.gateway.circuit_dead(circuit_id);
        self.stranded_peers.extend(affected);
        if self
            .circuits
            .values()
            .any(|c| c.is_ready() && c.ctype == CircuitType::Data)
        {
            self.readd_stranded_peers();
        }
        true
    }

    fn readd_stranded_peers(&mut self) {
        if self.stranded_peers.is_empty() {
            return;
        }
        let peers = std::mem::take(&mut self.stranded_peers);
        debug!("re-admitting {} stranded application peers", peers.len());
        self.gateway.readd_peers(&peers);
    }

    /// Remove a relay entry; with `both_sides` its mirror goes too.
    /// `got_destroy_from` authorizes and de-duplicates destroy
    /// propagation when the removal was triggered by a received destroy.
    pub fn remove_relay(
        &mut self,
        circuit_id: u32,
        reason: &str,
        destroy: bool,
        got_destroy_from: Option<(u32, SocketAddr)>,
        both_sides: bool,
    ) {
        let mut to_remove = vec![circuit_id];
        if both_sides {
            if let Some(partner) = self.relay_from_to.get(&circuit_id).map(|r| r.circuit_id) {
                if !to_remove.contains(&partner) {
                    to_remove.push(partner);
                }
            }
            for (id, route) in &self.relay_from_to {
                if route.circuit_id == circuit_id && !to_remove.contains(id) {
                    to_remove.push(*id);
                }
            }
        }

        if destroy {
            self.destroy_relays(&to_remove, 0, got_destroy_from);
        }

        for id in to_remove {
            if self.relay_from_to.remove(&id).is_some() {
                warn!(circuit_id = id, "removing relay: {reason}");
                self.relay_session_keys.remove(&id);
                self.directions.remove(&id);
                self.waiting_for.remove(&id);
                self.metrics.on_removed(EntityKind::Relay);
            } else {
                error!(circuit_id = id, "could not remove relay: {reason}");
            }
        }
    }

    fn destroy_relays(
        &mut self,
        circuit_ids: &[u32],
        reason: u8,
        got_destroy_from: Option<(u32, SocketAddr)>,
    ) {
        let relays: Vec<(u32, SocketAddr)> = circuit_ids
            .iter()
            .filter_map(|id| self.relay_from_to.get(id).map(|r| (r.circuit_id, r.peer)))
            .collect();

        if let Some(from) = got_destroy_from {
            if !relays.contains(&from) {
                error!("{} not allowed to send destroy for circuit {}", from.1, from.0);
                return;
            }
        }
        for (circuit_to, addr) in relays {
            if got_destroy_from != Some((circuit_to, addr)) {
                debug!(circuit_to, "forwarding destroy to {addr}");
                self.send_destroy(addr, circuit_to, reason);
            }
        }
    }

    /// Remove an exit socket. Idempotent.
    pub fn remove_exit_socket(&mut self, circuit_id: u32, reason: &str, destroy: bool) {
        self.remove_exit_socket_inner(circuit_id, reason, destroy, false);
    }

    fn remove_exit_socket_inner(
        &mut self,
        circuit_id: u32,
        reason: &str,
        destroy: bool,
        keep_keys: bool,
    ) {
        let Some(mut exit) = self.exit_sockets.remove(&circuit_id) else {
            error!(circuit_id, "could not remove exit socket: {reason}");
            return;
        };
        info!(circuit_id, "removing exit socket: {reason}");
        if destroy {
            self.send_destroy(exit.origin, circuit_id, 0);
        }
        if exit.enabled() {
            exit.close();
        }
        if !keep_keys {
            self.relay_session_keys.remove(&circuit_id);
            self.directions.remove(&circuit_id);
        }
        self.metrics.on_removed(EntityKind::ExitSocket);
    }

    /// Tear down everything, announcing destroys. For node shutdown.
    pub fn unload(&mut self) {
        let ids: Vec<u32> = self.circuits.keys().copied().collect();
        for id in ids {
            self.remove_circuit(id, "shutdown", true);
        }
        let ids: Vec<u32> = self.relay_from_to.keys().copied().collect();
        for id in ids {
            if self.relay_from_to.contains_key(&id) {
                self.remove_relay(id, "shutdown", true, None, false);
            }
        }
        let ids: Vec<u32> = self.exit_sockets.keys().copied().collect();
        for id in ids {
            self.remove_exit_socket(id, "shutdown", true);
        }
    }

    // ------------------------------------------------------------------
    // Layered crypto
    // ------------------------------------------------------------------

    /// Apply outbound encryption for `circuit_id`: one layer per hop on
    /// our own circuits (plus the e2e layer for RP/rendezvous data), or
    /// the single originator-direction layer at a relay/exit endpoint.
    fn crypto_out(&mut self, circuit_id: u32, content: Vec<u8>, is_data: bool) -> Result<Vec<u8>> {
        if let Some(circuit) = self.circuits.get_mut(&circuit_id) {
            let mut content = content;
            if is_data && matches!(circuit.ctype, CircuitType::Rp | CircuitType::Rendezvous) {
                let direction =
                    Direction::from_index(usize::from(circuit.ctype == CircuitType::Rp));
                let keys = circuit
                    .hs_session_keys
                    .as_mut()
                    .ok_or(TunnelError::UnknownCircuit(circuit_id))?;
                content = keys.seal(direction, &content)?;
            }
            for hop in circuit.hops.iter_mut().rev() {
                content = hop.session_keys.seal(Direction::ExitNode, &content)?;
            }
            return Ok(content);
        }
        if let Some(keys) = self.relay_keys_mut(circuit_id) {
            return Ok(keys.seal(Direction::Originator, &content)?);
        }
        Err(TunnelError::UnknownCircuit(circuit_id))
    }

    /// Mirror of [`Self::crypto_out`] for inbound traffic: peel one layer
    /// per hop in forward order, then the e2e layer; or open the single
    /// exit-direction layer at a relay/exit endpoint.
    fn crypto_in(&self, circuit_id: u32, content: &[u8], is_data: bool) -> Result<Vec<u8>> {
        if let Some(circuit) = self.circuits.get(&circuit_id) {
            if !circuit.hops.is_empty() {
                let mut content = content.to_vec();
                for hop in &circuit.hops {
                    content = hop.session_keys.open(Direction::Originator, &content)?;
                }
                if is_data && matches!(circuit.ctype, CircuitType::Rp | CircuitType::Rendezvous) {
                    let direction =
                        Direction::from_index(usize::from(circuit.ctype != CircuitType::Rp));
                    let keys = circuit
                        .hs_session_keys
                        .as_ref()
                        .ok_or(TunnelError::UnknownCircuit(circuit_id))?;
                    content = keys.open(direction, &content)?;
                }
                return Ok(content);
            }
        }
        if let Some(keys) = self.relay_keys(circuit_id) {
            return Ok(keys.open(Direction::ExitNode, content)?);
        }
        Err(TunnelError::UnknownCircuit(circuit_id))
    }

    /// One-layer relay crypto: encrypt toward the originator, decrypt
    /// toward the exit, by the circuit's direction tag.
    fn crypto_relay(&mut self, circuit_id: u32, content: &[u8]) -> Result<Vec<u8>> {
        match self.directions.get(&circuit_id).copied() {
            Some(Direction::Originator) => {
                let keys = self
                    .relay_keys_mut(circuit_id)
                    .ok_or(TunnelError::UnknownCircuit(circuit_id))?;
                Ok(keys.seal(Direction::Originator, content)?)
            }
            Some(Direction::ExitNode) => {
                let keys = self
                    .relay_keys(circuit_id)
                    .ok_or(TunnelError::UnknownCircuit(circuit_id))?;
                Ok(keys.open(Direction::ExitNode, content)?)
            }
            None => Err(TunnelError::UnknownDirection(circuit_id)),
        }
    }

    /// The single key quadruple of a relay, reachable from either of the
    /// pair's circuit ids.
    fn relay_keys(&self, circuit_id: u32) -> Option<&SessionKeys> {
        if let Some(keys) = self.relay_session_keys.get(&circuit_id) {
            return Some(keys);
        }
        let partner = self.relay_from_to.get(&circuit_id)?.circuit_id;
        self.relay_session_keys.get(&partner)
    }

    fn relay_keys_mut(&mut self, circuit_id: u32) -> Option<&mut SessionKeys> {
        let key_id = if self.relay_session_keys.contains_key(&circuit_id) {
            circuit_id
        } else {
            self.relay_from_to.get(&circuit_id)?.circuit_id
        };
        self.relay_session_keys.get_mut(&key_id)
    }

    // ------------------------------------------------------------------
    // Emission and accounting
    // ------------------------------------------------------------------

    fn send_cell(&mut self, addr: SocketAddr, circuit_id: u32, body: &CellBody) -> usize {
        let packet = match cell::encode_cell(circuit_id, body) {
            Ok(p) => p,
            Err(e) => {
                error!(circuit_id, "cannot encode {} cell: {e}", body.name());
                return 0;
            }
        };
        let packet = if cell::is_encrypted(body.cell_type()) {
            let Ok((plaintext, encrypted)) = wire::split_encrypted(&packet, PacketKind::Cell)
            else {
                return 0;
            };
            let (plaintext, encrypted) = (plaintext.to_vec(), encrypted.to_vec());
            match self.crypto_out(circuit_id, encrypted, false) {
                Ok(sealed) => {
                    let mut out = plaintext;
                    out.extend_from_slice(&sealed);
                    out
                }
                Err(e) => {
                    error!(circuit_id, "cannot seal {} cell: {e}", body.name());
                    return 0;
                }
            }
        } else {
            packet
        };
        self.send_packet(addr, &packet)
    }

    fn send_data(&mut self, addr: SocketAddr, circuit_id: u32, packet: Vec<u8>) -> usize {
        let Ok((plaintext, encrypted)) = wire::split_encrypted(&packet, PacketKind::Data) else {
            return 0;
        };
        let (plaintext, encrypted) = (plaintext.to_vec(), encrypted.to_vec());
        match self.crypto_out(circuit_id, encrypted, true) {
            Ok(sealed) => {
                let mut out = plaintext;
                out.extend_from_slice(&sealed);
                self.send_packet(addr, &out)
            }
            Err(e) => {
                error!(circuit_id, "cannot seal data packet: {e}");
                0
            }
        }
    }

    fn send_destroy(&mut self, addr: SocketAddr, circuit_id: u32, reason: u8) {
        let signature = self
            .identity
            .sign(&cell::destroy_signed_bytes(circuit_id, reason));
        debug!(circuit_id, "sending destroy to {addr}");
        self.send_cell(
            addr,
            circuit_id,
            &CellBody::Destroy(cell::DestroyPayload {
                reason,
                public_key: self.identity.verifying_key().to_bytes(),
                signature: signature.to_bytes().to_vec(),
            }),
        );
    }

    fn send_packet(&mut self, addr: SocketAddr, packet: &[u8]) -> usize {
        match self.endpoint.send_packet(addr, packet) {
            Ok(()) => packet.len(),
            Err(e) => {
                warn!("failed to send packet to {addr}: {e}");
                0
            }
        }
    }

    fn circuit_bytes_sent(&mut self, circuit_id: u32, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let Some(circuit) = self.circuits.get_mut(&circuit_id) else {
            return;
        };
        circuit.bytes_up += bytes;
        self.stats.bytes_up += bytes;
        self.metrics
            .on_bytes(EntityKind::Circuit, ByteDirection::Up, bytes);
    }

    fn circuit_bytes_received(&mut self, circuit_id: u32, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let Some(circuit) = self.circuits.get_mut(&circuit_id) else {
            return;
        };
        circuit.bytes_down += bytes;
        self.stats.bytes_down += bytes;
        self.metrics
            .on_bytes(EntityKind::Circuit, ByteDirection::Down, bytes);
    }

    fn relay_bytes_sent(&mut self, relay_id: u32, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let Some(route) = self.relay_from_to.get_mut(&relay_id) else {
            return;
        };
        route.bytes_up += bytes;
        self.stats.bytes_relay_up += bytes;
        self.metrics
            .on_bytes(EntityKind::Relay, ByteDirection::Up, bytes);
    }

    fn relay_bytes_received(&mut self, relay_id: u32, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let Some(route) = self.relay_from_to.get_mut(&relay_id) else {
            return;
        };
        route.bytes_down += bytes;
        self.stats.bytes_relay_down += bytes;
        self.metrics
            .on_bytes(EntityKind::Relay, ByteDirection::Down, bytes);
    }

    fn exit_bytes_sent(&mut self, circuit_id: u32, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let Some(exit) = self.exit_sockets.get_mut(&circuit_id) else {
            return;
        };
        exit.bytes_up += bytes;
        self.stats.bytes_exit += bytes;
        self.metrics
            .on_bytes(EntityKind::ExitSocket, ByteDirection::Up, bytes);
    }

    fn exit_bytes_received(&mut self, circuit_id: u32, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let Some(exit) = self.exit_sockets.get_mut(&circuit_id) else {
            return;
        };
        exit.bytes_down += bytes;
        self.stats.bytes_enter += bytes;
        self.metrics
            .on_bytes(EntityKind::ExitSocket, ByteDirection::Down, bytes);
    }
}

fn verify_link_signature(public_key: &[u8; 32], signature: &[u8], message: &[u8]) -> bool {
    let Ok(verifying_key) = ed25519::VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; 64]>::try_from(signature) else {
        return false;
    };
    verifying_key
        .verify(message, &ed25519::Signature::from_bytes(&sig_bytes))
        .is_ok()
}
