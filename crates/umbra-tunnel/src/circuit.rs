//! Initiator-side circuits and their hops.
//!
//! A circuit is an ordered chain of verified hops plus, while extending,
//! one unverified hop whose handshake is in flight. The state is computed
//! from that shape, which keeps the readiness invariant structural:
//! `Ready ⇔ |hops| = goal ∧ no unverified hop`.

use std::net::SocketAddr;
use std::time::Instant;

use umbra_crypto::blake3;
use umbra_crypto::tunnel::{HandshakeState, SessionKeys};
use umbra_crypto::x25519::X25519PublicKey;

/// What a circuit is for. Data circuits end at an exit; RP and rendezvous
/// circuits are the two halves of a hidden-service style end-to-end path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitType {
    Data,
    Rp,
    Rendezvous,
}

/// Computed circuit state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    Extending,
    Ready,
    Broken,
}

/// A pinned terminal hop: either the chosen exit for a data circuit or
/// the far endpoint when linking rendezvous circuits.
#[derive(Clone, Debug)]
pub struct RequiredEndpoint {
    pub address: SocketAddr,
    pub public_key: X25519PublicKey,
}

/// One-shot callback fired when the circuit reaches its goal length.
pub type ReadyCallback = Box<dyn FnOnce(u32) + Send>;

/// A hop whose handshake is still in flight.
pub struct PendingHop {
    pub public_key: X25519PublicKey,
    /// Transport address, known for the first hop and for pinned
    /// endpoints; extension targets picked from candidate lists have none.
    pub address: Option<SocketAddr>,
    pub handshake: HandshakeState,
}

/// A verified hop with negotiated session keys.
pub struct Hop {
    pub public_key: X25519PublicKey,
    pub address: Option<SocketAddr>,
    pub session_keys: SessionKeys,
}

impl Hop {
    /// The hop's node id (BLAKE3 of its tunnel key).
    pub fn node_id(&self) -> [u8; 32] {
        blake3::hash(self.public_key.as_bytes())
    }
}

/// A circuit this node originated.
pub struct Circuit {
    pub circuit_id: u32,
    pub goal_hops: u8,
    pub first_hop: SocketAddr,
    pub ctype: CircuitType,
    /// Verified hops, append-only while extending, frozen once ready.
    pub hops: Vec<Hop>,
    pub unverified_hop: Option<PendingHop>,
    pub required_endpoint: Option<RequiredEndpoint>,
    /// Torrent this circuit was built for, if any.
    pub info_hash: Option<[u8; 20]>,
    pub ready_callback: Option<ReadyCallback>,
    /// End-to-end session keys for RP/rendezvous circuits, installed by
    /// the hidden-services layer.
    pub hs_session_keys: Option<SessionKeys>,
    pub creation_time: Instant,
    pub last_incoming: Instant,
    pub bytes_up: u64,
    pub bytes_down: u64,
    broken: bool,
}

impl Circuit {
    pub fn new(
        circuit_id: u32,
        goal_hops: u8,
        first_hop: SocketAddr,
        ctype: CircuitType,
        required_endpoint: Option<RequiredEndpoint>,
        info_hash: Option<[u8; 20]>,
        ready_callback: Option<ReadyCallback>,
    ) -> Self {
        let now = Instant::now();
        Self {
            circuit_id,
            goal_hops,
            first_hop,
            ctype,
            hops: Vec::with_capacity(goal_hops as usize),
            unverified_hop: None,
            required_endpoint,
            info_hash,
            ready_callback,
            hs_session_keys: None,
            creation_time: now,
            last_incoming: now,
            bytes_up: 0,
            bytes_down: 0,
            broken: false,
        }
    }

    pub fn state(&self) -> CircuitState {
        if self.broken {
            CircuitState::Broken
        } else if self.hops.len() == self.goal_hops as usize && self.unverified_hop.is_none() {
            CircuitState::Ready
        } else {
            CircuitState::Extending
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state() == CircuitState::Ready
    }

    /// Record inbound liveness.
    pub fn beat_heart(&mut self) {
        self.last_incoming = Instant::now();
    }

    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Install the end-to-end session keys for an RP/rendezvous circuit.
    pub fn set_hs_session_keys(&mut self, keys: SessionKeys) {
        self.hs_session_keys = Some(keys);
    }
}
