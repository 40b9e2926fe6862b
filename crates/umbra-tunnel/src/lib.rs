//! # umbra-tunnel
//!
//! The tunnel data plane of the Umbra overlay: every node can initiate
//! multi-hop layer-encrypted circuits, relay cells and datagrams for other
//! nodes, and (when opted in) exit application traffic to the Internet.
//!
//! - [`community`] - the node state machine: packet pipeline, circuit
//!   builder, lifecycle sweeper, ping keepalive
//! - [`circuit`] - initiator-side circuits and their hops
//! - [`relay`] - relay routes at middle nodes
//! - [`exit`] - exit sockets with per-destination abuse control
//! - [`cache`] - correlation caches for in-flight requests
//! - [`selection`] - round-robin circuit selection
//! - [`settings`] - tunable limits and caps
//! - [`stats`] - byte counters and the injectable metrics seam
//! - [`external`] - collaborator interfaces (endpoint, overlay, SOCKS
//!   gateway)
//!
//! Everything runs on one cooperative event loop: UDP receive, timer
//! ticks and cache expirations are handler calls on
//! [`community::TunnelCommunity`], driven by whoever owns the node (see
//! the daemon crate).

use std::time::Duration;

pub mod cache;
pub mod circuit;
pub mod community;
pub mod exit;
pub mod external;
pub mod relay;
pub mod selection;
pub mod settings;
pub mod stats;

/// How long a `create`/`extend` round-trip may take before the circuit is
/// torn down.
pub const CIRCUIT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How long an accepted `create` waits for the follow-up `extend`.
pub const CREATED_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a stats request waits for its response.
pub const STATS_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay before a failed circuit build is retried.
pub const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Candidates returned in a `created` cell are capped at this many.
pub const MAX_CANDIDATES_IN_CREATED: usize = 4;

/// Error types for tunnel operations. The data plane never propagates
/// these to remote peers; they surface in logs and entity teardown.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// Decrypt/verify mismatch or unknown key material for a circuit.
    #[error("crypto failure: {0}")]
    Crypto(#[from] umbra_crypto::CryptoError),

    /// Malformed or unserializable frame.
    #[error("codec failure: {0}")]
    Wire(#[from] umbra_wire::WireError),

    /// No key material or state for this circuit id.
    #[error("unknown circuit {0}")]
    UnknownCircuit(u32),

    /// Relay crypto asked for a circuit with no direction tag.
    #[error("unknown direction for circuit {0}")]
    UnknownDirection(u32),

    /// No verified candidate is willing to exit.
    #[error("no exit candidate available")]
    NoExitCandidate,

    /// No usable first hop among the verified candidates.
    #[error("no first hop available")]
    NoFirstHop,

    /// The two circuits cannot be joined at this node.
    #[error("rendezvous link failed: {0}")]
    RendezvousLink(String),

    /// Socket-level failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TunnelError>;
