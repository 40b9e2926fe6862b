//! Collaborator interfaces.
//!
//! The data plane treats the peer-discovery overlay, the SOCKS5 ingress
//! and the outbound socket as injected collaborators. All calls happen on
//! the community's event loop.

use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::time::Instant;

use umbra_crypto::x25519::X25519PublicKey;
use umbra_wire::Address;

/// A peer the overlay has verified.
#[derive(Clone, Debug)]
pub struct Candidate {
    pub address: SocketAddr,
    /// The peer's long-lived tunnel key.
    pub public_key: X25519PublicKey,
    /// BLAKE3 of the peer's signing key, when known. Kept on exit sockets
    /// for audit.
    pub member_id: Option<[u8; 32]>,
    /// Whether the peer is reachable without NAT assistance.
    pub connectable: bool,
}

/// What we know about a candidate's willingness to exit, learned from the
/// overlay's introduction exchange.
#[derive(Clone, Debug)]
pub struct ExitCandidate {
    pub become_exit: bool,
    pub first_seen: Instant,
}

/// The UDP endpoint the community sends frames through.
pub trait Endpoint {
    fn send_packet(&mut self, addr: SocketAddr, packet: &[u8]) -> io::Result<()>;
}

/// The peer-discovery overlay: a source of verified candidates and the
/// judge of what counts as overlay traffic.
pub trait Overlay {
    /// Currently verified candidates, in overlay walk order.
    fn verified_candidates(&self) -> Vec<Candidate>;

    /// True if `data` is overlay protocol traffic rather than application
    /// payload. Overlay traffic may exit even on nodes that have not
    /// opted in to exiting.
    fn is_overlay_payload(&self, _data: &[u8]) -> bool {
        false
    }

    /// Deliver an overlay packet that arrived through one of our circuits.
    fn deliver_overlay(&mut self, _origin: &Address, _data: &[u8]) {}
}

/// The local SOCKS5 ingress, owned elsewhere; receives datagrams coming
/// back from exits and learns when circuits die.
pub trait SocksGateway {
    /// A datagram arrived for the application over `circuit_id`.
    fn on_incoming_from_tunnel(
        &mut self,
        circuit_id: u32,
        origin: &Address,
        data: &[u8],
        anon_seed: bool,
    );

    /// A circuit died; returns the application peers that were reachable
    /// only through it.
    fn circuit_dead(&mut self, _circuit_id: u32) -> HashSet<SocketAddr> {
        HashSet::new()
    }

    /// Previously stranded peers may be re-admitted now that a data
    /// circuit is available again.
    fn readd_peers(&mut self, _peers: &HashSet<SocketAddr>) {}
}
