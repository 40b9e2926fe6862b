//! Collaborator implementations wiring the tunnel community to the
//! daemon's UDP socket and static peer list.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::{debug, warn};

use umbra_crypto::x25519::X25519PublicKey;
use umbra_tunnel::external::{Candidate, Endpoint, Overlay, SocksGateway};
use umbra_wire::Address;

use crate::config::PeerConfig;

/// Sends tunnel frames over the daemon's UDP socket without blocking the
/// event loop.
pub struct UdpEndpoint {
    socket: Arc<UdpSocket>,
}

impl UdpEndpoint {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }
}

impl Endpoint for UdpEndpoint {
    fn send_packet(&mut self, addr: SocketAddr, packet: &[u8]) -> io::Result<()> {
        self.socket.try_send_to(packet, addr).map(|_| ())
    }
}

/// A fixed candidate set from the config file, standing in for the
/// peer-discovery overlay.
pub struct StaticOverlay {
    candidates: Vec<Candidate>,
}

impl StaticOverlay {
    /// Parse config peers; entries with malformed keys are skipped with a
    /// warning.
    pub fn from_config(peers: &[PeerConfig]) -> Self {
        let mut candidates = Vec::with_capacity(peers.len());
        for peer in peers {
            let Some(public_key) = parse_key(&peer.tunnel_key) else {
                warn!("skipping peer {}: malformed tunnel key", peer.address);
                continue;
            };
            let member_id = peer
                .member_id
                .as_deref()
                .and_then(|m| parse_key(m).map(|k| k.to_bytes()));
            candidates.push(Candidate {
                address: peer.address,
                public_key,
                member_id,
                connectable: peer.connectable,
            });
        }
        Self { candidates }
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }
}

impl Overlay for StaticOverlay {
    fn verified_candidates(&self) -> Vec<Candidate> {
        self.candidates.clone()
    }
}

fn parse_key(hex_key: &str) -> Option<X25519PublicKey> {
    let bytes = hex::decode(hex_key).ok()?;
    X25519PublicKey::from_slice(&bytes).ok()
}

/// Placeholder for the SOCKS5 ingress, which runs as a separate
/// component; datagrams surfacing here are logged and dropped.
pub struct LogGateway;

impl SocksGateway for LogGateway {
    fn on_incoming_from_tunnel(
        &mut self,
        circuit_id: u32,
        origin: &Address,
        data: &[u8],
        _anon_seed: bool,
    ) {
        debug!(
            circuit_id,
            "dropping {} bytes from {origin}: no SOCKS gateway attached",
            data.len()
        );
    }
}
