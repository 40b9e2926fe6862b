//! Relay routes at middle nodes.
//!
//! A node that accepts an `extend` becomes a relay: two `RelayRoute`
//! entries are installed as a pair, one per direction, each naming the
//! neighbour and the circuit id valid on that neighbour's link. Both
//! directions share the single session-key quadruple negotiated at
//! `create` time.

use std::net::SocketAddr;
use std::time::Instant;

/// One direction of a relayed circuit.
pub struct RelayRoute {
    /// The circuit id used on the next neighbour's link.
    pub circuit_id: u32,
    /// The next neighbour.
    pub peer: SocketAddr,
    /// True at a rendezvous point bridging two independently keyed
    /// circuits; forwarding then decrypts with the inbound keys and
    /// re-encrypts with the outbound keys instead of applying one layer.
    pub rendezvous_relay: bool,
    /// Member id of the neighbour, when known. Kept for audit.
    pub member_id: Option<[u8; 32]>,
    pub creation_time: Instant,
    pub last_incoming: Instant,
    pub bytes_up: u64,
    pub bytes_down: u64,
}

impl RelayRoute {
    pub fn new(circuit_id: u32, peer: SocketAddr, rendezvous_relay: bool) -> Self {
        let now = Instant::now();
        Self {
            circuit_id,
            peer,
            rendezvous_relay,
            member_id: None,
            creation_time: now,
            last_incoming: now,
            bytes_up: 0,
            bytes_down: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_route_is_fresh() {
        let route = RelayRoute::new(9, "10.0.0.1:4000".parse().expect("addr"), false);
        assert_eq!(route.circuit_id, 9);
        assert_eq!(route.bytes_up + route.bytes_down, 0);
        assert!(!route.rendezvous_relay);
    }
}
