//! Data frame codec and the exit payload whitelist.
//!
//! A data frame is `[FF FF FF FE][circuit_id: u32 BE][body]` where the
//! decrypted body is `[destination: Address][origin: Address][payload]`.
//! Relays rewrite the circuit id and never see the body; only the two
//! endpoints of a circuit parse the addresses.

use crate::address::Address;
use crate::{circuit_id, Result, WireError, DATA_HEADER_SIZE, DATA_PREFIX, PacketKind};

/// Encode a full data frame with a plaintext body. Callers seal the body
/// (everything past the header) before sending.
pub fn encode_data(
    circuit_id: u32,
    destination: &Address,
    origin: &Address,
    payload: &[u8],
) -> Vec<u8> {
    let mut packet = Vec::with_capacity(DATA_HEADER_SIZE + 16 + payload.len());
    packet.extend_from_slice(&DATA_PREFIX);
    packet.extend_from_slice(&circuit_id.to_be_bytes());
    destination.write(&mut packet);
    origin.write(&mut packet);
    packet.extend_from_slice(payload);
    packet
}

/// Decode a data frame whose body has already been decrypted.
pub fn decode_data(packet: &[u8]) -> Result<(u32, Address, Address, Vec<u8>)> {
    if packet.len() < DATA_HEADER_SIZE || packet[..DATA_PREFIX.len()] != DATA_PREFIX {
        return Err(WireError::InvalidFrame("not a data frame".into()));
    }
    let cid = circuit_id(packet, PacketKind::Data)?;

    let body = &packet[DATA_HEADER_SIZE..];
    let (destination, used) = Address::read(body)?;
    let (origin, used2) = Address::read(&body[used..])?;
    let payload = body[used + used2..].to_vec();
    Ok((cid, destination, origin, payload))
}

/// Whitelist for traffic crossing an exit socket, in either direction.
///
/// Allows the three datagram protocols a BitTorrent client speaks: uTP,
/// the UDP tracker protocol, and bencoded DHT messages. Everything else is
/// dropped at the exit.
pub fn is_allowed(payload: &[u8]) -> bool {
    could_be_utp(payload) || could_be_udp_tracker(payload) || could_be_dht(payload)
}

/// uTP header check: version nibble 1, known packet type, sane extension.
fn could_be_utp(payload: &[u8]) -> bool {
    if payload.len() < 20 {
        return false;
    }
    let version = payload[0] & 0x0F;
    let packet_type = payload[0] >> 4;
    version == 1 && packet_type <= 4 && payload[1] <= 3
}

/// UDP tracker protocol: the connect-request magic, or a plausible
/// action code in either the request or response position.
fn could_be_udp_tracker(payload: &[u8]) -> bool {
    const CONNECT_MAGIC: u64 = 0x0417_2710_1980;
    if payload.len() >= 16 {
        let head = u64::from_be_bytes([
            payload[0], payload[1], payload[2], payload[3], payload[4], payload[5], payload[6],
            payload[7],
        ]);
        if head == CONNECT_MAGIC {
            return true;
        }
        let request_action = u32::from_be_bytes([payload[8], payload[9], payload[10], payload[11]]);
        if request_action <= 3 {
            return true;
        }
    }
    if payload.len() >= 8 {
        let response_action = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        return response_action <= 3;
    }
    false
}

/// Bencoded DHT message: a dictionary from the first to the last byte.
fn could_be_dht(payload: &[u8]) -> bool {
    payload.len() >= 2 && payload.first() == Some(&b'd') && payload.last() == Some(&b'e')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_encode_decode_identity() {
        let dest = Address::V4(Ipv4Addr::new(198, 51, 100, 7), 9999);
        let origin = Address::NULL;
        let payload = b"d1:ad2:id20:aaaaaaaaaaaaaaaaaaaae1:q4:ping1:t2:aa1:y1:qe";

        let packet = encode_data(0xABCD, &dest, &origin, payload);
        assert!(crate::is_data(&packet));

        let (cid, d, o, p) = decode_data(&packet).expect("decode");
        assert_eq!(cid, 0xABCD);
        assert_eq!(d, dest);
        assert_eq!(o, origin);
        assert_eq!(p, payload);
    }

    #[test]
    fn test_decode_rejects_cells() {
        let cell = [0u8, 0, 0, 1, 5, 9, 9];
        assert!(decode_data(&cell).is_err());
    }

    #[test]
    fn test_utp_whitelisted() {
        // ST_DATA (type 1), version 1, no extension, 20-byte header.
        let mut packet = [0u8; 20];
        packet[0] = 0x11;
        assert!(is_allowed(&packet));

        // Bad version nibble.
        packet[0] = 0x12;
        assert!(!could_be_utp(&packet));
    }

    #[test]
    fn test_udp_tracker_whitelisted() {
        let mut connect = [0u8; 16];
        connect[..8].copy_from_slice(&0x0417_2710_1980u64.to_be_bytes());
        assert!(is_allowed(&connect));

        // Announce response: action 1 at the front.
        let mut response = [0u8; 20];
        response[3] = 1;
        assert!(could_be_udp_tracker(&response[..8]));
    }

    #[test]
    fn test_dht_whitelisted() {
        assert!(is_allowed(b"d1:q4:pinge"));
        assert!(!could_be_dht(b"x not bencode"));
    }

    #[test]
    fn test_garbage_dropped() {
        assert!(!is_allowed(b"GET / HTTP/1.1\r\n"));
        assert!(!is_allowed(&[]));
    }
}
