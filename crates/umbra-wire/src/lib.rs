//! # umbra-wire
//!
//! Wire codec for the Umbra tunnel overlay.
//!
//! Two frame families share one UDP endpoint:
//!
//! - **Cells** — control-plane frames: `[circuit_id:4][cell_type:1][body]`.
//! - **Data** — bulk user datagrams, prefixed with the 4-byte data prefix
//!   `FF FF FF FE` so the endpoint can demultiplex them from other overlay
//!   traffic: `[prefix:4][circuit_id:4][body]`.
//!
//! In both families the circuit id sits at a fixed offset so relay nodes
//! can rewrite it without parsing anything else ([`swap_circuit_id`]).
//! Every frame splits into a plaintext header and an encrypted tail at a
//! fixed point ([`split_encrypted`]); layered encryption is applied to the
//! tail only.

pub mod address;
pub mod cbor;
pub mod cell;
pub mod data;

pub use address::Address;
pub use cell::{
    CellBody, CreatePayload, CreatedPayload, DestroyPayload, ExtendPayload, ExtendedPayload,
    PingPayload, PongPayload, StatsMap, StatsRequestPayload, StatsResponsePayload,
};

/// Prefix that demultiplexes tunnel data frames from other overlay traffic.
pub const DATA_PREFIX: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFE];

/// Plaintext header length of a cell frame (circuit id + cell type).
pub const CELL_HEADER_SIZE: usize = 5;

/// Plaintext header length of a data frame (prefix + circuit id).
pub const DATA_HEADER_SIZE: usize = 8;

/// Which frame family a packet belongs to; decides header offsets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketKind {
    Cell,
    Data,
}

impl PacketKind {
    fn circuit_id_offset(self) -> usize {
        match self {
            PacketKind::Cell => 0,
            PacketKind::Data => 4,
        }
    }

    fn header_size(self) -> usize {
        match self {
            PacketKind::Cell => CELL_HEADER_SIZE,
            PacketKind::Data => DATA_HEADER_SIZE,
        }
    }
}

/// Error types for codec operations.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// CBOR serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// CBOR deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Frame too short or structurally malformed.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Unknown cell type byte.
    #[error("unknown cell type {0}")]
    UnknownCellType(u8),
}

pub type Result<T> = std::result::Result<T, WireError>;

/// True if the packet carries the tunnel data prefix.
pub fn is_data(packet: &[u8]) -> bool {
    packet.len() >= DATA_PREFIX.len() && packet[..DATA_PREFIX.len()] == DATA_PREFIX
}

/// Read the circuit id at the frame's fixed offset.
pub fn circuit_id(packet: &[u8], kind: PacketKind) -> Result<u32> {
    let off = kind.circuit_id_offset();
    let bytes: [u8; 4] = packet
        .get(off..off + 4)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| WireError::InvalidFrame("packet too short for circuit id".into()))?;
    Ok(u32::from_be_bytes(bytes))
}

/// Rewrite the circuit id in place at the frame's fixed offset. Relays use
/// this without touching the (encrypted) remainder of the frame.
pub fn swap_circuit_id(packet: &mut [u8], kind: PacketKind, new_id: u32) -> Result<()> {
    let off = kind.circuit_id_offset();
    let slot = packet
        .get_mut(off..off + 4)
        .ok_or_else(|| WireError::InvalidFrame("packet too short for circuit id".into()))?;
    slot.copy_from_slice(&new_id.to_be_bytes());
    Ok(())
}

/// Split a frame into its plaintext header and encrypted tail.
pub fn split_encrypted(packet: &[u8], kind: PacketKind) -> Result<(&[u8], &[u8])> {
    let header = kind.header_size();
    if packet.len() < header {
        return Err(WireError::InvalidFrame(format!(
            "packet too short: {} bytes, header is {header}",
            packet.len()
        )));
    }
    Ok(packet.split_at(header))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_data_prefix() {
        assert!(is_data(&[0xFF, 0xFF, 0xFF, 0xFE, 0, 0, 0, 1]));
        assert!(!is_data(&[0xFF, 0xFF, 0xFF, 0xFF, 0, 0, 0, 1]));
        assert!(!is_data(&[0xFF, 0xFF]));
    }

    #[test]
    fn test_circuit_id_offsets() {
        let cell = [0, 0, 0, 7, 5, 1, 2, 3];
        assert_eq!(circuit_id(&cell, PacketKind::Cell).expect("cell id"), 7);

        let mut data = Vec::from(DATA_PREFIX);
        data.extend_from_slice(&42u32.to_be_bytes());
        data.extend_from_slice(b"body");
        assert_eq!(circuit_id(&data, PacketKind::Data).expect("data id"), 42);
    }

    #[test]
    fn test_swap_circuit_id_leaves_rest_alone() {
        let mut data = Vec::from(DATA_PREFIX);
        data.extend_from_slice(&42u32.to_be_bytes());
        data.extend_from_slice(b"encrypted tail");
        swap_circuit_id(&mut data, PacketKind::Data, 99).expect("swap");
        assert_eq!(circuit_id(&data, PacketKind::Data).expect("id"), 99);
        assert_eq!(&data[DATA_HEADER_SIZE..], b"encrypted tail");
    }

    #[test]
    fn test_split_encrypted() {
        let cell = [0, 0, 0, 7, 5, 0xAA, 0xBB];
        let (head, tail) = split_encrypted(&cell, PacketKind::Cell).expect("split");
        assert_eq!(head, &[0, 0, 0, 7, 5]);
        assert_eq!(tail, &[0xAA, 0xBB]);

        assert!(split_encrypted(&[0, 0], PacketKind::Cell).is_err());
    }
}
