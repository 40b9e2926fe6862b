//! Cell payload structs and the cell-type registry.
//!
//! A cell frame is `[circuit_id: u32 BE][cell_type: u8][body]` where `body`
//! is the CBOR encoding of the payload struct for that type. Relayable
//! cells travel through circuits with one encryption layer per hop on the
//! body; `create` and `created` are plaintext handshake cells. Link-local
//! cells (`destroy`, `stats-request`, `stats-response`) are exchanged
//! between direct neighbours only, are never layer-encrypted, and carry an
//! Ed25519 signature by the sender.

use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::{cbor, Result, WireError, CELL_HEADER_SIZE};

/// Cell type for circuit creation (plaintext handshake).
pub const CELL_CREATE: u8 = 1;
/// Cell type for the circuit creation reply (plaintext handshake).
pub const CELL_CREATED: u8 = 2;
/// Cell type for circuit extension (encrypted).
pub const CELL_EXTEND: u8 = 3;
/// Cell type for the circuit extension reply (encrypted).
pub const CELL_EXTENDED: u8 = 4;
/// Cell type for circuit liveness probes (encrypted).
pub const CELL_PING: u8 = 5;
/// Cell type for liveness replies (encrypted).
pub const CELL_PONG: u8 = 6;
/// Cell type for circuit teardown (link-local, signed).
pub const CELL_DESTROY: u8 = 7;
/// Cell type for crawler statistics requests (link-local, signed).
pub const CELL_STATS_REQUEST: u8 = 8;
/// Cell type for crawler statistics responses (link-local, signed).
pub const CELL_STATS_RESPONSE: u8 = 9;

/// `create` body: the initiator's handshake offer. `node_id` and
/// `node_public_key` name the intended receiver, which rejects the cell if
/// they do not match its own identity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreatePayload {
    pub node_id: [u8; 32],
    pub node_public_key: [u8; 32],
    /// First DH message `X`.
    pub key: [u8; 32],
}

/// `created` body: the hop's handshake reply plus its candidate list,
/// sealed with the freshly negotiated exit-direction keys.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreatedPayload {
    /// Responder DH message `Y`.
    pub key: [u8; 32],
    pub auth: [u8; 32],
    pub candidate_list: Vec<u8>,
}

/// `extend` body: ask the current terminal hop to extend the circuit to
/// the named node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExtendPayload {
    pub node_id: [u8; 32],
    pub node_public_key: [u8; 32],
    /// Transport address of the next hop, when pinned by the initiator.
    pub node_addr: Option<Address>,
    /// First DH message `X` for the new hop.
    pub key: [u8; 32],
}

/// `extended` body: the relayed handshake reply for an `extend`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExtendedPayload {
    pub key: [u8; 32],
    pub auth: [u8; 32],
    pub candidate_list: Vec<u8>,
}

/// `ping` body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PingPayload {
    pub identifier: u32,
}

/// `pong` body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PongPayload {
    pub identifier: u32,
}

/// `destroy` body. Signed over `(circuit_id, reason)` by the sender.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DestroyPayload {
    pub reason: u8,
    pub public_key: [u8; 32],
    pub signature: Vec<u8>,
}

/// `stats-request` body. Signed over `identifier` by the crawler.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatsRequestPayload {
    pub identifier: u32,
    pub public_key: [u8; 32],
    pub signature: Vec<u8>,
}

/// Node-wide tunnel statistics carried in `stats-response`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsMap {
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub bytes_relay_up: u64,
    pub bytes_relay_down: u64,
    pub bytes_exit: u64,
    pub bytes_enter: u64,
    pub uptime_secs: u64,
}

/// `stats-response` body. Signed over `(identifier, stats)` by the sender.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatsResponsePayload {
    pub identifier: u32,
    pub stats: StatsMap,
    pub public_key: [u8; 32],
    pub signature: Vec<u8>,
}

/// A decoded cell body.
#[derive(Clone, Debug)]
pub enum CellBody {
    Create(CreatePayload),
    Created(CreatedPayload),
    Extend(ExtendPayload),
    Extended(ExtendedPayload),
    Ping(PingPayload),
    Pong(PongPayload),
    Destroy(DestroyPayload),
    StatsRequest(StatsRequestPayload),
    StatsResponse(StatsResponsePayload),
}

impl CellBody {
    /// The registered type byte for this body.
    pub fn cell_type(&self) -> u8 {
        match self {
            CellBody::Create(_) => CELL_CREATE,
            CellBody::Created(_) => CELL_CREATED,
            CellBody::Extend(_) => CELL_EXTEND,
            CellBody::Extended(_) => CELL_EXTENDED,
            CellBody::Ping(_) => CELL_PING,
            CellBody::Pong(_) => CELL_PONG,
            CellBody::Destroy(_) => CELL_DESTROY,
            CellBody::StatsRequest(_) => CELL_STATS_REQUEST,
            CellBody::StatsResponse(_) => CELL_STATS_RESPONSE,
        }
    }

    /// Human-readable cell name for logging.
    pub fn name(&self) -> &'static str {
        cell_name(self.cell_type())
    }
}

/// Human-readable name for a cell type byte.
pub fn cell_name(cell_type: u8) -> &'static str {
    match cell_type {
        CELL_CREATE => "create",
        CELL_CREATED => "created",
        CELL_EXTEND => "extend",
        CELL_EXTENDED => "extended",
        CELL_PING => "ping",
        CELL_PONG => "pong",
        CELL_DESTROY => "destroy",
        CELL_STATS_REQUEST => "stats-request",
        CELL_STATS_RESPONSE => "stats-response",
        _ => "unknown",
    }
}

/// True for cell types that are forwarded through circuits. Link-local
/// cells are handled by the receiving neighbour and never relayed.
pub fn is_relayable(cell_type: u8) -> bool {
    matches!(
        cell_type,
        CELL_CREATE | CELL_CREATED | CELL_EXTEND | CELL_EXTENDED | CELL_PING | CELL_PONG
    )
}

/// True for cell types whose body is layer-encrypted through the circuit.
/// The handshake pair and the link-local cells stay plaintext.
pub fn is_encrypted(cell_type: u8) -> bool {
    matches!(cell_type, CELL_EXTEND | CELL_EXTENDED | CELL_PING | CELL_PONG)
}

/// Encode a full cell frame: header plus CBOR body. The body is still
/// plaintext; callers seal the encrypted tail afterwards where required.
pub fn encode_cell(circuit_id: u32, body: &CellBody) -> Result<Vec<u8>> {
    let payload = match body {
        CellBody::Create(p) => cbor::to_vec(p)?,
        CellBody::Created(p) => cbor::to_vec(p)?,
        CellBody::Extend(p) => cbor::to_vec(p)?,
        CellBody::Extended(p) => cbor::to_vec(p)?,
        CellBody::Ping(p) => cbor::to_vec(p)?,
        CellBody::Pong(p) => cbor::to_vec(p)?,
        CellBody::Destroy(p) => cbor::to_vec(p)?,
        CellBody::StatsRequest(p) => cbor::to_vec(p)?,
        CellBody::StatsResponse(p) => cbor::to_vec(p)?,
    };

    let mut packet = Vec::with_capacity(CELL_HEADER_SIZE + payload.len());
    packet.extend_from_slice(&circuit_id.to_be_bytes());
    packet.push(body.cell_type());
    packet.extend_from_slice(&payload);
    Ok(packet)
}

/// Read the cell type byte from a cell frame header.
pub fn cell_type(packet: &[u8]) -> Result<u8> {
    packet
        .get(CELL_HEADER_SIZE - 1)
        .copied()
        .ok_or_else(|| WireError::InvalidFrame("packet too short for cell header".into()))
}

/// Decode a (decrypted) cell body for the given type byte.
pub fn decode_cell_body(cell_type: u8, body: &[u8]) -> Result<CellBody> {
    Ok(match cell_type {
        CELL_CREATE => CellBody::Create(cbor::from_slice(body)?),
        CELL_CREATED => CellBody::Created(cbor::from_slice(body)?),
        CELL_EXTEND => CellBody::Extend(cbor::from_slice(body)?),
        CELL_EXTENDED => CellBody::Extended(cbor::from_slice(body)?),
        CELL_PING => CellBody::Ping(cbor::from_slice(body)?),
        CELL_PONG => CellBody::Pong(cbor::from_slice(body)?),
        CELL_DESTROY => CellBody::Destroy(cbor::from_slice(body)?),
        CELL_STATS_REQUEST => CellBody::StatsRequest(cbor::from_slice(body)?),
        CELL_STATS_RESPONSE => CellBody::StatsResponse(cbor::from_slice(body)?),
        other => return Err(WireError::UnknownCellType(other)),
    })
}

/// The message bytes a `destroy` signature covers.
pub fn destroy_signed_bytes(circuit_id: u32, reason: u8) -> Vec<u8> {
    let mut msg = Vec::with_capacity(5);
    msg.extend_from_slice(&circuit_id.to_be_bytes());
    msg.push(reason);
    msg
}

/// The message bytes a `stats-request` signature covers.
pub fn stats_request_signed_bytes(identifier: u32) -> Vec<u8> {
    identifier.to_be_bytes().to_vec()
}

/// The message bytes a `stats-response` signature covers.
pub fn stats_response_signed_bytes(identifier: u32, stats: &StatsMap) -> Result<Vec<u8>> {
    let mut msg = identifier.to_be_bytes().to_vec();
    msg.extend_from_slice(&cbor::to_vec(stats)?);
    Ok(msg)
}
