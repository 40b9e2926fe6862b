//! CBOR serialization helpers for cell payload bodies.
//!
//! Cell bodies are CBOR (RFC 8949) via [`ciborium`]; the candidate list
//! travelling inside `created`/`extended` is CBOR-encoded before it is
//! sealed with the exit-direction session keys.

use serde::{de::DeserializeOwned, Serialize};

use crate::WireError;

/// Serialize a value to CBOR bytes.
pub fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)
        .map_err(|e| WireError::Serialization(format!("CBOR serialization failed: {e}")))?;
    Ok(buf)
}

/// Deserialize a value from CBOR bytes.
pub fn from_slice<T: DeserializeOwned>(data: &[u8]) -> Result<T, WireError> {
    ciborium::from_reader(data)
        .map_err(|e| WireError::Deserialization(format!("CBOR deserialization failed: {e}")))
}
