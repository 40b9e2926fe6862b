//! Domain-separated BLAKE3 hashing for the Umbra protocol.
//!
//! Cross-domain collisions are prevented by mandatory domain separation:
//! every key derivation uses one of the registered context strings below.
//! Using an unregistered context string is a protocol violation.

/// Registered BLAKE3 context strings.
pub mod contexts {
    pub const TUNNEL_SHARED_SECRET: &str = "Umbra v1 tunnel-shared-secret";
    pub const TUNNEL_AUTH: &str = "Umbra v1 tunnel-auth";
    pub const TUNNEL_ORIGINATOR_KEY: &str = "Umbra v1 tunnel-originator-key";
    pub const TUNNEL_EXIT_KEY: &str = "Umbra v1 tunnel-exit-key";
    pub const TUNNEL_ORIGINATOR_SALT: &str = "Umbra v1 tunnel-originator-salt";
    pub const TUNNEL_EXIT_SALT: &str = "Umbra v1 tunnel-exit-salt";

    /// All registered context strings. Used for validation.
    pub const ALL_CONTEXTS: &[&str] = &[
        TUNNEL_SHARED_SECRET,
        TUNNEL_AUTH,
        TUNNEL_ORIGINATOR_KEY,
        TUNNEL_EXIT_KEY,
        TUNNEL_ORIGINATOR_SALT,
        TUNNEL_EXIT_SALT,
    ];
}

/// Compute the BLAKE3 hash of the input data.
///
/// Used for node identifiers and general-purpose hashing.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *::blake3::hash(data).as_bytes()
}

/// Derive a key using BLAKE3's built-in key derivation mode.
///
/// The context string must be one of the registered strings in [`contexts`].
pub fn derive_key(context: &str, key_material: &[u8]) -> [u8; 32] {
    let mut hasher = ::blake3::Hasher::new_derive_key(context);
    hasher.update(key_material);
    *hasher.finalize().as_bytes()
}

/// Compute a keyed BLAKE3 hash (MAC/PRF).
///
/// The key must be exactly 32 bytes, typically derived via [`derive_key`].
pub fn keyed_hash(key: &[u8; 32], message: &[u8]) -> [u8; 32] {
    *::blake3::keyed_hash(key, message).as_bytes()
}

/// Verify that a context string is registered in the Umbra protocol.
pub fn is_registered_context(context: &str) -> bool {
    contexts::ALL_CONTEXTS.contains(&context)
}
