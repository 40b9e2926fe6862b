//! # umbra-crypto
//!
//! Cryptographic primitives for the Umbra tunnel overlay.
//!
//! The suite is fixed; no algorithm negotiation happens on the wire:
//!
//! - [`blake3`] — domain-separated BLAKE3 hashing and key derivation
//! - [`x25519`] — X25519 key agreement (RFC 7748)
//! - [`chacha20`] — ChaCha20-Poly1305 AEAD with salted explicit nonces
//! - [`ed25519`] — Ed25519 signing for link-authenticated messages
//! - [`tunnel`] — the circuit handshake and per-hop session keys

pub mod blake3;
pub mod chacha20;
pub mod ed25519;
pub mod tunnel;
pub mod x25519;

/// Error types for cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Ed25519 signature verification failed.
    #[error("signature verification failed")]
    SignatureVerification,

    /// AEAD decryption failed (authentication tag mismatch).
    #[error("AEAD decryption failed")]
    AeadDecryption,

    /// Handshake authenticator did not verify.
    #[error("handshake authentication failed")]
    HandshakeAuth,

    /// A peer public key is unusable with the fixed suite.
    #[error("incompatible public key")]
    IncompatibleKey,

    /// Invalid input data.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;
