//! ChaCha20-Poly1305 AEAD with salted explicit nonces (RFC 8439).
//!
//! Tunnel layers never reuse a nonce for a given key: the 12-byte nonce is
//! the concatenation of a per-direction 4-byte salt (derived with the
//! session keys, never on the wire) and an 8-byte explicit counter that the
//! sender bumps per packet and ships in front of the ciphertext.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};

use crate::{CryptoError, Result};

/// Key size for ChaCha20-Poly1305 (256 bits).
pub const KEY_SIZE: usize = 32;

/// Implicit nonce part carried in the session keys (never on the wire).
pub const SALT_SIZE: usize = 4;

/// Explicit nonce part prepended to every sealed message.
pub const EXPLICIT_SIZE: usize = 8;

/// Authentication tag size (128 bits).
pub const TAG_SIZE: usize = 16;

fn nonce_from(salt: &[u8; SALT_SIZE], explicit: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..SALT_SIZE].copy_from_slice(salt);
    nonce[SALT_SIZE..].copy_from_slice(&explicit.to_be_bytes());
    nonce
}

/// Seal one layer: `explicit(8, BE) || ciphertext || tag`.
///
/// The caller supplies a fresh `salt_explicit` per packet (see
/// `SessionKeys::outgoing` in [`crate::tunnel`]).
pub fn seal(
    key: &[u8; KEY_SIZE],
    salt: &[u8; SALT_SIZE],
    salt_explicit: u64,
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = nonce_from(salt, salt_explicit);
    let ct = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::AeadDecryption)?;

    let mut out = Vec::with_capacity(EXPLICIT_SIZE + ct.len());
    out.extend_from_slice(&salt_explicit.to_be_bytes());
    out.extend_from_slice(&ct);
    Ok(out)
}

/// Open one layer sealed by [`seal`], recovering the explicit nonce part
/// from the front of the message.
pub fn open(key: &[u8; KEY_SIZE], salt: &[u8; SALT_SIZE], sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < EXPLICIT_SIZE + TAG_SIZE {
        return Err(CryptoError::InvalidInput(format!(
            "sealed message too short: {} bytes",
            sealed.len()
        )));
    }
    let mut explicit = [0u8; EXPLICIT_SIZE];
    explicit.copy_from_slice(&sealed[..EXPLICIT_SIZE]);
    let nonce = nonce_from(salt, u64::from_be_bytes(explicit));

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(&nonce), &sealed[EXPLICIT_SIZE..])
        .map_err(|_| CryptoError::AeadDecryption)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let key = [0x42u8; KEY_SIZE];
        let salt = [0x01u8; SALT_SIZE];

        let sealed = seal(&key, &salt, 7, b"layered payload").expect("seal");
        assert_eq!(sealed.len(), EXPLICIT_SIZE + 15 + TAG_SIZE);
        assert_eq!(&sealed[..EXPLICIT_SIZE], &7u64.to_be_bytes());

        let opened = open(&key, &salt, &sealed).expect("open");
        assert_eq!(opened, b"layered payload");
    }

    #[test]
    fn test_wrong_key_fails() {
        let salt = [0x01u8; SALT_SIZE];
        let sealed = seal(&[0x01u8; KEY_SIZE], &salt, 1, b"data").expect("seal");
        assert!(open(&[0x02u8; KEY_SIZE], &salt, &sealed).is_err());
    }

    #[test]
    fn test_wrong_salt_fails() {
        let key = [0x01u8; KEY_SIZE];
        let sealed = seal(&key, &[0x01u8; SALT_SIZE], 1, b"data").expect("seal");
        assert!(open(&key, &[0x02u8; SALT_SIZE], &sealed).is_err());
    }

    #[test]
    fn test_tampered_explicit_fails() {
        let key = [0x01u8; KEY_SIZE];
        let salt = [0x01u8; SALT_SIZE];
        let mut sealed = seal(&key, &salt, 1, b"data").expect("seal");
        sealed[0] ^= 0xFF;
        assert!(open(&key, &salt, &sealed).is_err());
    }

    #[test]
    fn test_too_short_rejected() {
        let key = [0x01u8; KEY_SIZE];
        let salt = [0x01u8; SALT_SIZE];
        assert!(open(&key, &salt, &[0u8; EXPLICIT_SIZE + TAG_SIZE - 1]).is_err());
    }

    #[test]
    fn test_distinct_explicit_distinct_ciphertext() {
        let key = [0x42u8; KEY_SIZE];
        let salt = [0x01u8; SALT_SIZE];
        let a = seal(&key, &salt, 1, b"same").expect("seal");
        let b = seal(&key, &salt, 2, b"same").expect("seal");
        assert_ne!(a[EXPLICIT_SIZE..], b[EXPLICIT_SIZE..]);
    }
}
