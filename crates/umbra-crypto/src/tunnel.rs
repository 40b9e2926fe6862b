//! Circuit handshake and per-hop session keys.
//!
//! Key establishment is a one-way authenticated exchange: the initiator
//! sends an ephemeral `X` in `create`, the hop replies with its own
//! ephemeral `Y` and an authenticator bound to its long-lived tunnel key
//! `B`. Both sides mix `DH(eph, eph)` and `DH(eph, static)` so only the
//! holder of `B` can produce a verifying reply.
//!
//! ## Session-key quadruple
//!
//! From the shared secret each side derives `(K_originator, K_exit,
//! salt_originator, salt_exit)` plus two explicit-nonce counters. The
//! originator direction protects traffic flowing back to the circuit
//! initiator; the exit direction protects traffic flowing toward the end
//! of the circuit. Each hop only ever peels its own layer.

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::blake3::{contexts, derive_key, hash, keyed_hash};
use crate::chacha20::{self, SALT_SIZE};
use crate::ed25519;
use crate::x25519::{is_key_compatible, X25519PublicKey, X25519StaticSecret};
use crate::{CryptoError, Result};

/// The two key/salt indices of a session-key quadruple.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Protects traffic flowing back toward the circuit initiator.
    Originator,
    /// Protects traffic flowing toward the end of the circuit.
    ExitNode,
}

impl Direction {
    pub fn index(self) -> usize {
        match self {
            Direction::Originator => 0,
            Direction::ExitNode => 1,
        }
    }

    /// Map a numeric direction index back to the enum. Any nonzero value
    /// selects the exit direction, matching the wire-level convention.
    pub fn from_index(index: usize) -> Self {
        if index == 0 {
            Direction::Originator
        } else {
            Direction::ExitNode
        }
    }
}

/// A session-key quadruple with per-direction explicit-nonce counters.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct SessionKeys {
    keys: [[u8; 32]; 2],
    salts: [[u8; SALT_SIZE]; 2],
    salt_explicit: [u64; 2],
}

impl SessionKeys {
    /// Derive the quadruple from a handshake shared secret.
    pub fn derive(secret: &[u8; 32]) -> Self {
        let originator_salt = derive_key(contexts::TUNNEL_ORIGINATOR_SALT, secret);
        let exit_salt = derive_key(contexts::TUNNEL_EXIT_SALT, secret);

        let mut salts = [[0u8; SALT_SIZE]; 2];
        salts[0].copy_from_slice(&originator_salt[..SALT_SIZE]);
        salts[1].copy_from_slice(&exit_salt[..SALT_SIZE]);

        Self {
            keys: [
                derive_key(contexts::TUNNEL_ORIGINATOR_KEY, secret),
                derive_key(contexts::TUNNEL_EXIT_KEY, secret),
            ],
            salts,
            salt_explicit: [0; 2],
        }
    }

    /// Key material for sealing one outgoing layer. Bumps the direction's
    /// explicit-nonce counter, so every call yields a fresh nonce.
    pub fn outgoing(&mut self, direction: Direction) -> ([u8; 32], [u8; SALT_SIZE], u64) {
        let i = direction.index();
        self.salt_explicit[i] += 1;
        (self.keys[i], self.salts[i], self.salt_explicit[i])
    }

    /// Key material for opening an incoming layer. The explicit nonce part
    /// travels on the wire, so nothing is bumped here.
    pub fn incoming(&self, direction: Direction) -> ([u8; 32], [u8; SALT_SIZE]) {
        let i = direction.index();
        (self.keys[i], self.salts[i])
    }

    /// Seal one layer in the given direction.
    pub fn seal(&mut self, direction: Direction, plaintext: &[u8]) -> Result<Vec<u8>> {
        let (key, salt, explicit) = self.outgoing(direction);
        chacha20::seal(&key, &salt, explicit, plaintext)
    }

    /// Open one layer in the given direction.
    pub fn open(&self, direction: Direction, sealed: &[u8]) -> Result<Vec<u8>> {
        let (key, salt) = self.incoming(direction);
        chacha20::open(&key, &salt, sealed)
    }
}

/// Initiator-side state of an in-flight handshake with one hop.
pub struct HandshakeState {
    secret: X25519StaticSecret,
    /// The first DH message, sent in `create`/`extend`.
    pub first_part: X25519PublicKey,
}

/// Generate the initiator's ephemeral and the first DH message.
pub fn generate_diffie_secret() -> HandshakeState {
    let secret = X25519StaticSecret::random();
    let first_part = secret.public_key();
    HandshakeState { secret, first_part }
}

fn shared_secret_from(
    dh_ephemeral: &[u8; 32],
    dh_static: &[u8; 32],
    x: &X25519PublicKey,
    y: &X25519PublicKey,
    b: &X25519PublicKey,
) -> ([u8; 32], [u8; 32]) {
    let mut material = Vec::with_capacity(5 * 32);
    material.extend_from_slice(dh_ephemeral);
    material.extend_from_slice(dh_static);
    material.extend_from_slice(x.as_bytes());
    material.extend_from_slice(y.as_bytes());
    material.extend_from_slice(b.as_bytes());

    let secret = derive_key(contexts::TUNNEL_SHARED_SECRET, &material);

    let auth_key = derive_key(contexts::TUNNEL_AUTH, &secret);
    let mut transcript = Vec::with_capacity(3 * 32);
    transcript.extend_from_slice(x.as_bytes());
    transcript.extend_from_slice(y.as_bytes());
    transcript.extend_from_slice(b.as_bytes());
    let auth = keyed_hash(&auth_key, &transcript);

    (secret, auth)
}

/// Responder side: accept the first DH message from `create`, producing the
/// shared secret plus the `(Y, AUTH)` pair to return in `created`.
pub fn generate_diffie_shared_secret(
    first_part: &X25519PublicKey,
    our_static: &X25519StaticSecret,
) -> Result<([u8; 32], X25519PublicKey, [u8; 32])> {
    if !is_key_compatible(first_part) {
        return Err(CryptoError::IncompatibleKey);
    }

    let eph = X25519StaticSecret::random();
    let y = eph.public_key();
    let b = our_static.public_key();

    let dh_ephemeral = eph.diffie_hellman(first_part);
    let dh_static = our_static.diffie_hellman(first_part);

    let (secret, auth) = shared_secret_from(
        dh_ephemeral.as_bytes(),
        dh_static.as_bytes(),
        first_part,
        &y,
        &b,
    );
    Ok((secret, y, auth))
}

/// Initiator side: verify the hop's `(Y, AUTH)` reply against its known
/// tunnel key and recover the shared secret. The authenticator is
/// compared in constant time.
pub fn verify_and_generate_shared_secret(
    state: &HandshakeState,
    y: &X25519PublicKey,
    auth: &[u8; 32],
    their_static_pk: &X25519PublicKey,
) -> Result<[u8; 32]> {
    if !is_key_compatible(y) {
        return Err(CryptoError::IncompatibleKey);
    }

    let dh_ephemeral = state.secret.diffie_hellman(y);
    let dh_static = state.secret.diffie_hellman(their_static_pk);

    let (secret, expected_auth) = shared_secret_from(
        dh_ephemeral.as_bytes(),
        dh_static.as_bytes(),
        &state.first_part,
        y,
        their_static_pk,
    );
    if !bool::from(expected_auth.as_slice().ct_eq(auth.as_slice())) {
        return Err(CryptoError::HandshakeAuth);
    }
    Ok(secret)
}

/// A node's long-lived key material: the X25519 tunnel key hops handshake
/// against and the Ed25519 key used to sign link messages.
pub struct NodeIdentity {
    tunnel_secret: X25519StaticSecret,
    signing_key: ed25519::SigningKey,
}

impl NodeIdentity {
    /// Generate a fresh identity.
    pub fn generate() -> Self {
        Self {
            tunnel_secret: X25519StaticSecret::random(),
            signing_key: ed25519::SigningKey::generate(),
        }
    }

    /// Restore an identity from raw key bytes.
    pub fn from_bytes(tunnel: [u8; 32], signing: &[u8; 32]) -> Self {
        Self {
            tunnel_secret: X25519StaticSecret::from_bytes(tunnel),
            signing_key: ed25519::SigningKey::from_bytes(signing),
        }
    }

    /// Serialize both secrets for at-rest storage: tunnel secret followed
    /// by the signing seed.
    pub fn to_bytes(&self) -> [u8; 64] {
        let mut raw = [0u8; 64];
        raw[..32].copy_from_slice(&self.tunnel_secret.to_bytes());
        raw[32..].copy_from_slice(&self.signing_key.to_bytes());
        raw
    }

    pub fn tunnel_secret(&self) -> &X25519StaticSecret {
        &self.tunnel_secret
    }

    pub fn tunnel_public(&self) -> X25519PublicKey {
        self.tunnel_secret.public_key()
    }

    /// Node id: BLAKE3 of the tunnel public key. `create` cells address
    /// nodes by this value.
    pub fn node_id(&self) -> [u8; 32] {
        hash(self.tunnel_public().as_bytes())
    }

    /// Member id: BLAKE3 of the signing public key. Stats crawlers are
    /// allow-listed by this value.
    pub fn member_id(&self) -> [u8; 32] {
        hash(&self.signing_key.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> ed25519::Signature {
        self.signing_key.sign(message)
    }

    pub fn verifying_key(&self) -> ed25519::VerifyingKey {
        self.signing_key.verifying_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_agreement() {
        let hop = NodeIdentity::generate();

        let state = generate_diffie_secret();
        let (responder_secret, y, auth) =
            generate_diffie_shared_secret(&state.first_part, hop.tunnel_secret())
                .expect("responder side");

        let initiator_secret =
            verify_and_generate_shared_secret(&state, &y, &auth, &hop.tunnel_public())
                .expect("initiator side");
        assert_eq!(initiator_secret, responder_secret);
    }

    #[test]
    fn test_handshake_rejects_wrong_static_key() {
        let hop = NodeIdentity::generate();
        let impostor = NodeIdentity::generate();

        let state = generate_diffie_secret();
        let (_, y, auth) = generate_diffie_shared_secret(&state.first_part, hop.tunnel_secret())
            .expect("responder side");

        // Verifying against a different static key must fail.
        let result =
            verify_and_generate_shared_secret(&state, &y, &auth, &impostor.tunnel_public());
        assert!(matches!(result, Err(CryptoError::HandshakeAuth)));
    }

    #[test]
    fn test_handshake_rejects_tampered_auth() {
        let hop = NodeIdentity::generate();

        let state = generate_diffie_secret();
        let (_, y, mut auth) =
            generate_diffie_shared_secret(&state.first_part, hop.tunnel_secret())
                .expect("responder side");
        auth[0] ^= 0xFF;

        let result = verify_and_generate_shared_secret(&state, &y, &auth, &hop.tunnel_public());
        assert!(matches!(result, Err(CryptoError::HandshakeAuth)));
    }

    #[test]
    fn test_handshake_rejects_low_order_first_part() {
        let hop = NodeIdentity::generate();
        let result = generate_diffie_shared_secret(
            &X25519PublicKey::from_bytes([0u8; 32]),
            hop.tunnel_secret(),
        );
        assert!(matches!(result, Err(CryptoError::IncompatibleKey)));
    }

    #[test]
    fn test_session_keys_directions_differ() {
        let keys = SessionKeys::derive(&[0x42u8; 32]);
        let (orig_key, orig_salt) = keys.incoming(Direction::Originator);
        let (exit_key, exit_salt) = keys.incoming(Direction::ExitNode);
        assert_ne!(orig_key, exit_key);
        assert_ne!(orig_salt, exit_salt);
    }

    #[test]
    fn test_session_keys_explicit_nonce_bumps() {
        let mut keys = SessionKeys::derive(&[0x42u8; 32]);
        let (_, _, e1) = keys.outgoing(Direction::ExitNode);
        let (_, _, e2) = keys.outgoing(Direction::ExitNode);
        assert_eq!(e1 + 1, e2);
        // The other direction keeps its own counter.
        let (_, _, o1) = keys.outgoing(Direction::Originator);
        assert_eq!(o1, 1);
    }

    #[test]
    fn test_seal_open_between_peers() {
        // Both sides derive from the same secret; one seals toward the
        // exit, the other opens with the same direction index.
        let mut initiator = SessionKeys::derive(&[7u8; 32]);
        let responder = SessionKeys::derive(&[7u8; 32]);

        let sealed = initiator
            .seal(Direction::ExitNode, b"extend cell body")
            .expect("seal");
        let opened = responder.open(Direction::ExitNode, &sealed).expect("open");
        assert_eq!(opened, b"extend cell body");

        // Opening with the wrong direction fails.
        assert!(responder.open(Direction::Originator, &sealed).is_err());
    }

    #[test]
    fn test_direction_index_roundtrip() {
        assert_eq!(Direction::from_index(0), Direction::Originator);
        assert_eq!(Direction::from_index(1), Direction::ExitNode);
        assert_eq!(Direction::Originator.index(), 0);
        assert_eq!(Direction::ExitNode.index(), 1);
    }

    #[test]
    fn test_node_identity_ids() {
        let id = NodeIdentity::generate();
        assert_eq!(id.node_id(), hash(id.tunnel_public().as_bytes()));
        assert_ne!(id.node_id(), id.member_id());
    }

    #[test]
    fn test_node_identity_at_rest_roundtrip() {
        let id = NodeIdentity::generate();
        let raw = id.to_bytes();
        let tunnel: [u8; 32] = raw[..32].try_into().expect("tunnel half");
        let signing: [u8; 32] = raw[32..].try_into().expect("signing half");
        let restored = NodeIdentity::from_bytes(tunnel, &signing);
        assert_eq!(id.node_id(), restored.node_id());
        assert_eq!(id.member_id(), restored.member_id());
    }
}
