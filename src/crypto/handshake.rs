//! Ephemeral X25519 agreement
//!
//! Each side of a ratchet handshake generates one [`HandshakeKey`], sends
//! its public half, and agrees on a [`RootKey`] once the peer's public half
//! arrives. The root key splits into one [`ChainKey`] per direction.

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::ZeroizeOnDrop;

use super::kdf::{self, ChainKey, KEY_SIZE};
use super::{CryptoError, CryptoResult};

/// Size of an X25519 public key on the wire
pub const PUBLIC_KEY_SIZE: usize = 32;

/// One side's ephemeral key for a single handshake
pub struct HandshakeKey {
    secret: StaticSecret,
    public: PublicKey,
}

impl HandshakeKey {
    /// Generate a fresh key
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        HandshakeKey { secret, public }
    }

    /// Public half, as sent in a handshake secret
    pub fn public_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.public.to_bytes()
    }

    /// Agree on a root key with the peer's public half as received
    pub fn agree(&self, peer_public: &[u8]) -> CryptoResult<RootKey> {
        let bytes: [u8; PUBLIC_KEY_SIZE] =
            peer_public.try_into().map_err(|_| CryptoError::InvalidKeyLength {
                expected: PUBLIC_KEY_SIZE,
                actual: peer_public.len(),
            })?;

        let shared = self.secret.diffie_hellman(&PublicKey::from(bytes));
        if !shared.was_contributory() {
            return Err(CryptoError::NonContributory);
        }
        Ok(RootKey(kdf::derive(shared.as_bytes(), "peerchat x25519 root v1")))
    }
}

impl std::fmt::Debug for HandshakeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HandshakeKey({}...)", &hex::encode(self.public_bytes())[..16])
    }
}

/// Secret both sides hold after a handshake
#[derive(ZeroizeOnDrop)]
pub struct RootKey([u8; KEY_SIZE]);

impl RootKey {
    /// Split into `(sending, receiving)` chains for the given role
    pub fn chains(&self, initiator: bool) -> (ChainKey, ChainKey) {
        let from_initiator = ChainKey::new(kdf::derive(&self.0, "peerchat initiator chain v1"));
        let from_responder = ChainKey::new(kdf::derive(&self.0, "peerchat responder chain v1"));
        if initiator {
            (from_initiator, from_responder)
        } else {
            (from_responder, from_initiator)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles_get_mirrored_chains() {
        let alice = HandshakeKey::generate();
        let bob = HandshakeKey::generate();

        let (mut a_send, mut a_recv) = alice.agree(&bob.public_bytes()).unwrap().chains(true);
        let (mut b_send, mut b_recv) = bob.agree(&alice.public_bytes()).unwrap().chains(false);

        let a_first = a_send.step();
        assert_eq!(a_first, b_recv.step());
        assert_eq!(b_send.step(), a_recv.step());
        assert_ne!(a_first, b_send.step());
    }

    #[test]
    fn test_third_party_disagrees() {
        let alice = HandshakeKey::generate();
        let bob = HandshakeKey::generate();
        let carol = HandshakeKey::generate();

        let (mut with_bob, _) = alice.agree(&bob.public_bytes()).unwrap().chains(true);
        let (mut with_carol, _) = alice.agree(&carol.public_bytes()).unwrap().chains(true);
        assert_ne!(with_bob.step(), with_carol.step());
    }

    #[test]
    fn test_bad_public_keys_rejected() {
        let key = HandshakeKey::generate();
        assert!(matches!(
            key.agree(&[1u8; 31]),
            Err(CryptoError::InvalidKeyLength {
                expected: 32,
                actual: 31
            })
        ));
        assert!(matches!(
            key.agree(&[0u8; PUBLIC_KEY_SIZE]),
            Err(CryptoError::NonContributory)
        ));
    }

    #[test]
    fn test_debug_shows_public_prefix_only() {
        let key = HandshakeKey::generate();
        let shown = format!("{:?}", key);
        assert!(shown.starts_with("HandshakeKey("));
        assert!(shown.contains(&hex::encode(key.public_bytes())[..16]));
    }
}
