//! Primitives behind the ratchet protocol
//!
//! - [`handshake`]: ephemeral X25519 agreement producing a [`RootKey`]
//! - [`kdf`]: BLAKE3 derivation and the per-direction [`ChainKey`]
//! - [`aead`]: ChaCha20-Poly1305 sealing of single frames

pub mod aead;
pub mod handshake;
pub mod kdf;

pub use handshake::{HandshakeKey, RootKey, PUBLIC_KEY_SIZE};
pub use kdf::{ChainKey, KEY_SIZE};

use thiserror::Error;

/// Errors from the primitives
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// A key arrived with the wrong number of bytes
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length in bytes
        expected: usize,
        /// Received length in bytes
        actual: usize,
    },

    /// The peer's public key is a low-order point and contributes nothing
    #[error("Peer public key does not contribute to the shared secret")]
    NonContributory,

    /// Sealing a frame failed
    #[error("Failed to seal frame")]
    SealFailed,

    /// Authentication tag mismatch: wrong key, wrong header, or tampering
    #[error("Failed to open frame: authentication tag mismatch")]
    OpenFailed,

    /// The frame is too short to hold what its layout promises
    #[error("Truncated frame: {0}")]
    Truncated(&'static str),
}

/// Result type for cryptographic operations
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Generate cryptographically secure random bytes
pub fn random_bytes<const N: usize>() -> [u8; N] {
    use rand::RngCore;
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

#[cfg(test)]
mod integration_tests {
    use super::*;

    #[test]
    fn test_agreement_feeds_chains_and_frames() {
        let initiator = HandshakeKey::generate();
        let responder = HandshakeKey::generate();

        let (mut i_send, _) = initiator
            .agree(&responder.public_bytes())
            .unwrap()
            .chains(true);
        let (_, mut r_recv) = responder
            .agree(&initiator.public_bytes())
            .unwrap()
            .chains(false);

        let sealed = aead::seal(&i_send.step(), b"hdr", b"hello over the wire").unwrap();
        let opened = aead::open(&r_recv.step(), b"hdr", &sealed).unwrap();
        assert_eq!(opened, b"hello over the wire");
    }

    #[test]
    fn test_random_bytes_differ() {
        assert_ne!(random_bytes::<32>(), random_bytes::<32>());
    }
}
