//! ChaCha20-Poly1305 frame sealing
//!
//! A sealed frame is `nonce || ciphertext || tag`. Message keys are never
//! reused, but the nonce is still random so a repeated key cannot leak.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};

use super::kdf::KEY_SIZE;
use super::{random_bytes, CryptoError, CryptoResult};

/// Size of the nonce in bytes
pub const NONCE_SIZE: usize = 12;

/// Size of the authentication tag in bytes
pub const TAG_SIZE: usize = 16;

/// Encrypt `plaintext` under `key`, authenticating `aad` alongside it
pub fn seal(key: &[u8; KEY_SIZE], aad: &[u8], plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
    let nonce_bytes = random_bytes::<NONCE_SIZE>();
    let ciphertext = ChaCha20Poly1305::new(key.into())
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::SealFailed)?;

    let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Decrypt a frame produced by [`seal`] with the same key and `aad`
pub fn open(key: &[u8; KEY_SIZE], aad: &[u8], sealed: &[u8]) -> CryptoResult<Vec<u8>> {
    if sealed.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::Truncated("shorter than nonce and tag"));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);

    ChaCha20Poly1305::new(key.into())
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::OpenFailed)
}
