//! Pluggable conversation protocols
//!
//! A [`Protocol`] owns the cryptographic state of one side of one
//! conversation. The server never looks inside it: it feeds handshake
//! secrets and chat ciphertexts in, and relays whatever the protocol asks
//! it to relay.
//!
//! # Handshake shape
//!
//! ```text
//! initiator                         responder
//!   new_session() ── round 0 ──────▶ decrypt() -> Step([reply])
//!   decrypt() ◀───── round 1 ─────── (already active)
//!   -> Messages([])  (active)
//! ```
//!
//! Protocols with longer handshakes keep returning [`Decrypted::Step`]
//! until they are done.

mod plain;
mod ratchet;

pub use plain::PlainProtocol;
pub use ratchet::{FrameHeader, RatchetProtocol};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::CryptoError;

/// Protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Underlying cryptographic failure
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Chat traffic before the handshake finished
    #[error("Protocol is not active yet")]
    NotActive,

    /// A handshake payload arrived that this state cannot accept
    #[error("Unexpected handshake payload: {0}")]
    UnexpectedHandshake(&'static str),

    /// `new_session` called on a protocol that already started
    #[error("Session already started")]
    AlreadyStarted,

    /// A frame counter was already consumed
    #[error("Replayed message counter {0}")]
    Replayed(u64),

    /// Too many messages skipped (out-of-order limit exceeded)
    #[error("Too many skipped messages (max: {max}, requested: {requested})")]
    TooManySkipped {
        /// Maximum allowed skipped messages
        max: u64,
        /// Number of messages requested to skip
        requested: u64,
    },
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Outcome of feeding bytes into a protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decrypted {
    /// Handshake still in progress; each payload must be relayed to the
    /// peer as the next handshake round.
    Step(Vec<Vec<u8>>),
    /// Decrypted payloads. Empty when the input only completed the
    /// handshake.
    Messages(Vec<Vec<u8>>),
}

/// Which protocol algorithm a session runs
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    /// X25519 handshake followed by symmetric KDF chains
    #[default]
    Ratchet,
    /// Unencrypted two-round handshake, for debugging
    Plain,
}

impl ProtocolKind {
    /// Create a fresh protocol instance of this kind
    pub fn instantiate(self) -> Box<dyn Protocol> {
        match self {
            ProtocolKind::Ratchet => Box::new(RatchetProtocol::new()),
            ProtocolKind::Plain => Box::new(PlainProtocol::new()),
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolKind::Ratchet => write!(f, "ratchet"),
            ProtocolKind::Plain => write!(f, "plain"),
        }
    }
}

impl FromStr for ProtocolKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ratchet" => Ok(ProtocolKind::Ratchet),
            "plain" => Ok(ProtocolKind::Plain),
            other => Err(format!("unknown protocol: {}", other)),
        }
    }
}

/// One side of a conversation protocol
pub trait Protocol: Send {
    /// The algorithm this instance runs
    fn kind(&self) -> ProtocolKind;

    /// Start a handshake as initiator, returning the round-0 payload
    fn new_session(&mut self) -> ProtocolResult<Vec<u8>>;

    /// Feed a handshake secret or a chat ciphertext
    fn decrypt(&mut self, data: &[u8]) -> ProtocolResult<Decrypted>;

    /// Encrypt a chat payload into one or more wire chunks
    fn encrypt(&mut self, data: &[u8]) -> ProtocolResult<Vec<Vec<u8>>>;

    /// Whether the handshake has completed on this side
    fn is_active(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drive a full handshake between two fresh instances of `kind`.
    fn establish(kind: ProtocolKind) -> (Box<dyn Protocol>, Box<dyn Protocol>) {
        let mut initiator = kind.instantiate();
        let mut responder = kind.instantiate();

        let first = initiator.new_session().unwrap();
        let reply = match responder.decrypt(&first).unwrap() {
            Decrypted::Step(steps) => steps,
            other => panic!("expected a handshake step, got {:?}", other),
        };
        assert_eq!(reply.len(), 1);
        assert!(responder.is_active());
        assert!(!initiator.is_active());

        assert_eq!(
            initiator.decrypt(&reply[0]).unwrap(),
            Decrypted::Messages(vec![])
        );
        assert!(initiator.is_active());

        (initiator, responder)
    }

    #[test]
    fn test_both_kinds_exchange_messages() {
        for kind in [ProtocolKind::Ratchet, ProtocolKind::Plain] {
            let (mut initiator, mut responder) = establish(kind);
            assert_eq!(initiator.kind(), kind);

            let chunks = initiator.encrypt(b"ping").unwrap();
            let out = responder.decrypt(&chunks[0]).unwrap();
            assert_eq!(out, Decrypted::Messages(vec![b"ping".to_vec()]));

            let chunks = responder.encrypt(b"pong").unwrap();
            let out = initiator.decrypt(&chunks[0]).unwrap();
            assert_eq!(out, Decrypted::Messages(vec![b"pong".to_vec()]));
        }
    }

    #[test]
    fn test_encrypt_before_handshake_fails() {
        for kind in [ProtocolKind::Ratchet, ProtocolKind::Plain] {
            let mut proto = kind.instantiate();
            assert_eq!(proto.encrypt(b"too early"), Err(ProtocolError::NotActive));
        }
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("ratchet".parse::<ProtocolKind>(), Ok(ProtocolKind::Ratchet));
        assert_eq!("PLAIN".parse::<ProtocolKind>(), Ok(ProtocolKind::Plain));
        assert!("otr".parse::<ProtocolKind>().is_err());
        assert_eq!(ProtocolKind::default(), ProtocolKind::Ratchet);
    }

    #[test]
    fn test_kind_serializes_lowercase() {
        let json = serde_json::to_string(&ProtocolKind::Plain).unwrap();
        assert_eq!(json, "\"plain\"");
    }
}
