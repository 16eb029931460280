//! X25519 handshake with symmetric ratcheting chains
//!
//! Round 0 carries the initiator's ephemeral public key and round 1 the
//! responder's. Both sides then hold one [`ChainKey`] per direction; every
//! chat frame is sealed under the next key of the sender's chain.
//!
//! Frame layout: `header_len (u32 LE) || header || nonce || ciphertext || tag`,
//! with the header authenticated as associated data.

use std::collections::HashMap;

use zeroize::Zeroize;

use super::{Decrypted, Protocol, ProtocolError, ProtocolKind, ProtocolResult};
use crate::crypto::{aead, ChainKey, CryptoError, HandshakeKey, KEY_SIZE};

/// Most message keys a receiver will derive ahead for out-of-order frames
const MAX_SKIP: u64 = 1000;

const LEN_PREFIX: usize = 4;

/// Header authenticated with each frame
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    /// Position of the frame in the sender's chain
    pub counter: u64,
}

impl FrameHeader {
    const SIZE: usize = 8;

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        self.counter.to_le_bytes()
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let counter: [u8; Self::SIZE] = bytes
            .try_into()
            .map_err(|_| CryptoError::Truncated("bad header length"))?;
        Ok(FrameHeader {
            counter: u64::from_le_bytes(counter),
        })
    }
}

/// Split a frame into its header bytes and sealed payload
fn split_frame(frame: &[u8]) -> Result<(&[u8], &[u8]), CryptoError> {
    let prefix: [u8; LEN_PREFIX] = frame
        .get(..LEN_PREFIX)
        .and_then(|p| p.try_into().ok())
        .ok_or(CryptoError::Truncated("missing header length"))?;
    let header_len = u32::from_le_bytes(prefix) as usize;

    let rest = &frame[LEN_PREFIX..];
    if rest.len() < header_len {
        return Err(CryptoError::Truncated("header cut short"));
    }
    Ok(rest.split_at(header_len))
}

/// Keying state once the handshake is done
struct Chains {
    sending: ChainKey,
    receiving: ChainKey,
    skipped: HashMap<u64, [u8; KEY_SIZE]>,
}

impl Chains {
    fn new((sending, receiving): (ChainKey, ChainKey)) -> Self {
        Chains {
            sending,
            receiving,
            skipped: HashMap::new(),
        }
    }

    fn seal(&mut self, plaintext: &[u8]) -> ProtocolResult<Vec<u8>> {
        let header = FrameHeader {
            counter: self.sending.index(),
        }
        .to_bytes();
        let sealed = aead::seal(&self.sending.step(), &header, plaintext)?;

        let mut frame = Vec::with_capacity(LEN_PREFIX + header.len() + sealed.len());
        frame.extend_from_slice(&(header.len() as u32).to_le_bytes());
        frame.extend_from_slice(&header);
        frame.extend_from_slice(&sealed);
        Ok(frame)
    }

    /// Open a frame. The receiving chain only moves once the frame
    /// authenticates, so a forged counter cannot desynchronize it.
    fn open(&mut self, frame: &[u8]) -> ProtocolResult<Vec<u8>> {
        let (header_bytes, sealed) = split_frame(frame)?;
        let counter = FrameHeader::from_bytes(header_bytes)?.counter;

        if let Some(mut key) = self.skipped.remove(&counter) {
            let opened = aead::open(&key, header_bytes, sealed);
            if opened.is_err() {
                self.skipped.insert(counter, key);
            } else {
                key.zeroize();
            }
            return Ok(opened?);
        }

        let next = self.receiving.index();
        if counter < next {
            return Err(ProtocolError::Replayed(counter));
        }
        if counter - next > MAX_SKIP {
            return Err(ProtocolError::TooManySkipped {
                max: MAX_SKIP,
                requested: counter - next,
            });
        }

        let mut chain = self.receiving.clone();
        let mut passed = Vec::new();
        while chain.index() < counter {
            passed.push((chain.index(), chain.step()));
        }
        let plaintext = aead::open(&chain.step(), header_bytes, sealed)?;

        self.receiving = chain;
        self.skipped.extend(passed);
        Ok(plaintext)
    }
}

impl Drop for Chains {
    fn drop(&mut self) {
        for key in self.skipped.values_mut() {
            key.zeroize();
        }
    }
}

enum State {
    Idle,
    AwaitingReply(HandshakeKey),
    Active(Chains),
}

/// Ratcheting protocol state for one side of a conversation
pub struct RatchetProtocol {
    state: State,
}

impl RatchetProtocol {
    /// Create an idle instance; it becomes initiator or responder on first use
    pub fn new() -> Self {
        RatchetProtocol { state: State::Idle }
    }
}

impl Default for RatchetProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl Protocol for RatchetProtocol {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Ratchet
    }

    fn new_session(&mut self) -> ProtocolResult<Vec<u8>> {
        if !matches!(self.state, State::Idle) {
            return Err(ProtocolError::AlreadyStarted);
        }
        let key = HandshakeKey::generate();
        let first = key.public_bytes().to_vec();
        self.state = State::AwaitingReply(key);
        Ok(first)
    }

    fn decrypt(&mut self, data: &[u8]) -> ProtocolResult<Decrypted> {
        match &mut self.state {
            State::Idle => {
                let key = HandshakeKey::generate();
                let root = key.agree(data).map_err(|e| match e {
                    CryptoError::InvalidKeyLength { .. } => {
                        ProtocolError::UnexpectedHandshake("expected initiator key")
                    }
                    other => other.into(),
                })?;
                self.state = State::Active(Chains::new(root.chains(false)));
                Ok(Decrypted::Step(vec![key.public_bytes().to_vec()]))
            }
            State::AwaitingReply(key) => {
                let root = key.agree(data).map_err(|e| match e {
                    CryptoError::InvalidKeyLength { .. } => {
                        ProtocolError::UnexpectedHandshake("expected responder key")
                    }
                    other => other.into(),
                })?;
                self.state = State::Active(Chains::new(root.chains(true)));
                Ok(Decrypted::Messages(Vec::new()))
            }
            State::Active(chains) => Ok(Decrypted::Messages(vec![chains.open(data)?])),
        }
    }

    fn encrypt(&mut self, data: &[u8]) -> ProtocolResult<Vec<Vec<u8>>> {
        match &mut self.state {
            State::Active(chains) => Ok(vec![chains.seal(data)?]),
            _ => Err(ProtocolError::NotActive),
        }
    }

    fn is_active(&self) -> bool {
        matches!(self.state, State::Active(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (RatchetProtocol, RatchetProtocol) {
        let mut alice = RatchetProtocol::new();
        let mut bob = RatchetProtocol::new();

        let first = alice.new_session().unwrap();
        let Decrypted::Step(reply) = bob.decrypt(&first).unwrap() else {
            panic!("responder should answer with a step");
        };
        alice.decrypt(&reply[0]).unwrap();
        (alice, bob)
    }

    fn seal(proto: &mut RatchetProtocol, msg: &[u8]) -> Vec<u8> {
        proto.encrypt(msg).unwrap().remove(0)
    }

    fn open(proto: &mut RatchetProtocol, frame: &[u8]) -> Vec<u8> {
        match proto.decrypt(frame).unwrap() {
            Decrypted::Messages(mut msgs) => msgs.remove(0),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_conversation_both_ways() {
        let (mut alice, mut bob) = pair();

        for i in 0..5 {
            let line = format!("line {}", i);
            let frame = seal(&mut alice, line.as_bytes());
            assert_eq!(open(&mut bob, &frame), line.as_bytes());
        }

        let reply = seal(&mut bob, b"got them");
        assert_eq!(open(&mut alice, &reply), b"got them");
    }

    #[test]
    fn test_out_of_order_delivery() {
        let (mut alice, mut bob) = pair();

        let first = seal(&mut alice, b"first");
        let second = seal(&mut alice, b"second");
        let third = seal(&mut alice, b"third");

        assert_eq!(open(&mut bob, &third), b"third");
        assert_eq!(open(&mut bob, &first), b"first");
        assert_eq!(open(&mut bob, &second), b"second");
    }

    #[test]
    fn test_replay_rejected() {
        let (mut alice, mut bob) = pair();

        let frame = seal(&mut alice, b"once");
        open(&mut bob, &frame);
        assert_eq!(bob.decrypt(&frame), Err(ProtocolError::Replayed(0)));
    }

    #[test]
    fn test_separate_handshakes_do_not_interoperate() {
        let (mut alice, _) = pair();
        let (_, mut carol) = pair();

        let frame = seal(&mut alice, b"Secret");
        assert_eq!(
            carol.decrypt(&frame),
            Err(ProtocolError::Crypto(CryptoError::OpenFailed))
        );
    }

    #[test]
    fn test_forged_frame_does_not_desync() {
        let (mut alice, mut bob) = pair();

        let genuine = seal(&mut alice, b"real");
        let mut forged = genuine.clone();
        let last = forged.len() - 1;
        forged[last] ^= 0xFF;

        assert!(bob.decrypt(&forged).is_err());
        assert_eq!(open(&mut bob, &genuine), b"real");
    }

    #[test]
    fn test_skip_window_enforced() {
        let (_, mut bob) = pair();

        let mut frame = Vec::new();
        frame.extend_from_slice(&(FrameHeader::SIZE as u32).to_le_bytes());
        frame.extend_from_slice(&FrameHeader { counter: MAX_SKIP + 1 }.to_bytes());
        frame.extend_from_slice(&[0u8; 40]);

        assert_eq!(
            bob.decrypt(&frame),
            Err(ProtocolError::TooManySkipped {
                max: MAX_SKIP,
                requested: MAX_SKIP + 1
            })
        );
    }

    #[test]
    fn test_truncated_frames_rejected() {
        let (_, mut bob) = pair();
        assert!(matches!(
            bob.decrypt(&[8, 0]),
            Err(ProtocolError::Crypto(CryptoError::Truncated(_)))
        ));
        assert!(matches!(
            bob.decrypt(&[8, 0, 0, 0, 1, 2]),
            Err(ProtocolError::Crypto(CryptoError::Truncated(_)))
        ));
    }

    #[test]
    fn test_malformed_handshake_key_rejected() {
        let mut bob = RatchetProtocol::new();
        assert!(matches!(
            bob.decrypt(b"not a key"),
            Err(ProtocolError::UnexpectedHandshake(_))
        ));
        assert!(!bob.is_active());

        assert_eq!(
            bob.decrypt(&[0u8; 32]),
            Err(ProtocolError::Crypto(CryptoError::NonContributory))
        );
    }

    #[test]
    fn test_new_session_twice_rejected() {
        let mut alice = RatchetProtocol::new();
        alice.new_session().unwrap();
        assert_eq!(alice.new_session(), Err(ProtocolError::AlreadyStarted));
    }

    #[test]
    fn test_header_serialization() {
        let header = FrameHeader { counter: 12345 };
        assert_eq!(FrameHeader::from_bytes(&header.to_bytes()).unwrap(), header);
        assert!(FrameHeader::from_bytes(&[1, 2, 3]).is_err());
    }
}
