//! Unencrypted protocol with the same two-round handshake shape
//!
//! Useful for watching traffic on the wire while debugging a node.

use super::{Decrypted, Protocol, ProtocolError, ProtocolKind, ProtocolResult};

const HELLO: &[u8] = b"PEERCHAT-PLAIN-HELLO";
const ACK: &[u8] = b"PEERCHAT-PLAIN-ACK";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    AwaitingAck,
    Active,
}

/// Pass-through protocol
#[derive(Debug)]
pub struct PlainProtocol {
    state: State,
}

impl PlainProtocol {
    /// Create an idle instance
    pub fn new() -> Self {
        PlainProtocol { state: State::Idle }
    }
}

impl Default for PlainProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl Protocol for PlainProtocol {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Plain
    }

    fn new_session(&mut self) -> ProtocolResult<Vec<u8>> {
        if self.state != State::Idle {
            return Err(ProtocolError::AlreadyStarted);
        }
        self.state = State::AwaitingAck;
        Ok(HELLO.to_vec())
    }

    fn decrypt(&mut self, data: &[u8]) -> ProtocolResult<Decrypted> {
        match self.state {
            State::Idle if data == HELLO => {
                self.state = State::Active;
                Ok(Decrypted::Step(vec![ACK.to_vec()]))
            }
            State::Idle => Err(ProtocolError::UnexpectedHandshake("expected hello")),
            State::AwaitingAck if data == ACK => {
                self.state = State::Active;
                Ok(Decrypted::Messages(Vec::new()))
            }
            State::AwaitingAck => Err(ProtocolError::UnexpectedHandshake("expected ack")),
            State::Active => Ok(Decrypted::Messages(vec![data.to_vec()])),
        }
    }

    fn encrypt(&mut self, data: &[u8]) -> ProtocolResult<Vec<Vec<u8>>> {
        if self.state != State::Active {
            return Err(ProtocolError::NotActive);
        }
        Ok(vec![data.to_vec()])
    }

    fn is_active(&self) -> bool {
        self.state == State::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrong_handshake_payload() {
        let mut responder = PlainProtocol::new();
        assert!(responder.decrypt(b"hi").is_err());

        let mut initiator = PlainProtocol::new();
        initiator.new_session().unwrap();
        assert!(initiator.decrypt(HELLO).is_err());
        assert!(!initiator.is_active());
    }

    #[test]
    fn test_payload_passes_through() {
        let mut responder = PlainProtocol::new();
        responder.decrypt(HELLO).unwrap();
        assert_eq!(responder.encrypt(b"clear").unwrap(), vec![b"clear".to_vec()]);
    }
}
