//! Session bookkeeping and resolution
//!
//! A node keeps one [`Session`] per conversation partner, except when it
//! talks to itself: then two sessions exist for the same identity, one per
//! direction, and incoming traffic has to be routed to the right one.
//!
//! - Handshake rounds are routed by parity: `sessions[round % 2]`.
//! - Chat messages carry the sender's session creation time; the receiver
//!   picks the session that does *not* own that timestamp.
//!
//! Sessions are created lazily when a handshake round arrives and the
//! expected number of sessions (1, or 2 for self-talk) is not there yet.
//! Round 0 creates a fresh responder; later rounds adopt the protocol
//! instance parked by [`SessionStore::begin`] when we initiated.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::message::PeerId;
use crate::protocol::{Protocol, ProtocolKind};

/// Errors raised while resolving traffic to a session
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// A handshake reply arrived for a handshake we never started
    #[error("Unsolicited handshake reply from {peer} at round {round}")]
    UnexpectedReply {
        /// Sender of the reply
        peer: PeerId,
        /// Round carried by the reply
        round: u32,
    },

    /// A handshake round did not advance the session
    #[error("Out-of-order handshake from {peer}: round {round} after {last}")]
    OutOfOrder {
        /// Sender of the round
        peer: PeerId,
        /// Round carried by the message
        round: u32,
        /// Last round the session processed
        last: u32,
    },

    /// The message names a different protocol than the session runs
    #[error("Protocol mismatch: session runs {expected}, message uses {got}")]
    ProtocolMismatch {
        /// Protocol of the resolved session
        expected: ProtocolKind,
        /// Protocol named by the message
        got: ProtocolKind,
    },

    /// No session exists for the peer
    #[error("No active session with {0}")]
    NoActiveSession(PeerId),

    /// A session already exists for the peer
    #[error("A session with {0} already exists")]
    SessionExists(PeerId),

    /// We already sent a handshake to the peer and await its reply
    #[error("A handshake with {0} is already in progress")]
    HandshakePending(PeerId),

    /// More sessions than the cardinality rule allows
    #[error("Found {found} sessions with {peer}, expected at most {max}")]
    TooManySessions {
        /// Peer whose sessions overflowed
        peer: PeerId,
        /// Sessions found
        found: usize,
        /// Maximum allowed
        max: usize,
    },
}

/// Current time in Unix nanoseconds
pub fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Cryptographic conversation state with one peer
pub struct Session {
    peer: PeerId,
    protocol: Box<dyn Protocol>,
    start_time: u64,
    last_round: Option<u32>,
}

impl Session {
    fn new(peer: PeerId, protocol: Box<dyn Protocol>, start_time: u64) -> Self {
        Session {
            peer,
            protocol,
            start_time,
            last_round: None,
        }
    }

    /// Identity of the remote side
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// Creation instant (Unix nanos); echoed in every chat message sent on
    /// this session
    pub fn start_time(&self) -> u64 {
        self.start_time
    }

    /// Protocol algorithm of this session
    pub fn kind(&self) -> ProtocolKind {
        self.protocol.kind()
    }

    /// Whether the handshake has completed
    pub fn is_active(&self) -> bool {
        self.protocol.is_active()
    }

    /// Last handshake round processed on this session
    pub fn last_round(&self) -> Option<u32> {
        self.last_round
    }

    /// Protocol state, for feeding bytes in or out
    pub fn protocol_mut(&mut self) -> &mut dyn Protocol {
        self.protocol.as_mut()
    }

    fn accept_round(&mut self, round: u32) -> Result<(), SessionError> {
        if let Some(last) = self.last_round {
            if round <= last {
                return Err(SessionError::OutOfOrder {
                    peer: self.peer.clone(),
                    round,
                    last,
                });
            }
        }
        self.last_round = Some(round);
        Ok(())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.peer)
            .field("kind", &self.kind())
            .field("active", &self.is_active())
            .field("start_time", &self.start_time)
            .field("last_round", &self.last_round)
            .finish()
    }
}

/// A handshake message resolved to its session
pub struct Resolved<'a> {
    /// The session the round belongs to
    pub session: &'a mut Session,
    /// Whether resolving this round created the session
    pub created: bool,
}

/// All sessions owned by a node
#[derive(Default)]
pub struct SessionStore {
    sessions: Vec<Session>,
    pending: HashMap<PeerId, Box<dyn Protocol>>,
}

impl SessionStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the store holds no sessions
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Sessions with `peer`, in creation order
    pub fn find_sessions(&self, peer: &PeerId) -> Vec<&Session> {
        self.sessions.iter().filter(|s| &s.peer == peer).collect()
    }

    fn indices_for(&self, peer: &PeerId) -> Vec<usize> {
        self.sessions
            .iter()
            .enumerate()
            .filter(|(_, s)| &s.peer == peer)
            .map(|(i, _)| i)
            .collect()
    }

    /// Whether we are waiting for the reply to a handshake we started
    pub fn is_pending(&self, peer: &PeerId) -> bool {
        self.pending.contains_key(peer)
    }

    /// Append a session with `peer`.
    ///
    /// Creation times of sessions with the same peer never collide.
    pub fn create_session(
        &mut self,
        peer: PeerId,
        protocol: Box<dyn Protocol>,
        start_time: u64,
    ) -> &mut Session {
        let mut start_time = start_time;
        while self
            .sessions
            .iter()
            .any(|s| s.peer == peer && s.start_time == start_time)
        {
            start_time += 1;
        }

        self.sessions.push(Session::new(peer, protocol, start_time));
        let last = self.sessions.len() - 1;
        &mut self.sessions[last]
    }

    /// Park the initiator side of a handshake we are starting with `peer`.
    ///
    /// Refused while a session or another pending handshake exists.
    pub fn begin(&mut self, peer: PeerId, protocol: Box<dyn Protocol>) -> Result<(), SessionError> {
        if self.sessions.iter().any(|s| s.peer == peer) {
            return Err(SessionError::SessionExists(peer));
        }
        if self.pending.contains_key(&peer) {
            return Err(SessionError::HandshakePending(peer));
        }
        self.pending.insert(peer, protocol);
        Ok(())
    }

    /// Drop a parked initiator, e.g. when its first round could not be sent
    pub fn abandon(&mut self, peer: &PeerId) -> bool {
        self.pending.remove(peer).is_some()
    }

    /// Remove the session with `peer` created at `start_time`.
    ///
    /// Used to undo a session whose first round failed. A session that
    /// adopted a parked initiator (first round above 0) hands it back to
    /// the pending table, so the genuine reply can still complete it.
    pub fn discard(&mut self, peer: &PeerId, start_time: u64) -> bool {
        let Some(idx) = self
            .sessions
            .iter()
            .position(|s| &s.peer == peer && s.start_time == start_time)
        else {
            return false;
        };

        let session = self.sessions.remove(idx);
        if session.last_round.is_some_and(|round| round > 0) {
            self.pending.insert(session.peer, session.protocol);
        }
        true
    }

    /// Route an incoming handshake round, creating its session if needed
    pub fn resolve_handshake(
        &mut self,
        local: &PeerId,
        source: &PeerId,
        round: u32,
        kind: ProtocolKind,
    ) -> Result<Resolved<'_>, SessionError> {
        let self_talk = source == local;
        let expected = if self_talk { 2 } else { 1 };
        let indices = self.indices_for(source);

        if indices.len() > expected {
            return Err(SessionError::TooManySessions {
                peer: source.clone(),
                found: indices.len(),
                max: expected,
            });
        }

        if indices.len() < expected {
            let protocol = if round == 0 {
                kind.instantiate()
            } else {
                let pending = self.pending.remove(source).ok_or_else(|| {
                    SessionError::UnexpectedReply {
                        peer: source.clone(),
                        round,
                    }
                })?;
                if pending.kind() != kind {
                    return Err(SessionError::ProtocolMismatch {
                        expected: pending.kind(),
                        got: kind,
                    });
                }
                pending
            };

            let session = self.create_session(source.clone(), protocol, now_nanos());
            session.last_round = Some(round);
            return Ok(Resolved {
                session,
                created: true,
            });
        }

        let idx = if self_talk {
            indices[(round % 2) as usize]
        } else {
            indices[0]
        };
        let session = &mut self.sessions[idx];

        if session.kind() != kind {
            return Err(SessionError::ProtocolMismatch {
                expected: session.kind(),
                got: kind,
            });
        }
        session.accept_round(round)?;

        Ok(Resolved {
            session,
            created: false,
        })
    }

    /// Route an incoming chat message. Never creates a session.
    pub fn resolve_chat(
        &mut self,
        local: &PeerId,
        source: &PeerId,
        session_time: u64,
    ) -> Result<&mut Session, SessionError> {
        let indices = self.indices_for(source);

        let idx = if source == local {
            if indices.len() != 2 {
                return Err(SessionError::NoActiveSession(source.clone()));
            }
            if self.sessions[indices[0]].start_time == session_time {
                indices[1]
            } else {
                indices[0]
            }
        } else {
            *indices
                .first()
                .ok_or_else(|| SessionError::NoActiveSession(source.clone()))?
        };

        Ok(&mut self.sessions[idx])
    }

    /// The session outbound chat to `peer` is encrypted under
    pub fn outbound_session(&mut self, peer: &PeerId) -> Result<&mut Session, SessionError> {
        self.sessions
            .iter_mut()
            .find(|s| &s.peer == peer)
            .ok_or_else(|| SessionError::NoActiveSession(peer.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Decrypted;

    fn me() -> PeerId {
        PeerId::new("00:11:22:33:44:55", "me")
    }

    fn bob() -> PeerId {
        PeerId::new("66:77:88:99:aa:bb", "bob")
    }

    #[test]
    fn test_non_self_round_zero_creates_one_session() {
        let mut store = SessionStore::new();

        let resolved = store
            .resolve_handshake(&me(), &bob(), 0, ProtocolKind::Plain)
            .unwrap();
        assert!(resolved.created);
        assert_eq!(store.find_sessions(&bob()).len(), 1);

        let resolved = store
            .resolve_handshake(&me(), &bob(), 2, ProtocolKind::Plain)
            .unwrap();
        assert!(!resolved.created);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_self_talk_creates_two_sessions() {
        let mut store = SessionStore::new();
        store.begin(me(), ProtocolKind::Plain.instantiate()).unwrap();

        assert!(store.resolve_handshake(&me(), &me(), 0, ProtocolKind::Plain).unwrap().created);
        assert!(store.resolve_handshake(&me(), &me(), 1, ProtocolKind::Plain).unwrap().created);
        assert_eq!(store.find_sessions(&me()).len(), 2);
        assert!(!store.is_pending(&me()));

        let times: Vec<u64> = store.find_sessions(&me()).iter().map(|s| s.start_time()).collect();
        assert_ne!(times[0], times[1]);
    }

    #[test]
    fn test_self_talk_parity_selection() {
        let mut store = SessionStore::new();
        store.begin(me(), ProtocolKind::Plain.instantiate()).unwrap();
        store.resolve_handshake(&me(), &me(), 0, ProtocolKind::Plain).unwrap();
        store.resolve_handshake(&me(), &me(), 1, ProtocolKind::Plain).unwrap();

        let times: Vec<u64> = store.find_sessions(&me()).iter().map(|s| s.start_time()).collect();

        let even = store
            .resolve_handshake(&me(), &me(), 2, ProtocolKind::Plain)
            .unwrap()
            .session
            .start_time();
        let odd = store
            .resolve_handshake(&me(), &me(), 3, ProtocolKind::Plain)
            .unwrap()
            .session
            .start_time();

        assert_eq!(even, times[0]);
        assert_eq!(odd, times[1]);
        assert_ne!(even, odd);
    }

    #[test]
    fn test_reply_without_pending_is_rejected() {
        let mut store = SessionStore::new();
        let err = store
            .resolve_handshake(&me(), &bob(), 1, ProtocolKind::Ratchet)
            .err()
            .unwrap();
        assert_eq!(err, SessionError::UnexpectedReply { peer: bob(), round: 1 });
        assert!(store.is_empty());
    }

    #[test]
    fn test_reply_adopts_pending_initiator() {
        let mut store = SessionStore::new();
        let mut initiator = ProtocolKind::Plain.instantiate();
        let hello = initiator.new_session().unwrap();
        store.begin(bob(), initiator).unwrap();

        let mut responder = ProtocolKind::Plain.instantiate();
        let Decrypted::Step(ack) = responder.decrypt(&hello).unwrap() else {
            panic!("expected step");
        };

        let mut resolved = store
            .resolve_handshake(&me(), &bob(), 1, ProtocolKind::Plain)
            .unwrap();
        assert!(resolved.created);
        let out = resolved.session.protocol_mut().decrypt(&ack[0]).unwrap();
        assert_eq!(out, Decrypted::Messages(vec![]));
        assert!(store.find_sessions(&bob())[0].is_active());
    }

    #[test]
    fn test_pending_protocol_mismatch() {
        let mut store = SessionStore::new();
        store.begin(bob(), ProtocolKind::Plain.instantiate()).unwrap();
        let err = store
            .resolve_handshake(&me(), &bob(), 1, ProtocolKind::Ratchet)
            .err()
            .unwrap();
        assert_eq!(
            err,
            SessionError::ProtocolMismatch {
                expected: ProtocolKind::Plain,
                got: ProtocolKind::Ratchet
            }
        );
    }

    #[test]
    fn test_stale_round_rejected() {
        let mut store = SessionStore::new();
        store.resolve_handshake(&me(), &bob(), 0, ProtocolKind::Plain).unwrap();
        store.resolve_handshake(&me(), &bob(), 2, ProtocolKind::Plain).unwrap();

        let err = store
            .resolve_handshake(&me(), &bob(), 2, ProtocolKind::Plain)
            .err()
            .unwrap();
        assert_eq!(
            err,
            SessionError::OutOfOrder {
                peer: bob(),
                round: 2,
                last: 2
            }
        );
    }

    #[test]
    fn test_begin_is_idempotent_guarded() {
        let mut store = SessionStore::new();
        store.begin(bob(), ProtocolKind::Plain.instantiate()).unwrap();
        assert_eq!(
            store.begin(bob(), ProtocolKind::Plain.instantiate()),
            Err(SessionError::HandshakePending(bob()))
        );

        store.resolve_handshake(&me(), &bob(), 1, ProtocolKind::Plain).unwrap();
        assert_eq!(
            store.begin(bob(), ProtocolKind::Plain.instantiate()),
            Err(SessionError::SessionExists(bob()))
        );
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_chat_requires_session() {
        let mut store = SessionStore::new();
        assert_eq!(
            store.resolve_chat(&me(), &bob(), 0).err(),
            Some(SessionError::NoActiveSession(bob()))
        );
        assert_eq!(
            store.outbound_session(&bob()).err(),
            Some(SessionError::NoActiveSession(bob()))
        );
    }

    #[test]
    fn test_self_talk_chat_picks_other_timestamp() {
        let mut store = SessionStore::new();
        store.create_session(me(), ProtocolKind::Plain.instantiate(), 100);
        store.create_session(me(), ProtocolKind::Plain.instantiate(), 200);

        let picked = store.resolve_chat(&me(), &me(), 100).unwrap().start_time();
        assert_eq!(picked, 200);
        let picked = store.resolve_chat(&me(), &me(), 200).unwrap().start_time();
        assert_eq!(picked, 100);
    }

    #[test]
    fn test_self_talk_chat_needs_both_sessions() {
        let mut store = SessionStore::new();
        store.create_session(me(), ProtocolKind::Plain.instantiate(), 100);
        assert!(store.resolve_chat(&me(), &me(), 100).is_err());
    }

    #[test]
    fn test_discard_fresh_responder() {
        let mut store = SessionStore::new();
        let time = store
            .resolve_handshake(&me(), &bob(), 0, ProtocolKind::Plain)
            .unwrap()
            .session
            .start_time();

        assert!(store.discard(&bob(), time));
        assert!(store.is_empty());
        assert!(!store.is_pending(&bob()));
        assert!(!store.discard(&bob(), time));

        // Round 0 is accepted again
        assert!(store.resolve_handshake(&me(), &bob(), 0, ProtocolKind::Plain).unwrap().created);
    }

    #[test]
    fn test_discard_returns_adopted_initiator() {
        let mut store = SessionStore::new();
        let mut initiator = ProtocolKind::Plain.instantiate();
        let hello = initiator.new_session().unwrap();
        store.begin(bob(), initiator).unwrap();

        let time = store
            .resolve_handshake(&me(), &bob(), 1, ProtocolKind::Plain)
            .unwrap()
            .session
            .start_time();
        assert!(!store.is_pending(&bob()));

        assert!(store.discard(&bob(), time));
        assert!(store.is_empty());
        assert!(store.is_pending(&bob()));

        // The parked initiator still accepts the genuine ack
        let mut responder = ProtocolKind::Plain.instantiate();
        let Decrypted::Step(ack) = responder.decrypt(&hello).unwrap() else {
            panic!("expected step");
        };
        let mut resolved = store
            .resolve_handshake(&me(), &bob(), 1, ProtocolKind::Plain)
            .unwrap();
        resolved.session.protocol_mut().decrypt(&ack[0]).unwrap();
        assert!(resolved.session.is_active());
    }

    #[test]
    fn test_colliding_start_times_are_separated() {
        let mut store = SessionStore::new();
        store.create_session(me(), ProtocolKind::Plain.instantiate(), 5);
        let second = store.create_session(me(), ProtocolKind::Plain.instantiate(), 5).start_time();
        assert_eq!(second, 6);
    }
}
