//! Node-level errors
//!
//! Outbound operations return these to the caller. Inbound connection
//! handlers return them too, but only so the connection task can log them.

use thiserror::Error;

use crate::contacts::ContactsError;
use crate::message::{MessageError, PeerId};
use crate::protocol::ProtocolError;
use crate::session::SessionError;
use crate::transport::TransportError;

/// Errors surfaced by a running node
#[derive(Error, Debug)]
pub enum NodeError {
    /// No friend is registered under this display name
    #[error("No friend named {0}")]
    UnknownFriend(String),

    /// Chat attempted before a session exists
    #[error("Cannot communicate with {0} without an active session")]
    NoActiveSession(String),

    /// The session exists but its handshake has not finished
    #[error("Session with {0} is still handshaking")]
    HandshakeIncomplete(String),

    /// There is no queued friend request from this peer
    #[error("No pending friend request from {0}")]
    NoFriendRequest(PeerId),

    /// Handshake or chat from someone who is not a friend
    #[error("{0} is not a friend")]
    NotAFriend(PeerId),

    /// Invalid wire message
    #[error(transparent)]
    Malformed(#[from] MessageError),

    /// Session resolution failed
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The protocol rejected a payload
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Dialing or writing failed
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Contact directory failure
    #[error("Contacts error: {0}")]
    Contacts(#[from] ContactsError),
}

impl NodeError {
    /// Whether the error means the peer misbehaved (as opposed to bad
    /// input or a missing piece of local state)
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            NodeError::NotAFriend(_) | NodeError::Protocol(_) | NodeError::Session(_)
        )
    }
}

/// Result type for node operations
pub type NodeResult<T> = Result<T, NodeError>;
