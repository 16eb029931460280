//! Wire messages
//!
//! Exactly one [`Message`] travels per TCP connection, encoded as a JSON
//! object whose `type` field selects the variant:
//!
//! ```json
//! {"sourceMAC":"aa:bb:cc:dd:ee:ff","sourceUsername":"alice","destUsername":"bob",
//!  "type":"handshake","round":0,"protocolKind":"ratchet","sessionTime":1700000000000000000,
//!  "secret":"3q2+7w=="}
//! ```
//!
//! Byte payloads are carried as base64 strings.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::ProtocolKind;

/// Errors produced while encoding, decoding or validating a message
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    /// The bytes were not a valid message
    #[error("Failed to decode message: {0}")]
    Decode(String),

    /// The message could not be serialized
    #[error("Failed to encode message: {0}")]
    Encode(String),

    /// A required identity field was empty
    #[error("Message has an empty {0}")]
    MissingIdentity(&'static str),
}

/// Identity of a chat participant: hardware address plus username.
///
/// The IP address a peer connects from is routing information only.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId {
    /// Hardware (MAC) address
    pub mac: String,
    /// Login name
    pub username: String,
}

impl PeerId {
    /// Create a peer identity
    pub fn new(mac: impl Into<String>, username: impl Into<String>) -> Self {
        PeerId {
            mac: mac.into(),
            username: username.into(),
        }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.username, self.mac)
    }
}

/// A single message between two nodes
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Sender hardware address
    #[serde(rename = "sourceMAC")]
    pub source_mac: String,
    /// Sender username
    #[serde(rename = "sourceUsername")]
    pub source_username: String,
    /// Recipient username
    #[serde(rename = "destUsername")]
    pub dest_username: String,
    /// Variant-specific content
    #[serde(flatten)]
    pub body: Body,
}

/// The closed set of message variants
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Body {
    /// Request (or reciprocal acceptance) of a friendship
    Friend,

    /// One round of a session handshake
    Handshake {
        /// Step counter, incremented by one per hop
        round: u32,
        /// Algorithm the session runs
        #[serde(rename = "protocolKind")]
        protocol: ProtocolKind,
        /// Creation instant of the replying side's session (Unix nanos),
        /// present only on the reply that created it
        #[serde(rename = "sessionTime", default, skip_serializing_if = "Option::is_none")]
        session_time: Option<u64>,
        /// Opaque handshake bytes for this round
        #[serde(with = "base64_bytes")]
        secret: Vec<u8>,
    },

    /// Chat payload, ciphertext on the wire
    Chat {
        /// Creation instant of the sender's session (Unix nanos)
        #[serde(rename = "sessionTime")]
        session_time: u64,
        /// Opaque payload
        #[serde(with = "base64_bytes")]
        text: Vec<u8>,
    },
}

impl Message {
    fn envelope(from: &PeerId, to_username: &str, body: Body) -> Self {
        Message {
            source_mac: from.mac.clone(),
            source_username: from.username.clone(),
            dest_username: to_username.to_string(),
            body,
        }
    }

    /// Build a friend request
    pub fn friend(from: &PeerId, to_username: &str) -> Self {
        Self::envelope(from, to_username, Body::Friend)
    }

    /// Build a handshake round
    pub fn handshake(
        from: &PeerId,
        to_username: &str,
        round: u32,
        protocol: ProtocolKind,
        session_time: Option<u64>,
        secret: Vec<u8>,
    ) -> Self {
        Self::envelope(
            from,
            to_username,
            Body::Handshake {
                round,
                protocol,
                session_time,
                secret,
            },
        )
    }

    /// Build a chat message
    pub fn chat(from: &PeerId, to_username: &str, session_time: u64, text: Vec<u8>) -> Self {
        Self::envelope(from, to_username, Body::Chat { session_time, text })
    }

    /// Identity of the sender
    pub fn source(&self) -> PeerId {
        PeerId::new(self.source_mac.clone(), self.source_username.clone())
    }

    /// Short variant name for logs
    pub fn kind(&self) -> &'static str {
        match self.body {
            Body::Friend => "friend",
            Body::Handshake { .. } => "handshake",
            Body::Chat { .. } => "chat",
        }
    }

    /// Reject messages that lack a source or destination identity
    pub fn validate(&self) -> Result<(), MessageError> {
        if self.source_mac.trim().is_empty() {
            return Err(MessageError::MissingIdentity("sourceMAC"));
        }
        if self.source_username.trim().is_empty() {
            return Err(MessageError::MissingIdentity("sourceUsername"));
        }
        if self.dest_username.trim().is_empty() {
            return Err(MessageError::MissingIdentity("destUsername"));
        }
        Ok(())
    }

    /// Serialize to bytes for transport
    pub fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        serde_json::to_vec(self).map_err(|e| MessageError::Encode(e.to_string()))
    }

    /// Deserialize and validate bytes read from a connection
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MessageError> {
        let message: Message =
            serde_json::from_slice(bytes).map_err(|e| MessageError::Decode(e.to_string()))?;
        message.validate()?;
        Ok(message)
    }
}

/// Base64 (de)serialization for byte payloads
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
