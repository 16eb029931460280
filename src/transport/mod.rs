//! Transport layer
//!
//! Nodes talk in short-lived connections: the sender dials, writes one
//! encoded message, and closes its write half. The receiver reads to EOF.
//! Encryption is handled by the session layer; the transport only moves
//! bytes.
//!
//! - [`TcpTransport`]: real TCP connections
//! - [`memory::MemoryTransport`]: captures outbound bytes in a channel,
//!   for testing

use std::net::SocketAddr;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection failed
    #[error("Connection to {addr} failed: {reason}")]
    ConnectionFailed {
        /// Address that was dialed
        addr: SocketAddr,
        /// Underlying error
        reason: String,
    },

    /// Could not listen on the configured address
    #[error("Failed to bind {addr}: {reason}")]
    Bind {
        /// Address that was requested
        addr: SocketAddr,
        /// Underlying error
        reason: String,
    },

    /// Send failed
    #[error("Failed to send: {0}")]
    SendFailed(String),

    /// Receive failed
    #[error("Failed to receive: {0}")]
    ReceiveFailed(String),

    /// The peer sent more than the configured limit
    #[error("Message too large: more than {limit} bytes")]
    TooLarge {
        /// Configured limit in bytes
        limit: usize,
    },

    /// Nothing arrived before the peer closed
    #[error("Connection closed without a message")]
    Empty,
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Outbound delivery of encoded messages
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one encoded message to the node listening at `to`
    async fn send(&self, to: SocketAddr, data: &[u8]) -> TransportResult<()>;
}

/// Read a whole message from a connection, up to `limit` bytes.
pub async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut R,
    limit: usize,
) -> TransportResult<Vec<u8>> {
    let mut data = Vec::new();
    reader
        .take(limit as u64 + 1)
        .read_to_end(&mut data)
        .await
        .map_err(|e| TransportError::ReceiveFailed(e.to_string()))?;

    if data.len() > limit {
        return Err(TransportError::TooLarge { limit });
    }
    if data.is_empty() {
        return Err(TransportError::Empty);
    }
    Ok(data)
}

/// One TCP connection per message
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpTransport;

impl TcpTransport {
    /// Create a TCP transport
    pub fn new() -> Self {
        TcpTransport
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, to: SocketAddr, data: &[u8]) -> TransportResult<()> {
        let mut stream = TcpStream::connect(to)
            .await
            .map_err(|e| TransportError::ConnectionFailed {
                addr: to,
                reason: e.to_string(),
            })?;

        stream
            .write_all(data)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        stream
            .shutdown()
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}

/// In-memory transport for testing
///
/// Every send lands in a channel instead of the network.
pub mod memory {
    use super::*;
    use tokio::sync::mpsc;

    /// A message captured by [`MemoryTransport`]
    pub type Sent = (SocketAddr, Vec<u8>);

    /// Transport that records instead of dialing
    #[derive(Clone)]
    pub struct MemoryTransport {
        tx: mpsc::UnboundedSender<Sent>,
    }

    impl MemoryTransport {
        /// Create a transport and the receiver that observes its sends
        pub fn new() -> (Self, mpsc::UnboundedReceiver<Sent>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (MemoryTransport { tx }, rx)
        }
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn send(&self, to: SocketAddr, data: &[u8]) -> TransportResult<()> {
            self.tx
                .send((to, data.to_vec()))
                .map_err(|_| TransportError::SendFailed("Channel closed".to_string()))
        }
    }
}
