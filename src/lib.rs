//! # Peerchat
//!
//! Peer-to-peer encrypted chat between nodes that both listen and dial.
//!
//! ## Features
//!
//! - **One message per connection** over plain TCP
//! - **Lazy sessions**: created when a handshake round arrives, never by chat
//! - **Self-talk**: a user can open a session with themselves; two sessions
//!   then share one endpoint and traffic is routed by round parity and
//!   session creation time
//! - **Pluggable protocols** behind the [`protocol::Protocol`] trait
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use peerchat::{ContactBook, NodeConfig, ProtocolKind, Server, TcpTransport};
//!
//! # async fn run() -> peerchat::NodeResult<()> {
//! let config = NodeConfig::new("alice", "aa:bb:cc:dd:ee:ff");
//! let (server, mut events) = Server::new(config, ContactBook::new(), Arc::new(TcpTransport::new()));
//! server.start().await?;
//!
//! // Talk to ourselves
//! server.start_session("alice", ProtocolKind::Ratchet).await?;
//! while let Some(event) = events.recv().await {
//!     println!("{}", event);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                   SERVER                    │
//! │   accept loop | dispatch | outbound ops     │
//! └─────────────────────┬───────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────┐
//! │               SESSION STORE                 │
//! │   resolve-or-create | parity | timestamps   │
//! └─────────────────────┬───────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────┐
//! │                 PROTOCOLS                   │
//! │  Ratchet (X25519 + ChaCha20-Poly1305) | Plain
//! └─────────────────────┬───────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────┐
//! │                TRANSPORT                    │
//! │        TCP | in-memory (for tests)          │
//! └─────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod contacts;
pub mod crypto;
pub mod error;
pub mod message;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;

// Re-export main types at crate root
pub use config::NodeConfig;
pub use contacts::{Contact, ContactBook, FriendRequest};
pub use error::{NodeError, NodeResult};
pub use message::{Message, PeerId};
pub use protocol::ProtocolKind;
pub use server::{NodeEvent, Server};
pub use transport::TcpTransport;
