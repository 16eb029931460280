//! The chat node
//!
//! A [`Server`] owns the session store, the friend directory and a
//! listening socket. Every inbound connection carries exactly one
//! [`Message`] and is handled on its own task; outbound operations dial a
//! fresh connection per message.
//!
//! All session lookups, creations and protocol advances happen under one
//! lock, so concurrent connections never race on session state. The lock is
//! released before any network I/O.

mod handler;

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, OnceLock};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::NodeConfig;
use crate::contacts::{Contact, ContactBook, ContactsSnapshot, FriendRequest, FriendRequests};
use crate::error::{NodeError, NodeResult};
use crate::message::{Message, PeerId};
use crate::protocol::ProtocolKind;
use crate::session::{SessionError, SessionStore};
use crate::transport::{read_message, Transport, TransportError};

/// Something the operator should see
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// A chat line was decrypted
    Chat {
        /// Sender identity
        from: PeerId,
        /// Sender display name
        display_name: String,
        /// Decrypted text
        text: String,
    },
    /// A handshake completed on our side
    SessionEstablished {
        /// Remote identity
        peer: PeerId,
        /// Remote display name
        display_name: String,
    },
    /// A stranger asked to be friends
    FriendRequest {
        /// Who asked
        peer: PeerId,
        /// Where they asked from
        ip: IpAddr,
    },
    /// A friendship was registered
    FriendAdded {
        /// New friend
        peer: PeerId,
        /// Name it was registered under
        display_name: String,
    },
}

impl fmt::Display for NodeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeEvent::Chat {
                display_name, text, ..
            } => write!(f, "{}: {}", display_name, text),
            NodeEvent::SessionEstablished { display_name, .. } => {
                write!(f, "* session with {} established", display_name)
            }
            NodeEvent::FriendRequest { peer, ip } => {
                write!(f, "* friend request from {} ({})", peer, ip)
            }
            NodeEvent::FriendAdded { display_name, peer } => {
                write!(f, "* {} ({}) is now a friend", display_name, peer)
            }
        }
    }
}

struct Shared {
    config: NodeConfig,
    local: PeerId,
    bound: OnceLock<SocketAddr>,
    sessions: Mutex<SessionStore>,
    contacts: Mutex<ContactBook>,
    saved_revision: Mutex<u64>,
    requests: Mutex<FriendRequests>,
    transport: Arc<dyn Transport>,
    events: mpsc::UnboundedSender<NodeEvent>,
}

/// A running chat node. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Shared>,
}

impl Server {
    /// Create a node for the user described by `config`.
    ///
    /// Returns the node and the stream of events it will publish.
    pub fn new(
        config: NodeConfig,
        contacts: ContactBook,
        transport: Arc<dyn Transport>,
    ) -> (Self, mpsc::UnboundedReceiver<NodeEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let local = config.identity();

        let server = Server {
            inner: Arc::new(Shared {
                config,
                local,
                bound: OnceLock::new(),
                sessions: Mutex::new(SessionStore::new()),
                saved_revision: Mutex::new(contacts.revision()),
                contacts: Mutex::new(contacts),
                requests: Mutex::new(FriendRequests::new()),
                transport,
                events,
            }),
        };
        (server, rx)
    }

    /// Identity of the local user
    pub fn local_identity(&self) -> &PeerId {
        &self.inner.local
    }

    /// Address this node can be reached at
    pub fn local_addr(&self) -> SocketAddr {
        let addr = self
            .inner
            .bound
            .get()
            .copied()
            .unwrap_or(self.inner.config.listen);

        match addr.ip() {
            IpAddr::V4(ip) if ip.is_unspecified() => {
                SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
            }
            IpAddr::V6(ip) if ip.is_unspecified() => {
                SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
            }
            _ => addr,
        }
    }

    /// Bind the configured address and run the accept loop in the background
    pub async fn start(&self) -> NodeResult<JoinHandle<()>> {
        info!("Launching node for {}", self.inner.local);
        let listen = self.inner.config.listen;
        let listener = TcpListener::bind(listen)
            .await
            .map_err(|e| TransportError::Bind {
                addr: listen,
                reason: e.to_string(),
            })?;

        let bound = listener.local_addr().map_err(|e| TransportError::Bind {
            addr: listen,
            reason: e.to_string(),
        })?;
        let _ = self.inner.bound.set(bound);
        info!("Listening on {}", bound);

        Ok(tokio::spawn(self.clone().serve(listener)))
    }

    /// Accept connections forever, one task per connection.
    ///
    /// Accept failures are transient and only skip to the next connection.
    pub async fn serve(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let server = self.clone();
                    tokio::spawn(async move { server.handle_connection(stream, addr).await });
                }
                Err(e) => debug!("accept failed: {}", e),
            }
        }
    }

    /// Read one message from `stream`, handle it, and drop the connection.
    async fn handle_connection(&self, mut stream: TcpStream, addr: SocketAddr) {
        let data = match read_message(&mut stream, self.inner.config.max_message_size).await {
            Ok(data) => data,
            Err(e) => {
                warn!("Dropping connection from {}: {}", addr, e);
                return;
            }
        };
        drop(stream);

        if let Err(e) = self.handle_incoming(addr.ip(), &data).await {
            if e.is_protocol_violation() {
                error!("Protocol violation from {}: {}", addr, e);
            } else {
                warn!("Rejected message from {}: {}", addr, e);
            }
        }
    }

    /// Begin a handshake with the friend called `name`.
    ///
    /// Returns `false` without touching the network when a session or a
    /// handshake with that friend already exists.
    pub async fn start_session(&self, name: &str, kind: ProtocolKind) -> NodeResult<bool> {
        let contact = self.lookup(name).await?;

        let mut protocol = kind.instantiate();
        let first = protocol.new_session()?;

        match self
            .inner
            .sessions
            .lock()
            .await
            .begin(contact.peer.clone(), protocol)
        {
            Ok(()) => {}
            Err(SessionError::SessionExists(_)) | Err(SessionError::HandshakePending(_)) => {
                info!("Session with {} already exists, not starting another", name);
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        }

        let msg = Message::handshake(
            &self.inner.local,
            &contact.peer.username,
            0,
            kind,
            None,
            first,
        );
        if let Err(e) = self.deliver(contact.addr, &msg).await {
            self.inner.sessions.lock().await.abandon(&contact.peer);
            return Err(e);
        }

        info!("Started {} handshake with {}", kind, name);
        Ok(true)
    }

    /// Encrypt `text` for the friend called `name` and send it.
    pub async fn send_chat(&self, name: &str, text: &[u8]) -> NodeResult<()> {
        let contact = self.lookup(name).await?;

        let (chunks, session_time) = {
            let mut store = self.inner.sessions.lock().await;
            let session = store
                .outbound_session(&contact.peer)
                .map_err(|_| NodeError::NoActiveSession(name.to_string()))?;
            if !session.is_active() {
                return Err(NodeError::HandshakeIncomplete(name.to_string()));
            }
            (session.protocol_mut().encrypt(text)?, session.start_time())
        };

        for chunk in chunks {
            let msg = Message::chat(&self.inner.local, &contact.peer.username, session_time, chunk);
            self.deliver(contact.addr, &msg).await?;
        }
        Ok(())
    }

    /// Ask the node at `addr`, run by `username`, for friendship.
    ///
    /// The friend is registered as `display_name` once they accept.
    pub async fn send_friend_request(
        &self,
        addr: SocketAddr,
        username: &str,
        display_name: &str,
    ) -> NodeResult<()> {
        self.inner
            .requests
            .lock()
            .await
            .record_outgoing(addr, display_name);

        let msg = Message::friend(&self.inner.local, username);
        if let Err(e) = self.deliver(addr, &msg).await {
            self.inner.requests.lock().await.take_outgoing(addr.ip());
            return Err(e);
        }
        Ok(())
    }

    /// Friend requests waiting for a decision
    pub async fn pending_friend_requests(&self) -> Vec<FriendRequest> {
        self.inner.requests.lock().await.incoming().to_vec()
    }

    /// Accept the queued request from `peer`, register them as
    /// `display_name`, and send the reciprocal friend message.
    pub async fn accept_friend_request(&self, peer: &PeerId, display_name: &str) -> NodeResult<()> {
        let request = self
            .inner
            .requests
            .lock()
            .await
            .take_incoming(peer)
            .ok_or_else(|| NodeError::NoFriendRequest(peer.clone()))?;

        let addr = SocketAddr::new(request.ip, self.inner.config.peer_port);
        let added = {
            let mut contacts = self.inner.contacts.lock().await;
            contacts
                .add(Contact::new(peer.clone(), display_name, addr))
                .and_then(|()| contacts.snapshot())
        };
        let snapshot = match added {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.inner.requests.lock().await.push_incoming(request);
                return Err(e.into());
            }
        };
        self.persist_contacts(snapshot).await?;

        self.emit(NodeEvent::FriendAdded {
            peer: peer.clone(),
            display_name: display_name.to_string(),
        });

        let msg = Message::friend(&self.inner.local, &peer.username);
        self.deliver(addr, &msg).await
    }

    /// Drop the queued request from `peer`. Returns whether one existed.
    pub async fn reject_friend_request(&self, peer: &PeerId) -> bool {
        self.inner.requests.lock().await.take_incoming(peer).is_some()
    }

    /// All registered friends
    pub async fn friends(&self) -> Vec<Contact> {
        self.inner.contacts.lock().await.iter().cloned().collect()
    }

    /// Number of sessions held with `peer`
    pub async fn session_count(&self, peer: &PeerId) -> usize {
        self.inner.sessions.lock().await.find_sessions(peer).len()
    }

    /// Whether every session with `peer` has finished its handshake
    pub async fn is_established(&self, peer: &PeerId) -> bool {
        let store = self.inner.sessions.lock().await;
        let sessions = store.find_sessions(peer);
        !sessions.is_empty() && sessions.iter().all(|s| s.is_active())
    }

    /// Resolve a display name to a contact. The local username always
    /// resolves to this node itself.
    async fn lookup(&self, name: &str) -> NodeResult<Contact> {
        if let Some(contact) = self.inner.contacts.lock().await.by_name(name) {
            return Ok(contact.clone());
        }
        if name == self.inner.local.username {
            return Ok(self.self_contact());
        }
        Err(NodeError::UnknownFriend(name.to_string()))
    }

    fn self_contact(&self) -> Contact {
        Contact::new(
            self.inner.local.clone(),
            self.inner.local.username.clone(),
            self.local_addr(),
        )
    }

    /// Encode and send one message on a fresh connection
    async fn deliver(&self, addr: SocketAddr, msg: &Message) -> NodeResult<()> {
        let bytes = msg.to_bytes()?;
        self.inner.transport.send(addr, &bytes).await?;
        debug!("Sent {} message to {} at {}", msg.kind(), msg.dest_username, addr);
        Ok(())
    }

    /// Write the contact book out after a change, outside the contacts lock.
    /// Snapshots older than the last one written are skipped.
    async fn persist_contacts(&self, snapshot: Option<ContactsSnapshot>) -> NodeResult<()> {
        let Some(snapshot) = snapshot else {
            return Ok(());
        };
        let mut saved = self.inner.saved_revision.lock().await;
        if snapshot.revision() <= *saved {
            return Ok(());
        }
        let revision = snapshot.revision();
        snapshot.write().await?;
        *saved = revision;
        Ok(())
    }

    fn emit(&self, event: NodeEvent) {
        if self.inner.events.send(event).is_err() {
            debug!("Event receiver dropped");
        }
    }
}
