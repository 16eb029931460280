//! Inbound message dispatch

use std::net::IpAddr;

use tracing::{debug, info, warn};

use super::{NodeEvent, Server};
use crate::contacts::{Contact, FriendRequest};
use crate::error::{NodeError, NodeResult};
use crate::message::{Body, Message, PeerId};
use crate::protocol::{Decrypted, ProtocolError, ProtocolKind};

impl Server {
    /// Handle one message received from `from`.
    ///
    /// Messages addressed to another user are logged and dropped.
    pub async fn handle_incoming(&self, from: IpAddr, bytes: &[u8]) -> NodeResult<()> {
        let msg = Message::from_bytes(bytes)?;

        if msg.dest_username != self.inner.local.username {
            warn!(
                "Discarding {} message for {} (we are {})",
                msg.kind(),
                msg.dest_username,
                self.inner.local.username
            );
            return Ok(());
        }

        let source = msg.source();
        debug!("Received {} message from {} at {}", msg.kind(), source, from);

        match msg.body {
            Body::Friend => self.on_friend(source, from).await,
            Body::Handshake {
                round,
                protocol,
                secret,
                ..
            } => {
                let name = self.require_friend(&source, from).await?;
                self.on_handshake(source, name, round, protocol, &secret).await
            }
            Body::Chat { session_time, text } => {
                let name = self.require_friend(&source, from).await?;
                self.on_chat(source, name, session_time, &text).await
            }
        }
    }

    /// Check that `source` may hold sessions with us, returning the name
    /// to show for them. Refreshes the friend's last known IP.
    async fn require_friend(&self, source: &PeerId, from: IpAddr) -> NodeResult<String> {
        if source == &self.inner.local {
            return Ok(self.inner.local.username.clone());
        }

        let (name, snapshot) = {
            let mut contacts = self.inner.contacts.lock().await;
            let name = contacts
                .get(source)
                .map(|c| c.display_name.clone())
                .ok_or_else(|| NodeError::NotAFriend(source.clone()))?;

            if !contacts.update_ip(source, from)? {
                return Ok(name);
            }
            (name, contacts.snapshot()?)
        };

        info!("{} moved to {}", name, from);
        self.persist_contacts(snapshot).await?;
        Ok(name)
    }

    async fn on_handshake(
        &self,
        source: PeerId,
        name: String,
        round: u32,
        kind: ProtocolKind,
        secret: &[u8],
    ) -> NodeResult<()> {
        let next = round
            .checked_add(1)
            .ok_or(ProtocolError::UnexpectedHandshake("round counter exhausted"))?;

        let (outcome, stamp, became_active) = {
            let mut store = self.inner.sessions.lock().await;
            let mut resolved = store.resolve_handshake(&self.inner.local, &source, round, kind)?;
            let was_active = resolved.session.is_active();
            let created = resolved.created;
            let start_time = resolved.session.start_time();

            match resolved.session.protocol_mut().decrypt(secret) {
                Ok(outcome) => {
                    let became_active = !was_active && resolved.session.is_active();
                    (outcome, created.then_some(start_time), became_active)
                }
                Err(e) => {
                    // A failed first round must not leave a half-built session behind
                    if created {
                        store.discard(&source, start_time);
                        debug!("Discarded session with {} after failed round {}", source, round);
                    }
                    return Err(e.into());
                }
            }
        };

        if became_active {
            info!("Session with {} established", source);
            self.emit(NodeEvent::SessionEstablished {
                peer: source.clone(),
                display_name: name.clone(),
            });
        }

        match outcome {
            Decrypted::Step(replies) => {
                let addr = self.reply_addr(&source).await?;
                for payload in replies {
                    let msg = Message::handshake(
                        &self.inner.local,
                        &source.username,
                        next,
                        kind,
                        stamp,
                        payload,
                    );
                    self.deliver(addr, &msg).await?;
                }
                Ok(())
            }
            Decrypted::Messages(payloads) => {
                self.deliver_payloads(&source, &name, payloads);
                Ok(())
            }
        }
    }

    async fn on_chat(
        &self,
        source: PeerId,
        name: String,
        session_time: u64,
        text: &[u8],
    ) -> NodeResult<()> {
        let outcome = {
            let mut store = self.inner.sessions.lock().await;
            let session = store.resolve_chat(&self.inner.local, &source, session_time)?;
            if !session.is_active() {
                return Err(ProtocolError::NotActive.into());
            }
            session.protocol_mut().decrypt(text)?
        };

        match outcome {
            Decrypted::Messages(payloads) => {
                self.deliver_payloads(&source, &name, payloads);
                Ok(())
            }
            Decrypted::Step(_) => {
                Err(ProtocolError::UnexpectedHandshake("handshake step in chat message").into())
            }
        }
    }

    async fn on_friend(&self, source: PeerId, from: IpAddr) -> NodeResult<()> {
        let known = {
            let mut contacts = self.inner.contacts.lock().await;
            if !contacts.is_friend(&source) {
                None
            } else if contacts.update_ip(&source, from)? {
                Some(contacts.snapshot()?)
            } else {
                Some(None)
            }
        };
        if let Some(snapshot) = known {
            debug!("{} is already a friend", source);
            return self.persist_contacts(snapshot).await;
        }

        let outgoing = self.inner.requests.lock().await.take_outgoing(from);
        if let Some((display_name, addr)) = outgoing {
            let contact = Contact::new(source.clone(), display_name.clone(), addr);
            let snapshot = {
                let mut contacts = self.inner.contacts.lock().await;
                contacts.add(contact)?;
                contacts.snapshot()?
            };
            self.persist_contacts(snapshot).await?;
            info!("{} accepted our friend request", source);
            self.emit(NodeEvent::FriendAdded {
                peer: source,
                display_name,
            });
            return Ok(());
        }

        let request = FriendRequest {
            peer: source.clone(),
            ip: from,
        };
        if self.inner.requests.lock().await.push_incoming(request) {
            info!("Friend request from {} at {}", source, from);
            self.emit(NodeEvent::FriendRequest { peer: source, ip: from });
        }
        Ok(())
    }

    /// Where replies to `peer` go: the friend's address, or ourselves.
    async fn reply_addr(&self, peer: &PeerId) -> NodeResult<std::net::SocketAddr> {
        if peer == &self.inner.local {
            return Ok(self.local_addr());
        }
        self.inner
            .contacts
            .lock()
            .await
            .get(peer)
            .map(|c| c.addr)
            .ok_or_else(|| NodeError::NotAFriend(peer.clone()))
    }

    fn deliver_payloads(&self, source: &PeerId, name: &str, payloads: Vec<Vec<u8>>) {
        for payload in payloads.into_iter().filter(|p| !p.is_empty()) {
            self.emit(NodeEvent::Chat {
                from: source.clone(),
                display_name: name.to_string(),
                text: String::from_utf8_lossy(&payload).into_owned(),
            });
        }
    }
}
