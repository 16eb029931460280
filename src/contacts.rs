//! Friend directory and pending friend requests
//!
//! Contacts are stored as JSON in `~/.peerchat/contacts.json` unless a
//! different path is configured. A contact is keyed by its [`PeerId`];
//! display names are unique and are what the operator types.

use std::collections::HashMap;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::PeerId;

/// Errors that can occur when managing contacts
#[derive(Error, Debug)]
pub enum ContactsError {
    /// No contact with this identity or name
    #[error("Contact not found: {0}")]
    NotFound(String),

    /// Identity or display name already taken
    #[error("Contact already exists: {0}")]
    AlreadyExists(String),

    /// No home directory to put the default file in
    #[error("Config directory not found. Unable to determine home directory.")]
    NoConfigDir,

    /// Reading or writing the contacts file failed
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// The contacts file is not valid JSON
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// A friend: identity, the name shown for them, and where to reach them
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    /// Identity of the friend
    pub peer: PeerId,
    /// Name the operator uses for this friend
    pub display_name: String,
    /// Last known address of the friend's node
    pub addr: SocketAddr,
}

impl Contact {
    /// Create a new contact
    pub fn new(peer: PeerId, display_name: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            peer,
            display_name: display_name.into(),
            addr,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct ContactsFile {
    #[serde(default)]
    contacts: Vec<Contact>,
}

/// The friend directory
#[derive(Debug, Default)]
pub struct ContactBook {
    contacts: Vec<Contact>,
    path: Option<PathBuf>,
    revision: u64,
}

impl ContactBook {
    /// An in-memory directory that is never written to disk
    pub fn new() -> Self {
        Self::default()
    }

    /// Default location of the contacts file
    pub fn default_path() -> Result<PathBuf, ContactsError> {
        dirs::home_dir()
            .map(|home| home.join(".peerchat").join("contacts.json"))
            .ok_or(ContactsError::NoConfigDir)
    }

    /// Load contacts from `path`, starting empty if the file does not exist
    ///
    /// Later changes are written back to the same file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ContactsError> {
        let path = path.as_ref().to_path_buf();
        let file = if path.exists() {
            serde_json::from_str::<ContactsFile>(&fs::read_to_string(&path)?)?
        } else {
            ContactsFile::default()
        };

        Ok(Self {
            contacts: file.contacts,
            path: Some(path),
            revision: 0,
        })
    }

    /// Serialize the current contents for writing to the backing file
    ///
    /// `None` when the book is in-memory only.
    pub fn snapshot(&self) -> Result<Option<ContactsSnapshot>, ContactsError> {
        let Some(path) = &self.path else {
            return Ok(None);
        };
        let file = ContactsFile {
            contacts: self.contacts.clone(),
        };
        Ok(Some(ContactsSnapshot {
            path: path.clone(),
            json: serde_json::to_string_pretty(&file)?,
            revision: self.revision,
        }))
    }

    /// Number of changes made since the book was loaded
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Register a friend
    pub fn add(&mut self, contact: Contact) -> Result<(), ContactsError> {
        if self.is_friend(&contact.peer) {
            return Err(ContactsError::AlreadyExists(contact.peer.to_string()));
        }
        if self.by_name(&contact.display_name).is_some() {
            return Err(ContactsError::AlreadyExists(contact.display_name));
        }
        self.contacts.push(contact);
        self.revision += 1;
        Ok(())
    }

    /// Look up a friend by identity
    pub fn get(&self, peer: &PeerId) -> Option<&Contact> {
        self.contacts.iter().find(|c| &c.peer == peer)
    }

    /// Look up a friend by display name
    pub fn by_name(&self, name: &str) -> Option<&Contact> {
        self.contacts.iter().find(|c| c.display_name == name)
    }

    /// Whether `peer` is a friend
    pub fn is_friend(&self, peer: &PeerId) -> bool {
        self.get(peer).is_some()
    }

    /// All friends, in the order they were added
    pub fn iter(&self) -> impl Iterator<Item = &Contact> {
        self.contacts.iter()
    }

    /// Number of friends
    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    /// Whether there are no friends
    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    /// Record the IP a friend was last seen at. The port is kept
    ///
    /// Returns whether anything changed.
    pub fn update_ip(&mut self, peer: &PeerId, ip: IpAddr) -> Result<bool, ContactsError> {
        let Some(contact) = self.contacts.iter_mut().find(|c| &c.peer == peer) else {
            return Err(ContactsError::NotFound(peer.to_string()));
        };
        if contact.addr.ip() == ip {
            return Ok(false);
        }
        contact.addr.set_ip(ip);
        self.revision += 1;
        Ok(true)
    }
}

/// Serialized contact book, taken under the book's lock and written after
/// it is released
#[derive(Debug)]
pub struct ContactsSnapshot {
    path: PathBuf,
    json: String,
    revision: u64,
}

impl ContactsSnapshot {
    /// Revision of the book this snapshot was taken at
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Write the snapshot to disk, creating parent directories
    pub async fn write(self) -> Result<(), ContactsError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, self.json).await?;
        Ok(())
    }
}

/// A friend request waiting for the operator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FriendRequest {
    /// Who asked
    pub peer: PeerId,
    /// Where the request came from
    pub ip: IpAddr,
}

#[derive(Debug, Clone)]
struct OutgoingRequest {
    display_name: String,
    addr: SocketAddr,
}

/// Friend requests in both directions
///
/// Incoming requests queue until accepted or rejected; outgoing requests
/// are matched against the reciprocal reply by source IP.
#[derive(Debug, Default)]
pub struct FriendRequests {
    incoming: Vec<FriendRequest>,
    outgoing: HashMap<IpAddr, OutgoingRequest>,
}

impl FriendRequests {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an incoming request. Returns false if `peer` already asked
    pub fn push_incoming(&mut self, request: FriendRequest) -> bool {
        if self.incoming.iter().any(|r| r.peer == request.peer) {
            return false;
        }
        self.incoming.push(request);
        true
    }

    /// Remove and return the incoming request from `peer`
    pub fn take_incoming(&mut self, peer: &PeerId) -> Option<FriendRequest> {
        let idx = self.incoming.iter().position(|r| &r.peer == peer)?;
        Some(self.incoming.remove(idx))
    }

    /// Incoming requests, oldest first
    pub fn incoming(&self) -> &[FriendRequest] {
        &self.incoming
    }

    /// Remember that we asked the node at `addr` for friendship
    pub fn record_outgoing(&mut self, addr: SocketAddr, display_name: impl Into<String>) {
        self.outgoing.insert(
            addr.ip(),
            OutgoingRequest {
                display_name: display_name.into(),
                addr,
            },
        );
    }

    /// Match a reply from `ip` to a request we sent, consuming it
    ///
    /// Yields the display name we chose and the address we dialed.
    pub fn take_outgoing(&mut self, ip: IpAddr) -> Option<(String, SocketAddr)> {
        self.outgoing
            .remove(&ip)
            .map(|req| (req.display_name, req.addr))
    }
}
