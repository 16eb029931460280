//! Node configuration
//!
//! A node is configured from an optional JSON file; the binary then applies
//! command-line overrides on top. Missing fields take their defaults.
//!
//! ```json
//! { "username": "alice", "mac": "aa:bb:cc:dd:ee:ff", "listen": "0.0.0.0:4242" }
//! ```

use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::PeerId;

/// Port every node listens on unless configured otherwise
pub const DEFAULT_PORT: u16 = 4242;

/// Upper bound on one inbound message
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Reading the config file failed
    #[error("Failed to read config {path}: {source}")]
    Read {
        /// File that was read
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// The config file is not valid JSON for [`NodeConfig`]
    #[error("Invalid config {path}: {source}")]
    Parse {
        /// File that was parsed
        path: PathBuf,
        /// Underlying error
        source: serde_json::Error,
    },

    /// A required field is empty
    #[error("Missing required setting: {0}")]
    Missing(&'static str),
}

/// Settings of one node
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Login name of the local user
    pub username: String,
    /// Hardware address of the local machine
    pub mac: String,
    /// Address the node accepts connections on
    pub listen: SocketAddr,
    /// Port assumed for peers first seen through an inbound connection
    pub peer_port: u16,
    /// Largest inbound message accepted, in bytes
    pub max_message_size: usize,
    /// Contacts file; `None` keeps contacts in memory only
    pub contacts_path: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            username: String::new(),
            mac: String::new(),
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            peer_port: DEFAULT_PORT,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            contacts_path: None,
        }
    }
}

impl NodeConfig {
    /// Configuration for `username` on machine `mac` with default settings
    pub fn new(username: impl Into<String>, mac: impl Into<String>) -> Self {
        NodeConfig {
            username: username.into(),
            mac: mac.into(),
            ..Default::default()
        }
    }

    /// Load a configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&json).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check that the settings describe a usable node
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.username.trim().is_empty() {
            return Err(ConfigError::Missing("username"));
        }
        if self.mac.trim().is_empty() {
            return Err(ConfigError::Missing("mac"));
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::Missing("max_message_size"));
        }
        Ok(())
    }

    /// Identity of the local user
    pub fn identity(&self) -> PeerId {
        PeerId::new(self.mac.clone(), self.username.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.listen.port(), DEFAULT_PORT);
        assert_eq!(config.peer_port, 4242);
        assert_eq!(config.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
        assert!(config.contacts_path.is_none());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        fs::write(&path, r#"{"username":"alice","mac":"aa:bb","peer_port":5000}"#).unwrap();

        let config = NodeConfig::from_file(&path).unwrap();
        assert_eq!(config.identity(), PeerId::new("aa:bb", "alice"));
        assert_eq!(config.peer_port, 5000);
        assert_eq!(config.listen.port(), DEFAULT_PORT);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_file_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        fs::write(&path, "not json").unwrap();
        assert!(matches!(NodeConfig::from_file(&path), Err(ConfigError::Parse { .. })));

        let missing = dir.path().join("absent.json");
        assert!(matches!(NodeConfig::from_file(&missing), Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_validate_requires_identity() {
        assert!(matches!(
            NodeConfig::new("", "aa").validate(),
            Err(ConfigError::Missing("username"))
        ));
        assert!(matches!(
            NodeConfig::new("alice", " ").validate(),
            Err(ConfigError::Missing("mac"))
        ));
    }
}
