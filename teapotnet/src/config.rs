//! Node configuration
//!
//! A JSON document; every field has a default so an empty file is a
//! valid configuration. The contacts list follows the persistent-state
//! schema: per-contact user name, display name, identifier and shared
//! secret.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Default overlay port
pub const DEFAULT_PORT: u16 = 8480;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContactEntry {
    /// Unique user name of the contact
    pub uname: String,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Hex contact identifier (digest of the contact's public key)
    pub identifier: String,
    /// Shared secret established out of band, hex
    #[serde(default)]
    pub remote_secret: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Overlay listen port (stream and datagram)
    pub port: u16,
    /// Data directory; blocks, index and identity live here
    pub data_dir: PathBuf,
    /// Nodes to connect to at startup, host:port
    pub bootstrap: Vec<SocketAddr>,
    /// Block store quota in bytes
    pub store_quota: u64,
    /// Known contacts
    pub contacts: Vec<ContactEntry>,
    /// Accept links from contacts not in the list
    pub accept_unknown_contacts: bool,
    /// Display name for the local user
    pub user_name: String,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("teapotnet");
        Self {
            port: DEFAULT_PORT,
            data_dir,
            bootstrap: Vec::new(),
            store_quota: 8 << 30,
            contacts: Vec::new(),
            accept_unknown_contacts: false,
            user_name: "anonymous".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("cannot read config {}", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("cannot parse config {}", path.display()))
    }

    /// Load when the file exists, defaults otherwise
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_is_valid() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert!(config.contacts.is_empty());
    }

    #[test]
    fn test_round_trip() {
        let mut config = Config::default();
        config.port = 9000;
        config.contacts.push(ContactEntry {
            uname: "bob".into(),
            name: "Bob".into(),
            identifier: "ab".repeat(32),
            remote_secret: String::new(),
        });
        let json = serde_json::to_string_pretty(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.port, 9000);
        assert_eq!(back.contacts.len(), 1);
        assert_eq!(back.contacts[0].uname, "bob");
    }

    #[test]
    fn test_missing_file_errors() {
        assert!(Config::load(Path::new("/nonexistent/config.json")).is_err());
    }
}
