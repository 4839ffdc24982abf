//! Identity file
//!
//! Produced at first run: the node and user RSA keypairs with private
//! halves encrypted under a key derived from the stored secret. Losing
//! this file means a new identity; it is never transmitted.

use anyhow::{Context, Result};
use lib_crypto::identity::EncryptedKey;
use lib_crypto::Identity;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

#[derive(Serialize, Deserialize)]
struct StoredKey {
    public_key: String,
    private_key_nonce: String,
    private_key: String,
}

#[derive(Serialize, Deserialize)]
struct IdentityFile {
    name: String,
    secret: String,
    node: StoredKey,
    user: StoredKey,
}

/// The local node and user identities
pub struct LocalIdentity {
    pub node: Arc<Identity>,
    pub user: Arc<Identity>,
}

fn store_key(identity: &Identity, secret: &[u8]) -> Result<StoredKey> {
    let encrypted = identity.export_encrypted(secret)?;
    Ok(StoredKey {
        public_key: hex::encode(identity.public().der()),
        private_key_nonce: hex::encode(&encrypted.nonce),
        private_key: hex::encode(&encrypted.ciphertext),
    })
}

fn load_key(stored: &StoredKey, secret: &[u8], name: &str) -> Result<Identity> {
    let encrypted = EncryptedKey {
        nonce: hex::decode(&stored.private_key_nonce).context("bad nonce encoding")?,
        ciphertext: hex::decode(&stored.private_key).context("bad key encoding")?,
    };
    Identity::import_encrypted(&encrypted, secret, name)
}

/// Load the identity file, creating it on first run
pub fn load_or_create(path: &Path, user_name: &str) -> Result<LocalIdentity> {
    load_or_create_with_bits(path, user_name, 2048)
}

/// Key size override for tests
pub fn load_or_create_with_bits(path: &Path, user_name: &str, bits: usize) -> Result<LocalIdentity> {
    if path.exists() {
        let bytes = std::fs::read(path)
            .with_context(|| format!("cannot read identity file {}", path.display()))?;
        let file: IdentityFile =
            serde_json::from_slice(&bytes).context("cannot parse identity file")?;
        let secret = hex::decode(&file.secret).context("bad secret encoding")?;
        let node = load_key(&file.node, &secret, &format!("{}-node", file.name))?;
        let user = load_key(&file.user, &secret, &file.name)?;
        info!(user = %file.name, contact = ?user.digest(), node = ?node.digest(),
              "identity loaded");
        return Ok(LocalIdentity { node: Arc::new(node), user: Arc::new(user) });
    }

    info!(user = %user_name, "generating identity, this can take a moment");
    let node = Identity::generate_with_bits(&format!("{user_name}-node"), bits)?;
    let user = Identity::generate_with_bits(user_name, bits)?;
    let secret = lib_crypto::strong_bytes(32);

    let file = IdentityFile {
        name: user_name.to_string(),
        secret: hex::encode(&secret),
        node: store_key(&node, &secret)?,
        user: store_key(&user, &secret)?,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_vec_pretty(&file)?;
    std::fs::write(path, json)
        .with_context(|| format!("cannot write identity file {}", path.display()))?;
    info!(contact = ?user.digest(), node = ?node.digest(), "identity created");
    Ok(LocalIdentity { node: Arc::new(node), user: Arc::new(user) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");

        let created = load_or_create_with_bits(&path, "alice", 1024).unwrap();
        assert!(path.exists());

        let loaded = load_or_create_with_bits(&path, "alice", 1024).unwrap();
        assert_eq!(created.user.digest(), loaded.user.digest());
        assert_eq!(created.node.digest(), loaded.node.digest());
    }

    #[test]
    fn test_corrupt_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");
        std::fs::write(&path, b"not json").unwrap();
        assert!(load_or_create(&path, "alice").is_err());
    }
}
