//! Resource construction
//!
//! Content is cut into 256 KiB blocks, optionally encrypted, written
//! to the store, and described by an index block whose digest becomes
//! the resource handle. Construction is deterministic: identical
//! content, name and secret always produce the same handle.

use crate::error::ResourceError;
use crate::records::{DirectoryRecord, IndexRecord};
use crate::resource::Resource;
use crate::{KIND_DIRECTORY, KIND_FILE};
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use lib_crypto::{kdf, sha256, Digest, Identity};
use lib_storage::{BlockKind, BlockStore, Chunker, BLOCK_SIZE};
use std::path::Path;
use tracing::debug;

/// Context string for per-resource content keys
const CONTENT_KEY_CONTEXT: &[u8] = b"teapotnet resource content v1";

/// One index block bounds how many blocks a resource may reference
const MAX_BLOCKS: usize = 8000;

#[derive(Default, Clone)]
pub struct ProcessOptions {
    pub name: String,
    pub kind: Option<String>,
    /// Content encryption secret; the key derives from it and the salt
    pub secret: Option<Vec<u8>>,
    /// Sign the index record with this identity
    pub signer: Option<std::sync::Arc<Identity>>,
}

/// Derive the per-resource content key
pub fn content_key(secret: &[u8], salt: &[u8]) -> Result<[u8; 32], ResourceError> {
    let derived = kdf::derive_key_salted(secret, salt, CONTENT_KEY_CONTEXT, 32)
        .map_err(|e| ResourceError::InvalidData(e.to_string()))?;
    let mut key = [0u8; 32];
    key.copy_from_slice(&derived);
    Ok(key)
}

/// Apply the ChaCha20 keystream for one block; the nonce is the block
/// index, so blocks encrypt and decrypt independently
pub fn apply_block_cipher(key: &[u8; 32], block_index: u64, data: &mut [u8]) {
    let mut nonce = [0u8; 12];
    nonce[..8].copy_from_slice(&block_index.to_le_bytes());
    let mut cipher = ChaCha20::new(key.into(), &nonce.into());
    cipher.apply_keystream(data);
}

/// Build a resource from in-memory content
pub async fn process_bytes(
    store: &BlockStore,
    data: &[u8],
    options: ProcessOptions,
) -> Result<Resource, ResourceError> {
    let kind = options.kind.unwrap_or_else(|| KIND_FILE.to_string());
    let size = data.len() as u64;
    let chunker = Chunker::new();
    if chunker.count(size) as usize > MAX_BLOCKS {
        return Err(ResourceError::TooLarge(size));
    }

    // The salt is derived, not random, so identical input yields an
    // identical resource digest
    let (salt, key) = match &options.secret {
        Some(secret) => {
            let mut salted = options.name.as_bytes().to_vec();
            salted.extend_from_slice(sha256(data).as_bytes());
            let salt = sha256(&salted).to_vec();
            let key = content_key(secret, &salt)?;
            (salt, Some(key))
        }
        None => (Vec::new(), None),
    };

    let mut block_digests = Vec::with_capacity(chunker.count(size) as usize);
    for (block_index, chunk) in chunker.chunks(data).enumerate() {
        let mut block = chunk.to_vec();
        if let Some(key) = &key {
            apply_block_cipher(key, block_index as u64, &mut block);
        }
        let digest = store.put(block).await?;
        block_digests.push(digest);
    }

    let mut index = IndexRecord {
        name: options.name,
        kind,
        size,
        block_digests,
        signature: None,
        salt,
    };
    if let Some(signer) = &options.signer {
        index.sign(signer)?;
    }

    let encoded = index.encode()?;
    if encoded.len() > BLOCK_SIZE {
        return Err(ResourceError::TooLarge(size));
    }
    let digest = store.put_kind(encoded, BlockKind::Index).await?;
    debug!(resource = ?digest, size, blocks = index.block_digests.len(), "resource processed");
    Ok(Resource::new(digest, index))
}

/// Build a resource from a file on disk
pub async fn process_file(
    store: &BlockStore,
    path: &Path,
    options: ProcessOptions,
) -> Result<Resource, ResourceError> {
    let data = tokio::fs::read(path).await?;
    process_bytes(store, &data, options).await
}

/// Build a directory resource from its entries, ordered by name
pub async fn build_directory(
    store: &BlockStore,
    mut entries: Vec<DirectoryRecord>,
    options: ProcessOptions,
) -> Result<Resource, ResourceError> {
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    let mut body = Vec::new();
    for entry in &entries {
        entry.write_to(&mut body)?;
    }
    let options = ProcessOptions {
        kind: Some(KIND_DIRECTORY.to_string()),
        ..options
    };
    process_bytes(store, &body, options).await
}
