//! Block acquisition interface
//!
//! Readers pull blocks through this trait so they work the same over a
//! purely local store and over the caller plane.

use crate::error::ResourceError;
use async_trait::async_trait;
use lib_crypto::Digest;
use lib_network::Network;
use lib_storage::BlockStore;
use std::sync::Arc;
use std::time::Duration;

/// Default per-block fetch deadline
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(60);

#[async_trait]
pub trait BlockFetcher: Send + Sync {
    async fn fetch(&self, digest: &Digest) -> Result<Vec<u8>, ResourceError>;
}

/// Local-only: the store either has the block or the fetch fails
#[async_trait]
impl BlockFetcher for BlockStore {
    async fn fetch(&self, digest: &Digest) -> Result<Vec<u8>, ResourceError> {
        self.get(digest).await.map_err(ResourceError::from)
    }
}

/// Networked: registers a fetch intent and waits for the block
#[async_trait]
impl BlockFetcher for Arc<Network> {
    async fn fetch(&self, digest: &Digest) -> Result<Vec<u8>, ResourceError> {
        Network::fetch(self, *digest, FETCH_TIMEOUT)
            .await
            .map_err(ResourceError::from)
    }
}
