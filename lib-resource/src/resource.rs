//! Resource handles

use crate::error::ResourceError;
use crate::fetcher::BlockFetcher;
use crate::records::IndexRecord;
use crate::KIND_DIRECTORY;
use lib_crypto::{Digest, PublicIdentity};
use lib_storage::BLOCK_SIZE;

/// A fetched resource: its handle plus the decoded index record
#[derive(Clone, Debug)]
pub struct Resource {
    digest: Digest,
    index: IndexRecord,
}

impl Resource {
    pub fn new(digest: Digest, index: IndexRecord) -> Self {
        Self { digest, index }
    }

    /// Load a resource by its index block digest. With a local-only
    /// fetcher this never touches the network.
    pub async fn fetch<F: BlockFetcher + ?Sized>(
        fetcher: &F,
        digest: Digest,
    ) -> Result<Self, ResourceError> {
        let bytes = fetcher.fetch(&digest).await?;
        let index = IndexRecord::decode(&bytes)?;
        Ok(Self { digest, index })
    }

    pub fn digest(&self) -> Digest {
        self.digest
    }

    pub fn index(&self) -> &IndexRecord {
        &self.index
    }

    pub fn name(&self) -> &str {
        &self.index.name
    }

    pub fn kind(&self) -> &str {
        &self.index.kind
    }

    pub fn size(&self) -> u64 {
        self.index.size
    }

    pub fn salt(&self) -> &[u8] {
        &self.index.salt
    }

    pub fn is_directory(&self) -> bool {
        self.index.kind == KIND_DIRECTORY
    }

    pub fn block_count(&self) -> usize {
        self.index.block_digests.len()
    }

    /// Map a byte position to (block index, offset inside the block)
    pub fn block_at(&self, position: u64) -> Option<(usize, usize)> {
        if position >= self.index.size {
            return None;
        }
        Some((
            (position / BLOCK_SIZE as u64) as usize,
            (position % BLOCK_SIZE as u64) as usize,
        ))
    }

    pub fn block_digest(&self, index: usize) -> Option<Digest> {
        self.index.block_digests.get(index).copied()
    }

    /// Pull every referenced content block into the local store, for
    /// subscribers that want the body and not just the index
    pub async fn prefetch<F: BlockFetcher + ?Sized>(
        &self,
        fetcher: &F,
    ) -> Result<(), ResourceError> {
        for digest in &self.index.block_digests {
            fetcher.fetch(digest).await?;
        }
        Ok(())
    }

    pub fn is_signed(&self) -> bool {
        self.index.is_signed()
    }

    /// Verify the index signature against the publisher's key
    pub fn check(&self, key: &PublicIdentity) -> Result<(), ResourceError> {
        self.index.check(key)
    }
}
