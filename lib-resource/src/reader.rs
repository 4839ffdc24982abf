//! Resource reader
//!
//! Seek/read over a resource by mapping positions to (block, offset)
//! and fetching blocks lazily. Fetched blocks are digest-verified by
//! the store layer; decryption applies when the resource was built
//! with a secret. Directory resources yield one record at a time.

use crate::builder::{apply_block_cipher, content_key};
use crate::error::ResourceError;
use crate::fetcher::BlockFetcher;
use crate::records::DirectoryRecord;
use crate::resource::Resource;
use lib_storage::BLOCK_SIZE;

pub struct Reader<'a, F: BlockFetcher + ?Sized> {
    resource: &'a Resource,
    fetcher: &'a F,
    position: u64,
    key: Option<[u8; 32]>,
    /// Most recently fetched block, decrypted
    current: Option<(usize, Vec<u8>)>,
}

impl<'a, F: BlockFetcher + ?Sized> Reader<'a, F> {
    pub fn new(resource: &'a Resource, fetcher: &'a F) -> Self {
        Self {
            resource,
            fetcher,
            position: 0,
            key: None,
            current: None,
        }
    }

    /// Reader for a resource built with a secret
    pub fn with_secret(
        resource: &'a Resource,
        fetcher: &'a F,
        secret: &[u8],
    ) -> Result<Self, ResourceError> {
        let key = content_key(secret, resource.salt())?;
        Ok(Self {
            resource,
            fetcher,
            position: 0,
            key: Some(key),
            current: None,
        })
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn seek(&mut self, position: u64) {
        self.position = position.min(self.resource.size());
    }

    async fn ensure_block(&mut self, index: usize) -> Result<(), ResourceError> {
        if self.current.as_ref().map(|(i, _)| *i) == Some(index) {
            return Ok(());
        }
        let digest = self
            .resource
            .block_digest(index)
            .ok_or_else(|| ResourceError::InvalidData("block index out of range".into()))?;
        let mut data = self.fetcher.fetch(&digest).await?;
        if let Some(key) = &self.key {
            apply_block_cipher(key, index as u64, &mut data);
        }
        self.current = Some((index, data));
        Ok(())
    }

    /// Read up to `buf.len()` bytes; zero at end of resource
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, ResourceError> {
        let size = self.resource.size();
        let mut written = 0;
        while written < buf.len() && self.position < size {
            let Some((index, offset)) = self.resource.block_at(self.position) else { break };
            self.ensure_block(index).await?;

            let take = {
                let (_, block) = self.current.as_ref().expect("block cached above");
                if offset >= block.len() {
                    return Err(ResourceError::InvalidData(
                        "block shorter than index claims".into(),
                    ));
                }
                let take = (buf.len() - written)
                    .min(block.len() - offset)
                    .min((size - self.position) as usize);
                buf[written..written + take].copy_from_slice(&block[offset..offset + take]);
                take
            };
            written += take;
            self.position += take as u64;
        }
        Ok(written)
    }

    /// Read the remainder of the resource
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, ResourceError> {
        let remaining = (self.resource.size() - self.position) as usize;
        let mut out = vec![0u8; remaining];
        let mut filled = 0;
        while filled < remaining {
            let n = self.read(&mut out[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        out.truncate(filled);
        Ok(out)
    }

    /// Next directory record, or None at the end. Only valid on
    /// directory resources.
    pub async fn read_directory(&mut self) -> Result<Option<DirectoryRecord>, ResourceError> {
        if !self.resource.is_directory() {
            return Err(ResourceError::InvalidData("not a directory".into()));
        }
        // Entries never exceed a block, so a bounded peek suffices
        let mut header = [0u8; 4];
        let at = self.position;
        let n = self.fill_exact(&mut header).await?;
        if n == 0 {
            return Ok(None);
        }
        if n < 4 {
            self.position = at;
            return Err(ResourceError::InvalidData("truncated directory entry".into()));
        }
        let len = u32::from_le_bytes(header) as usize;
        if len > BLOCK_SIZE {
            return Err(ResourceError::InvalidData("oversized directory entry".into()));
        }
        let mut body = vec![0u8; len];
        if self.fill_exact(&mut body).await? != len {
            self.position = at;
            return Err(ResourceError::InvalidData("truncated directory entry".into()));
        }
        let record: DirectoryRecord = bincode::deserialize(&body)
            .map_err(|e| ResourceError::InvalidData(e.to_string()))?;
        Ok(Some(record))
    }

    /// Fill the buffer completely or report how much was available
    async fn fill_exact(&mut self, buf: &mut [u8]) -> Result<usize, ResourceError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{build_directory, process_bytes, ProcessOptions};
    use lib_storage::{BlockStore, StoreConfig};

    fn temp_store() -> (BlockStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(StoreConfig {
            root: dir.path().to_path_buf(),
            quota: 1 << 30,
        })
        .unwrap();
        (store, dir)
    }

    fn options(name: &str) -> ProcessOptions {
        ProcessOptions {
            name: name.to_string(),
            ..ProcessOptions::default()
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 13 % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_read_multi_block() {
        let (store, _dir) = temp_store();
        let data = pattern(BLOCK_SIZE * 2 + 1000);
        let resource = process_bytes(&store, &data, options("big")).await.unwrap();
        assert_eq!(resource.block_count(), 3);

        let mut reader = Reader::new(&resource, &store);
        let back = reader.read_to_end().await.unwrap();
        assert_eq!(back, data);
    }

    #[tokio::test]
    async fn test_seek_and_partial_read() {
        let (store, _dir) = temp_store();
        let data = pattern(BLOCK_SIZE + 500);
        let resource = process_bytes(&store, &data, options("seek")).await.unwrap();

        let mut reader = Reader::new(&resource, &store);
        // Straddle the block boundary
        reader.seek(BLOCK_SIZE as u64 - 10);
        let mut buf = [0u8; 20];
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(n, 20);
        assert_eq!(&buf[..], &data[BLOCK_SIZE - 10..BLOCK_SIZE + 10]);

        // Past the end reads nothing
        reader.seek(resource.size() + 100);
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_encrypted_round_trip() {
        let (store, _dir) = temp_store();
        let data = pattern(300_000);
        let opts = ProcessOptions {
            secret: Some(b"shared secret".to_vec()),
            ..options("enc")
        };
        let resource = process_bytes(&store, &data, opts).await.unwrap();

        let mut reader = Reader::with_secret(&resource, &store, b"shared secret").unwrap();
        assert_eq!(reader.read_to_end().await.unwrap(), data);

        // The wrong secret decodes to garbage, not the content
        let mut wrong = Reader::with_secret(&resource, &store, b"wrong").unwrap();
        assert_ne!(wrong.read_to_end().await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_directory_iteration() {
        let (store, _dir) = temp_store();
        let file_a = process_bytes(&store, b"aaa", options("a.txt")).await.unwrap();
        let file_b = process_bytes(&store, b"bbbb", options("b.txt")).await.unwrap();

        let entries = vec![
            DirectoryRecord {
                name: "b.txt".into(),
                kind: "file".into(),
                size: 4,
                digest: file_b.digest(),
                time: 2,
            },
            DirectoryRecord {
                name: "a.txt".into(),
                kind: "file".into(),
                size: 3,
                digest: file_a.digest(),
                time: 1,
            },
        ];
        let directory = build_directory(&store, entries, options("dir")).await.unwrap();
        assert!(directory.is_directory());

        let mut reader = Reader::new(&directory, &store);
        let first = reader.read_directory().await.unwrap().unwrap();
        let second = reader.read_directory().await.unwrap().unwrap();
        assert!(reader.read_directory().await.unwrap().is_none());

        // Entries come back in lexical order by name
        assert_eq!(first.name, "a.txt");
        assert_eq!(second.name, "b.txt");
        assert_eq!(first.digest, file_a.digest());

        // Each entry resolves to a fetchable resource
        let child = Resource::fetch(&store, first.digest).await.unwrap();
        let mut child_reader = Reader::new(&child, &store);
        assert_eq!(child_reader.read_to_end().await.unwrap(), b"aaa");
    }

    #[tokio::test]
    async fn test_read_directory_on_file_fails() {
        let (store, _dir) = temp_store();
        let resource = process_bytes(&store, b"data", options("f")).await.unwrap();
        let mut reader = Reader::new(&resource, &store);
        assert!(reader.read_directory().await.is_err());
    }
}
