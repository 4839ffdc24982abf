//! Block store
//!
//! Layout: one file per digest under `<root>/blocks/<first two hex
//! chars>/<digest hex>`, plus a sled index `digest -> {size, refcount,
//! last_access, kind}`. Verification is mandatory on read; content that
//! fails verification is deleted and reported as not present. Writes are
//! idempotent and race-safe: the first write for a digest wins.
//!
//! Eviction walks unpinned entries in least-recently-used order whenever
//! the store exceeds its quota. It runs in bounded batches off the
//! reader path.

use crate::error::StoreError;
use crate::BLOCK_SIZE;
use lib_crypto::{sha256, Digest};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Eviction stops once usage falls below quota * NUM / DEN
const EVICT_LOW_NUM: u64 = 9;
const EVICT_LOW_DEN: u64 = 10;

/// Maximum files removed per eviction pass
const EVICT_BATCH: usize = 128;

/// What a stored block is used for; kept in the index for diagnostics
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockKind {
    Content,
    Index,
}

#[derive(Serialize, Deserialize)]
struct IndexEntry {
    size: u64,
    refcount: u32,
    last_access: u64,
    kind: BlockKind,
}

#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub root: PathBuf,
    /// Quota in bytes over unpinned + pinned content
    pub quota: u64,
}

struct Inner {
    root: PathBuf,
    index: sled::Db,
    quota: u64,
    total: AtomicU64,
    evicting: AtomicBool,
    waiters: Mutex<HashMap<Digest, Arc<Notify>>>,
}

/// Shared handle to the content-addressed store
#[derive(Clone)]
pub struct BlockStore {
    inner: Arc<Inner>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl BlockStore {
    /// Open or create a store under the configured root
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        std::fs::create_dir_all(config.root.join("blocks"))?;
        let index = sled::open(config.root.join("index"))?;

        // Rebuild the usage counter from the index
        let mut total = 0u64;
        for item in index.iter() {
            let (_, value) = item?;
            if let Ok(entry) = bincode::deserialize::<IndexEntry>(&value) {
                total += entry.size;
            }
        }

        debug!(total, quota = config.quota, "block store opened");
        Ok(Self {
            inner: Arc::new(Inner {
                root: config.root,
                index,
                quota: config.quota,
                total: AtomicU64::new(total),
                evicting: AtomicBool::new(false),
                waiters: Mutex::new(HashMap::new()),
            }),
        })
    }

    fn path_for(root: &Path, digest: &Digest) -> PathBuf {
        let hex = digest.to_hex();
        root.join("blocks").join(&hex[..2]).join(&hex)
    }

    /// Write a block and return its digest
    pub async fn put(&self, data: Vec<u8>) -> Result<Digest, StoreError> {
        self.put_kind(data, BlockKind::Content).await
    }

    /// Write a block with an explicit kind
    pub async fn put_kind(&self, data: Vec<u8>, kind: BlockKind) -> Result<Digest, StoreError> {
        if data.len() > BLOCK_SIZE {
            return Err(StoreError::TooLarge(data.len()));
        }
        let digest = sha256(&data);
        let inner = self.inner.clone();
        let stored =
            tokio::task::spawn_blocking(move || inner.put_sync(&digest, &data, kind))
                .await
                .map_err(|e| StoreError::Index(e.to_string()))??;
        if stored {
            self.notify_arrival(&digest);
            self.maybe_evict();
        }
        Ok(digest)
    }

    /// Store content that must hash to `expected`; incoming pushes use this
    pub async fn put_expected(&self, expected: Digest, data: Vec<u8>) -> Result<(), StoreError> {
        if sha256(&data) != expected {
            return Err(StoreError::InvalidData(format!(
                "content does not hash to {expected:?}"
            )));
        }
        self.put(data).await?;
        Ok(())
    }

    /// Read and verify a block
    pub async fn get(&self, digest: &Digest) -> Result<Vec<u8>, StoreError> {
        let inner = self.inner.clone();
        let digest = *digest;
        tokio::task::spawn_blocking(move || inner.get_sync(&digest))
            .await
            .map_err(|e| StoreError::Index(e.to_string()))?
    }

    pub async fn has(&self, digest: &Digest) -> bool {
        let inner = self.inner.clone();
        let digest = *digest;
        tokio::task::spawn_blocking(move || inner.index.contains_key(digest.as_bytes()).unwrap_or(false))
            .await
            .unwrap_or(false)
    }

    /// Increment the retention refcount
    pub async fn pin(&self, digest: &Digest) -> Result<(), StoreError> {
        self.update_refcount(digest, 1).await
    }

    /// Decrement the retention refcount
    pub async fn unpin(&self, digest: &Digest) -> Result<(), StoreError> {
        self.update_refcount(digest, -1).await
    }

    async fn update_refcount(&self, digest: &Digest, delta: i32) -> Result<(), StoreError> {
        let inner = self.inner.clone();
        let digest = *digest;
        tokio::task::spawn_blocking(move || {
            let key = digest.as_bytes();
            let value = inner.index.get(key)?.ok_or(StoreError::NotPresent)?;
            let mut entry: IndexEntry = bincode::deserialize(&value)
                .map_err(|e| StoreError::Index(e.to_string()))?;
            entry.refcount = if delta >= 0 {
                entry.refcount.saturating_add(delta as u32)
            } else {
                entry.refcount.saturating_sub((-delta) as u32)
            };
            let encoded =
                bincode::serialize(&entry).map_err(|e| StoreError::Index(e.to_string()))?;
            inner.index.insert(key, encoded)?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Index(e.to_string()))?
    }

    /// Wait until a block arrives, up to `timeout`. A timeout surfaces as
    /// `NotPresent`, never as a panic or a hang.
    pub async fn wait(&self, digest: &Digest, timeout: Duration) -> Result<Vec<u8>, StoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.get(digest).await {
                Ok(data) => return Ok(data),
                Err(StoreError::NotPresent) => {}
                Err(e) => return Err(e),
            }

            let notify = {
                let mut waiters = self.inner.waiters.lock().unwrap();
                waiters.entry(*digest).or_insert_with(|| Arc::new(Notify::new())).clone()
            };
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // Close the race between the check above and registration
            match self.get(digest).await {
                Ok(data) => return Ok(data),
                Err(StoreError::NotPresent) => {}
                Err(e) => return Err(e),
            }

            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Err(StoreError::NotPresent);
            };
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Err(StoreError::NotPresent);
            }
        }
    }

    /// Current usage in bytes
    pub fn usage(&self) -> u64 {
        self.inner.total.load(Ordering::SeqCst)
    }

    fn notify_arrival(&self, digest: &Digest) {
        let notify = self.inner.waiters.lock().unwrap().remove(digest);
        if let Some(notify) = notify {
            notify.notify_waiters();
        }
    }

    fn maybe_evict(&self) {
        let inner = self.inner.clone();
        if inner.total.load(Ordering::SeqCst) <= inner.quota {
            return;
        }
        if inner.evicting.swap(true, Ordering::SeqCst) {
            return;
        }
        tokio::task::spawn_blocking(move || {
            inner.evict_sync();
            inner.evicting.store(false, Ordering::SeqCst);
        });
    }
}

impl Inner {
    /// Returns true when the block was newly stored
    fn put_sync(&self, digest: &Digest, data: &[u8], kind: BlockKind) -> Result<bool, StoreError> {
        let key = digest.as_bytes();
        if let Some(value) = self.index.get(key)? {
            // Digest-first-wins: just refresh the access time
            if let Ok(mut entry) = bincode::deserialize::<IndexEntry>(&value) {
                entry.last_access = now_secs();
                if let Ok(encoded) = bincode::serialize(&entry) {
                    let _ = self.index.insert(key, encoded);
                }
            }
            return Ok(false);
        }

        let path = Self::block_path(&self.root, digest);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(data)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &path)?;

        let entry = IndexEntry {
            size: data.len() as u64,
            refcount: 0,
            last_access: now_secs(),
            kind,
        };
        let encoded = bincode::serialize(&entry).map_err(|e| StoreError::Index(e.to_string()))?;
        self.index.insert(key, encoded)?;
        self.total.fetch_add(data.len() as u64, Ordering::SeqCst);
        Ok(true)
    }

    fn get_sync(&self, digest: &Digest) -> Result<Vec<u8>, StoreError> {
        let key = digest.as_bytes();
        let value = self.index.get(key)?.ok_or(StoreError::NotPresent)?;
        let mut entry: IndexEntry =
            bincode::deserialize(&value).map_err(|e| StoreError::Index(e.to_string()))?;

        let path = Self::block_path(&self.root, digest);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Index says present but the file is gone
                let _ = self.index.remove(key);
                self.total.fetch_sub(entry.size, Ordering::SeqCst);
                return Err(StoreError::NotPresent);
            }
            Err(e) => return Err(e.into()),
        };

        if sha256(&data) != *digest {
            warn!(digest = %digest, "block failed verification, removing");
            let _ = std::fs::remove_file(&path);
            let _ = self.index.remove(key);
            self.total.fetch_sub(entry.size, Ordering::SeqCst);
            return Err(StoreError::NotPresent);
        }

        entry.last_access = now_secs();
        let encoded = bincode::serialize(&entry).map_err(|e| StoreError::Index(e.to_string()))?;
        self.index.insert(key, encoded)?;
        Ok(data)
    }

    fn block_path(root: &Path, digest: &Digest) -> PathBuf {
        BlockStore::path_for(root, digest)
    }

    fn evict_sync(&self) {
        let target = self.quota * EVICT_LOW_NUM / EVICT_LOW_DEN;
        let mut candidates: Vec<(u64, Digest, u64)> = Vec::new();

        for item in self.index.iter() {
            let Ok((key, value)) = item else { continue };
            let Ok(entry) = bincode::deserialize::<IndexEntry>(&value) else { continue };
            if entry.refcount > 0 {
                continue;
            }
            if let Some(digest) = Digest::from_slice(&key) {
                candidates.push((entry.last_access, digest, entry.size));
            }
        }
        candidates.sort();

        let mut removed = 0usize;
        for (_, digest, size) in candidates {
            if self.total.load(Ordering::SeqCst) <= target || removed >= EVICT_BATCH {
                break;
            }
            let path = Self::block_path(&self.root, &digest);
            if self.index.remove(digest.as_bytes()).is_ok() {
                let _ = std::fs::remove_file(&path);
                self.total.fetch_sub(size, Ordering::SeqCst);
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, usage = self.total.load(Ordering::SeqCst), "evicted blocks");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store(quota: u64) -> (BlockStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(StoreConfig {
            root: dir.path().to_path_buf(),
            quota,
        })
        .unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let (store, _dir) = temp_store(1 << 20);
        let digest = store.put(b"hello".to_vec()).await.unwrap();
        assert_eq!(digest, sha256(b"hello"));
        assert_eq!(store.get(&digest).await.unwrap(), b"hello");
        assert!(store.has(&digest).await);
    }

    #[tokio::test]
    async fn test_missing_is_not_present() {
        let (store, _dir) = temp_store(1 << 20);
        let digest = sha256(b"never stored");
        assert!(matches!(
            store.get(&digest).await,
            Err(StoreError::NotPresent)
        ));
    }

    #[tokio::test]
    async fn test_oversized_rejected() {
        let (store, _dir) = temp_store(1 << 30);
        let data = vec![0u8; BLOCK_SIZE + 1];
        assert!(matches!(
            store.put(data).await,
            Err(StoreError::TooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_put_expected_mismatch() {
        let (store, _dir) = temp_store(1 << 20);
        let wrong = sha256(b"something else");
        assert!(matches!(
            store.put_expected(wrong, b"content".to_vec()).await,
            Err(StoreError::InvalidData(_))
        ));
    }

    #[tokio::test]
    async fn test_corruption_detected_on_read() {
        let (store, dir) = temp_store(1 << 20);
        let digest = store.put(b"pristine".to_vec()).await.unwrap();

        // Corrupt the file behind the store's back
        let hex = digest.to_hex();
        let path = dir.path().join("blocks").join(&hex[..2]).join(&hex);
        std::fs::write(&path, b"tampered").unwrap();

        assert!(matches!(
            store.get(&digest).await,
            Err(StoreError::NotPresent)
        ));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_idempotent_put() {
        let (store, _dir) = temp_store(1 << 20);
        let a = store.put(b"same".to_vec()).await.unwrap();
        let usage = store.usage();
        let b = store.put(b"same".to_vec()).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.usage(), usage);
    }

    #[tokio::test]
    async fn test_eviction_spares_pinned() {
        let (store, _dir) = temp_store(48);

        let pinned = store.put(vec![1u8; 32]).await.unwrap();
        store.pin(&pinned).await.unwrap();

        // Push usage over quota with unpinned blocks
        for i in 0u8..6 {
            store.put(vec![i + 10; 32]).await.unwrap();
        }
        // Let the eviction pass run
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(store.has(&pinned).await, "pinned block must survive eviction");
        assert_eq!(store.get(&pinned).await.unwrap(), vec![1u8; 32]);
    }

    #[tokio::test]
    async fn test_wait_resolves_on_arrival() {
        let (store, _dir) = temp_store(1 << 20);
        let digest = sha256(b"later");

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.wait(&digest, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        store.put(b"later".to_vec()).await.unwrap();

        let data = waiter.await.unwrap().unwrap();
        assert_eq!(data, b"later");
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let (store, _dir) = temp_store(1 << 20);
        let digest = sha256(b"never");
        let result = store.wait(&digest, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(StoreError::NotPresent)));
    }

    #[tokio::test]
    async fn test_reopen_preserves_content() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig { root: dir.path().to_path_buf(), quota: 1 << 20 };
        let digest = {
            let store = BlockStore::open(config.clone()).unwrap();
            store.put(b"durable".to_vec()).await.unwrap()
        };
        let store = BlockStore::open(config).unwrap();
        assert_eq!(store.get(&digest).await.unwrap(), b"durable");
        assert_eq!(store.usage(), 7);
    }
}
