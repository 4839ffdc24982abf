//! Fixed-size chunking
//!
//! Resources are cut into blocks of at most 256 KiB. Chunking is
//! deterministic: identical content always yields identical block
//! boundaries and therefore identical digests.

use crate::BLOCK_SIZE;

/// Splits byte slices into block-sized chunks
pub struct Chunker {
    block_size: usize,
}

impl Chunker {
    pub fn new() -> Self {
        Self { block_size: BLOCK_SIZE }
    }

    /// A smaller block size, used by tests
    pub fn with_block_size(block_size: usize) -> Self {
        assert!(block_size > 0);
        Self { block_size }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Iterate chunks in order. Empty input yields no chunks.
    pub fn chunks<'a>(&self, data: &'a [u8]) -> impl Iterator<Item = &'a [u8]> {
        data.chunks(self.block_size)
    }

    /// Number of blocks needed for a payload of the given length
    pub fn count(&self, len: u64) -> u64 {
        len.div_ceil(self.block_size as u64)
    }

    /// Map a byte position to (block index, offset inside block)
    pub fn locate(&self, position: u64) -> (u64, usize) {
        (
            position / self.block_size as u64,
            (position % self.block_size as u64) as usize,
        )
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_multiple() {
        let chunker = Chunker::with_block_size(4);
        let chunks: Vec<_> = chunker.chunks(b"abcdefgh").collect();
        assert_eq!(chunks, vec![&b"abcd"[..], &b"efgh"[..]]);
    }

    #[test]
    fn test_trailing_partial() {
        let chunker = Chunker::with_block_size(4);
        let chunks: Vec<_> = chunker.chunks(b"abcdef").collect();
        assert_eq!(chunks, vec![&b"abcd"[..], &b"ef"[..]]);
    }

    #[test]
    fn test_empty() {
        let chunker = Chunker::with_block_size(4);
        assert_eq!(chunker.chunks(b"").count(), 0);
        assert_eq!(chunker.count(0), 0);
    }

    #[test]
    fn test_locate() {
        let chunker = Chunker::with_block_size(10);
        assert_eq!(chunker.locate(0), (0, 0));
        assert_eq!(chunker.locate(9), (0, 9));
        assert_eq!(chunker.locate(10), (1, 0));
        assert_eq!(chunker.locate(25), (2, 5));
    }

    #[test]
    fn test_count_boundaries() {
        let chunker = Chunker::with_block_size(10);
        assert_eq!(chunker.count(9), 1);
        assert_eq!(chunker.count(10), 1);
        assert_eq!(chunker.count(11), 2);
    }
}
