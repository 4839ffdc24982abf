//! Teapotnet content-addressed block store
//!
//! Blocks are immutable byte arrays of at most 256 KiB whose SHA-256
//! digest is their identifier. Content lives one file per digest under a
//! sharded directory; a small embedded index tracks size, refcount and
//! last access for eviction.

pub mod chunker;
pub mod error;
pub mod store;

pub use chunker::Chunker;
pub use error::StoreError;
pub use store::{BlockKind, BlockStore, StoreConfig};

/// Maximum block size in bytes (256 KiB)
pub const BLOCK_SIZE: usize = 256 * 1024;
