//! Error kinds for the block store

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Digest is not in the local store
    #[error("block not present")]
    NotPresent,

    /// Content failed verification or a record failed to decode
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Block exceeds the maximum block size
    #[error("block too large: {0} bytes")]
    TooLarge(usize),

    /// Filesystem failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Index database failure
    #[error("index error: {0}")]
    Index(String),
}

impl From<sled::Error> for StoreError {
    fn from(e: sled::Error) -> Self {
        StoreError::Index(e.to_string())
    }
}
