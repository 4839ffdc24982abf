//! Error kinds for the resource layer

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResourceError {
    /// A block is neither local nor retrievable right now; the reader
    /// may retry later
    #[error("not present")]
    NotPresent,

    /// Malformed index or directory record, or failed signature
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Deadline exceeded while fetching a block
    #[error("timed out")]
    Timeout,

    /// Resource exceeds what one index block can describe
    #[error("resource too large: {0} bytes")]
    TooLarge(u64),

    /// Filesystem failure while processing
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<lib_storage::StoreError> for ResourceError {
    fn from(e: lib_storage::StoreError) -> Self {
        match e {
            lib_storage::StoreError::NotPresent => ResourceError::NotPresent,
            lib_storage::StoreError::InvalidData(m) => ResourceError::InvalidData(m),
            lib_storage::StoreError::TooLarge(n) => ResourceError::TooLarge(n as u64),
            lib_storage::StoreError::Io(e) => ResourceError::Io(e),
            lib_storage::StoreError::Index(m) => ResourceError::InvalidData(m),
        }
    }
}

impl From<lib_network::NetworkError> for ResourceError {
    fn from(e: lib_network::NetworkError) -> Self {
        match e {
            lib_network::NetworkError::NotPresent => ResourceError::NotPresent,
            lib_network::NetworkError::Timeout => ResourceError::Timeout,
            lib_network::NetworkError::InvalidData(m) => ResourceError::InvalidData(m),
            other => ResourceError::InvalidData(other.to_string()),
        }
    }
}
