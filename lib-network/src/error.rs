//! Error kinds for the contact plane

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetworkError {
    /// Transport-level failure
    #[error("network error: {0}")]
    Network(String),

    /// Contact key does not match the expected identifier
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Malformed record, frame or block
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Deadline exceeded; absent result, never a panic
    #[error("timed out")]
    Timeout,

    /// Block or value not available locally or remotely
    #[error("not present")]
    NotPresent,

    /// Version or feature mismatch
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A conflicting operation is already in progress
    #[error("busy: {0}")]
    Busy(String),

    /// The link or service has been closed
    #[error("closed")]
    Closed,
}

impl From<lib_crypto::CryptoError> for NetworkError {
    fn from(e: lib_crypto::CryptoError) -> Self {
        match e {
            lib_crypto::CryptoError::Auth(m) => NetworkError::Auth(m),
            lib_crypto::CryptoError::InvalidData(m) => NetworkError::InvalidData(m),
            lib_crypto::CryptoError::Unsupported(m) => NetworkError::Unsupported(m),
            lib_crypto::CryptoError::State(m) => NetworkError::Network(m),
        }
    }
}

impl From<lib_overlay::OverlayError> for NetworkError {
    fn from(e: lib_overlay::OverlayError) -> Self {
        match e {
            lib_overlay::OverlayError::Auth(m) => NetworkError::Auth(m),
            lib_overlay::OverlayError::InvalidData(m) => NetworkError::InvalidData(m),
            lib_overlay::OverlayError::Timeout => NetworkError::Timeout,
            lib_overlay::OverlayError::Unsupported(m) => NetworkError::Unsupported(m),
            lib_overlay::OverlayError::Closed => NetworkError::Closed,
            lib_overlay::OverlayError::Network(m) | lib_overlay::OverlayError::NoRoute(m) => {
                NetworkError::Network(m)
            }
        }
    }
}

impl From<lib_storage::StoreError> for NetworkError {
    fn from(e: lib_storage::StoreError) -> Self {
        match e {
            lib_storage::StoreError::NotPresent => NetworkError::NotPresent,
            lib_storage::StoreError::InvalidData(m) => NetworkError::InvalidData(m),
            other => NetworkError::Network(other.to_string()),
        }
    }
}
