//! Error kinds for the overlay

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OverlayError {
    /// Transport-level failure; retried with backoff before surfacing
    #[error("network error: {0}")]
    Network(String),

    /// Peer key did not match the expected node identifier
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Malformed frame or payload
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Deadline exceeded; callers treat this as an absent result
    #[error("timed out")]
    Timeout,

    /// Version or feature mismatch
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// No route or connection available for the destination
    #[error("no route to {0}")]
    NoRoute(String),

    /// The overlay is shutting down
    #[error("closed")]
    Closed,
}

impl From<lib_crypto::CryptoError> for OverlayError {
    fn from(e: lib_crypto::CryptoError) -> Self {
        match e {
            lib_crypto::CryptoError::Auth(m) => OverlayError::Auth(m),
            lib_crypto::CryptoError::InvalidData(m) => OverlayError::InvalidData(m),
            lib_crypto::CryptoError::Unsupported(m) => OverlayError::Unsupported(m),
            lib_crypto::CryptoError::State(m) => OverlayError::Network(m),
        }
    }
}

impl From<std::io::Error> for OverlayError {
    fn from(e: std::io::Error) -> Self {
        OverlayError::Network(e.to_string())
    }
}
