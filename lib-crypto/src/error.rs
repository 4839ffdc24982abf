//! Error kinds for cryptographic operations

use thiserror::Error;

/// Failure kinds surfaced by this crate
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Peer key does not match the expected identifier, or a signature
    /// over the handshake transcript failed to verify
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Malformed frame, bad tag, replayed sequence number
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Version or feature mismatch
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Operation attempted in the wrong handshake state
    #[error("invalid state: {0}")]
    State(String),
}
