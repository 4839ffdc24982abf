//! Teapotnet cryptography foundation
//!
//! Everything the overlay, tunneler and resource layers need from
//! cryptography lives here: 32-byte digests, the random number generator
//! levels, HKDF key derivation, RSA identities with self-signed
//! certificates, the datagram AEAD cipher, and the authenticated
//! transport handshake shared by peer connections and tunnels.

pub mod aead;
pub mod digest;
pub mod error;
pub mod hash;
pub mod identity;
pub mod kdf;
pub mod random;
pub mod transport;

pub use aead::DatagramCipher;
pub use digest::Digest;
pub use error::CryptoError;
pub use hash::{sha256, Sha256Hasher};
pub use identity::{Certificate, Identity, PublicIdentity};
pub use kdf::derive_key;
pub use random::{key_bytes, nonce_bytes, random_u64, strong_bytes};
pub use transport::{SecureTransport, TransportRole};
