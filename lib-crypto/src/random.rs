//! Random number generation levels
//!
//! Three levels mirror the intended uses: nonces, symmetric keys, and
//! long-lived identifiers. All draw from the operating system generator;
//! the levels exist so call sites state what they are generating.

use rand::rngs::OsRng;
use rand::RngCore;

/// Random bytes for nonces and per-message material
pub fn nonce_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// Random bytes for symmetric keys
pub fn key_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// Random bytes for long-lived identifiers (tunnel ids, salts)
pub fn strong_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// A random 64-bit value from the strong generator
pub fn random_u64() -> u64 {
    OsRng.next_u64()
}

/// Fill a fixed array with strong random bytes
pub fn fill(buf: &mut [u8]) {
    OsRng.fill_bytes(buf);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lengths() {
        assert_eq!(nonce_bytes(12).len(), 12);
        assert_eq!(key_bytes(32).len(), 32);
        assert_eq!(strong_bytes(8).len(), 8);
    }

    #[test]
    fn test_not_constant() {
        // Astronomically unlikely to collide
        assert_ne!(key_bytes(32), key_bytes(32));
        assert_ne!(random_u64(), random_u64());
    }
}
