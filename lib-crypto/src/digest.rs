//! 32-byte identifiers
//!
//! A single binary type backs node identifiers, contact identifiers and
//! block digests. The namespaces never mix: a node identifier is the
//! digest of a node public key, a contact identifier the digest of a user
//! public key, a block digest the digest of block content.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Size of a digest in bytes
pub const DIGEST_SIZE: usize = 32;

/// A 32-byte cryptographic hash output
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Digest([u8; DIGEST_SIZE]);

impl Digest {
    /// The all-zero digest, used as the wildcard node in links
    pub const ZERO: Digest = Digest([0u8; DIGEST_SIZE]);

    pub fn from_bytes(bytes: [u8; DIGEST_SIZE]) -> Self {
        Digest(bytes)
    }

    /// Build from a slice, failing on wrong length
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() != DIGEST_SIZE {
            return None;
        }
        let mut bytes = [0u8; DIGEST_SIZE];
        bytes.copy_from_slice(slice);
        Some(Digest(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; DIGEST_SIZE]
    }

    /// XOR distance to another digest, as a digest
    pub fn distance(&self, other: &Digest) -> Digest {
        let mut out = [0u8; DIGEST_SIZE];
        for i in 0..DIGEST_SIZE {
            out[i] = self.0[i] ^ other.0[i];
        }
        Digest(out)
    }

    /// Number of leading zero bits, 0..=256
    ///
    /// The XOR distance of two digests with a common prefix of n bits has
    /// n leading zeros; the bucket index is derived from this.
    pub fn leading_zero_bits(&self) -> u32 {
        let mut bits = 0;
        for byte in &self.0 {
            if *byte == 0 {
                bits += 8;
            } else {
                bits += byte.leading_zeros();
                break;
            }
        }
        bits
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        Self::from_slice(&bytes)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps log lines readable
        write!(f, "{}", &self.to_hex()[..16])
    }
}

impl FromStr for Digest {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes).ok_or(hex::FromHexError::InvalidStringLength)
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_is_symmetric() {
        let a = Digest::from_bytes([0xAA; 32]);
        let b = Digest::from_bytes([0x0F; 32]);
        assert_eq!(a.distance(&b), b.distance(&a));
        assert!(a.distance(&a).is_zero());
    }

    #[test]
    fn test_leading_zero_bits() {
        assert_eq!(Digest::ZERO.leading_zero_bits(), 256);

        let mut bytes = [0u8; 32];
        bytes[0] = 0x01;
        assert_eq!(Digest::from_bytes(bytes).leading_zero_bits(), 7);

        let mut bytes = [0u8; 32];
        bytes[1] = 0x80;
        assert_eq!(Digest::from_bytes(bytes).leading_zero_bits(), 8);
    }

    #[test]
    fn test_hex_round_trip() {
        let d = Digest::from_bytes([0x42; 32]);
        let parsed: Digest = d.to_hex().parse().unwrap();
        assert_eq!(parsed, d);
    }

    #[test]
    fn test_rejects_wrong_length() {
        assert!(Digest::from_slice(&[0u8; 31]).is_none());
        assert!(Digest::from_hex("abcd").is_none());
    }
}
