//! Fountain symbol frames
//!
//! Every datagram on an open link is one symbol frame:
//!
//! `digest(32) | index(4) | seed(4) | size(2) | seen(4) | count(4) |
//!  bytes[size]` (little-endian)
//!
//! A zero digest marks the record stream; a non-zero digest tags a
//! block push. Size zero is a bare keepalive carrying only the
//! counters. The component range of a combination is implicit: seed
//! zero is the single systematic symbol `index`; a seeded record-stream
//! combination covers the window ending at `index`; a seeded block
//! combination covers the whole block `0..=index`.

use lib_crypto::Digest;
use lib_fountain::{Combination, STREAM_WINDOW};
use thiserror::Error;

/// Symbol payload bytes per combination
pub const SYMBOL_SIZE: usize = 1024;

/// Frame header length ahead of the symbol bytes
pub const SYMBOL_HEADER: usize = 32 + 4 + 4 + 2 + 4 + 4;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed symbol frame: {0}")]
    Malformed(String),
}

/// One parsed symbol frame
#[derive(Clone, Debug)]
pub struct SymbolFrame {
    /// Zero for the record stream, block digest for a push
    pub digest: Digest,
    /// Last (highest) component index of the combination
    pub index: u32,
    /// Coefficient seed; zero means systematic
    pub seed: u32,
    /// Receiver-side counters piggybacked by the sender
    pub seen: u32,
    pub count: u32,
    /// The combined symbol vector; empty for keepalives
    pub data: Vec<u8>,
}

impl SymbolFrame {
    /// A bare keepalive carrying only the counters
    pub fn keepalive(seen: u32, count: u32) -> Self {
        Self {
            digest: Digest::ZERO,
            index: 0,
            seed: 0,
            seen,
            count,
            data: Vec::new(),
        }
    }

    pub fn is_keepalive(&self) -> bool {
        self.data.is_empty()
    }

    /// Frame a combination of the given stream
    pub fn from_combination(
        digest: Digest,
        combination: &Combination,
        seen: u32,
        count: u32,
    ) -> Self {
        Self {
            digest,
            index: combination.last() as u32,
            seed: combination.seed,
            seen,
            count,
            data: combination.data.clone(),
        }
    }

    /// Reconstruct the combination; the component range follows from
    /// the digest and seed as described in the module docs
    pub fn to_combination(&self) -> Option<Combination> {
        if self.is_keepalive() {
            return None;
        }
        let last = self.index as u64;
        let (first, count) = if self.seed == 0 {
            (last, 1)
        } else if self.digest.is_zero() {
            let first = last.saturating_sub(STREAM_WINDOW as u64 - 1);
            (first, (last - first + 1) as usize)
        } else {
            (0, self.index as usize + 1)
        };
        Some(Combination {
            first,
            count,
            seed: self.seed,
            data: self.data.clone(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SYMBOL_HEADER + self.data.len());
        out.extend_from_slice(self.digest.as_bytes());
        out.extend_from_slice(&self.index.to_le_bytes());
        out.extend_from_slice(&self.seed.to_le_bytes());
        out.extend_from_slice(&(self.data.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.seen.to_le_bytes());
        out.extend_from_slice(&self.count.to_le_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    pub fn decode(input: &[u8]) -> Result<Self, WireError> {
        if input.len() < SYMBOL_HEADER {
            return Err(WireError::Malformed("frame too short".into()));
        }
        let digest = Digest::from_slice(&input[..32]).expect("fixed 32-byte slice");
        let index = u32::from_le_bytes(input[32..36].try_into().expect("fixed slice"));
        let seed = u32::from_le_bytes(input[36..40].try_into().expect("fixed slice"));
        let size = u16::from_le_bytes(input[40..42].try_into().expect("fixed slice")) as usize;
        let seen = u32::from_le_bytes(input[42..46].try_into().expect("fixed slice"));
        let count = u32::from_le_bytes(input[46..50].try_into().expect("fixed slice"));
        if input.len() != SYMBOL_HEADER + size {
            return Err(WireError::Malformed("frame length mismatch".into()));
        }
        Ok(Self {
            digest,
            index,
            seed,
            seen,
            count,
            data: input[SYMBOL_HEADER..].to_vec(),
        })
    }
}

/// Reconciles a wrapping 32-bit wire counter into a monotonic u64
#[derive(Default)]
pub struct Counter64 {
    last_wire: u32,
    value: u64,
}

impl Counter64 {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in a wire sample; wraps are handled modularly
    pub fn update(&mut self, wire: u32) -> u64 {
        let delta = wire.wrapping_sub(self.last_wire);
        // Anything that looks like a backwards step is reordering noise
        if delta < u32::MAX / 2 {
            self.value += delta as u64;
            self.last_wire = wire;
        }
        self.value
    }

    pub fn value(&self) -> u64 {
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_crypto::sha256;
    use lib_fountain::combination::pack_symbol;

    #[test]
    fn test_frame_round_trip() {
        let vector = pack_symbol(b"symbol", SYMBOL_SIZE);
        let combination = Combination::systematic(5, vector);
        let frame = SymbolFrame::from_combination(sha256(b"block"), &combination, 7, 9);
        let decoded = SymbolFrame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded.digest, sha256(b"block"));
        assert_eq!(decoded.index, 5);
        assert_eq!(decoded.seed, 0);
        assert_eq!(decoded.seen, 7);
        assert_eq!(decoded.count, 9);
        let back = decoded.to_combination().unwrap();
        assert_eq!(back.first, 5);
        assert_eq!(back.count, 1);
    }

    #[test]
    fn test_stream_range_reconstruction() {
        let combination = Combination {
            first: 100,
            count: STREAM_WINDOW,
            seed: 42,
            data: pack_symbol(b"x", SYMBOL_SIZE),
        };
        let frame = SymbolFrame::from_combination(Digest::ZERO, &combination, 0, 0);
        let back = SymbolFrame::decode(&frame.encode())
            .unwrap()
            .to_combination()
            .unwrap();
        assert_eq!(back.first, 100);
        assert_eq!(back.count, STREAM_WINDOW);
    }

    #[test]
    fn test_block_range_reconstruction() {
        let combination = Combination {
            first: 0,
            count: 12,
            seed: 9,
            data: pack_symbol(b"y", SYMBOL_SIZE),
        };
        let frame = SymbolFrame::from_combination(sha256(b"b"), &combination, 0, 0);
        let back = SymbolFrame::decode(&frame.encode())
            .unwrap()
            .to_combination()
            .unwrap();
        assert_eq!(back.first, 0);
        assert_eq!(back.count, 12);
    }

    #[test]
    fn test_keepalive() {
        let frame = SymbolFrame::keepalive(11, 13);
        let decoded = SymbolFrame::decode(&frame.encode()).unwrap();
        assert!(decoded.is_keepalive());
        assert!(decoded.to_combination().is_none());
        assert_eq!(decoded.seen, 11);
        assert_eq!(decoded.count, 13);
    }

    #[test]
    fn test_counter_wrap() {
        let mut counter = Counter64::new();
        counter.update(2_000_000_000);
        counter.update(4_000_000_000);
        assert_eq!(counter.value(), 4_000_000_000);
        // The wire wraps past zero; the 64-bit value keeps growing
        counter.update(100);
        assert_eq!(counter.value(), 4_294_967_296 + 100);
    }

    #[test]
    fn test_counter_ignores_reordered_samples() {
        let mut counter = Counter64::new();
        counter.update(1000);
        counter.update(900); // stale frame
        assert_eq!(counter.value(), 1000);
        counter.update(1100);
        assert_eq!(counter.value(), 1100);
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let frame = SymbolFrame::keepalive(0, 0).encode();
        assert!(SymbolFrame::decode(&frame[..frame.len() - 1]).is_err());
    }
}
