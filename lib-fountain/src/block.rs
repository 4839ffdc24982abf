//! Per-block coding
//!
//! A block push codes the block's symbols independently of the record
//! stream: k source symbols, emitted systematically and then as seeded
//! combinations over the whole block, `ceil(k * (1 + redundancy))`
//! emissions in total. The decoder completes at rank k; the link layer
//! verifies the digest of the assembled bytes before storing.

use crate::combination::{pack_symbol, unpack_symbol, Combination};
use crate::matrix::Eliminator;
use crate::FountainError;
use rand::Rng;

/// Default redundancy factor on block pushes
pub const DEFAULT_REDUNDANCY: f64 = 0.15;

pub struct BlockEncoder {
    symbol_size: usize,
    vectors: Vec<Vec<u8>>,
    next_systematic: usize,
    emitted: usize,
    planned: usize,
}

impl BlockEncoder {
    /// Cut a block into symbols; `redundancy` scales the emission budget
    pub fn new(data: &[u8], symbol_size: usize, redundancy: f64) -> Self {
        assert!(symbol_size > 0);
        let mut vectors: Vec<Vec<u8>> = data
            .chunks(symbol_size)
            .map(|chunk| pack_symbol(chunk, symbol_size))
            .collect();
        if vectors.is_empty() {
            // An empty block still needs one symbol to carry its length
            vectors.push(pack_symbol(b"", symbol_size));
        }
        let k = vectors.len();
        let planned = ((k as f64) * (1.0 + redundancy.max(0.0))).ceil() as usize;
        Self {
            symbol_size,
            vectors,
            next_systematic: 0,
            emitted: 0,
            planned: planned.max(k + 1),
        }
    }

    /// Source symbol count k
    pub fn symbol_count(&self) -> usize {
        self.vectors.len()
    }

    /// Emissions the redundancy budget allows
    pub fn planned(&self) -> usize {
        self.planned
    }

    pub fn remaining(&self) -> usize {
        self.planned.saturating_sub(self.emitted)
    }

    pub fn is_exhausted(&self) -> bool {
        self.emitted >= self.planned
    }

    /// Next combination: every symbol once, then seeded combinations
    /// over the full block
    pub fn emit<R: Rng>(&mut self, rng: &mut R) -> Combination {
        self.emitted += 1;
        if self.next_systematic < self.vectors.len() {
            let index = self.next_systematic;
            self.next_systematic += 1;
            return Combination::systematic(index as u64, self.vectors[index].clone());
        }
        let seed = loop {
            let seed: u32 = rng.gen();
            if seed != 0 {
                break seed;
            }
        };
        Combination::combine(0, &self.vectors, seed).expect("seed is non-zero")
    }

    pub fn symbol_size(&self) -> usize {
        self.symbol_size
    }
}

pub struct BlockDecoder {
    symbol_size: usize,
    matrix: Eliminator,
    /// Known symbol count, learned from the first full-range combination
    k: Option<usize>,
    received: u64,
}

impl BlockDecoder {
    pub fn new(symbol_size: usize) -> Self {
        Self {
            symbol_size,
            matrix: Eliminator::new(0),
            k: None,
            received: 0,
        }
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn rank(&self) -> usize {
        self.matrix.rank()
    }

    /// Feed one combination of this block's symbols
    pub fn push(&mut self, combination: Combination) -> Result<(), FountainError> {
        self.received += 1;

        let vector_len = self.symbol_size + 2;
        if combination.data.len() != vector_len {
            return Err(FountainError::InvalidData(format!(
                "vector length {} != {vector_len}",
                combination.data.len()
            )));
        }

        let cols_needed = (combination.last() + 1) as usize;
        if !combination.is_systematic() {
            // Coded combinations cover the whole block, fixing k
            match self.k {
                None => self.k = Some(cols_needed),
                Some(k) if k != cols_needed => {
                    return Err(FountainError::InvalidData(format!(
                        "conflicting symbol counts {k} and {cols_needed}"
                    )));
                }
                Some(_) => {}
            }
        }
        if cols_needed > self.matrix.cols() {
            self.matrix.grow(cols_needed);
        }

        let coefficients = combination.coefficients();
        let mut coeffs = vec![0u8; self.matrix.cols()];
        for (i, &coefficient) in coefficients.iter().enumerate() {
            coeffs[combination.first as usize + i] = coefficient;
        }
        self.matrix.insert(coeffs, combination.data);
        Ok(())
    }

    /// True once k is known and the matrix reached full rank
    pub fn is_complete(&self) -> bool {
        matches!(self.k, Some(k) if self.matrix.rank() >= k && self.matrix.cols() >= k)
    }

    /// The contiguous decoded prefix as bytes. With k known and rank
    /// full this is the whole block; otherwise the caller may still
    /// digest-check the prefix to detect completion early.
    pub fn assemble(&self) -> Option<Vec<u8>> {
        let mut out = Vec::new();
        let limit = self.k.unwrap_or(self.matrix.cols());
        for col in 0..limit {
            let vector = self.matrix.decoded(col)?;
            let chunk = unpack_symbol(vector).ok()?;
            out.extend_from_slice(chunk);
        }
        Some(out)
    }
}

/// Convenience for tests and the pusher: emitted-count for a block
pub fn planned_emissions(len: usize, symbol_size: usize, redundancy: f64) -> usize {
    let k = len.div_ceil(symbol_size).max(1);
    (((k as f64) * (1.0 + redundancy.max(0.0))).ceil() as usize).max(k + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    fn rng(seed: u64) -> StdRng {
        StdRng::seed_from_u64(seed)
    }

    #[test]
    fn test_lossless_block_round_trip() {
        let data: Vec<u8> = (0..1000u16).map(|i| (i % 251) as u8).collect();
        let mut encoder = BlockEncoder::new(&data, 64, 0.15);
        let mut decoder = BlockDecoder::new(64);
        let mut rng = rng(1);

        while !encoder.is_exhausted() && !decoder.is_complete() {
            decoder.push(encoder.emit(&mut rng)).unwrap();
        }
        assert!(decoder.is_complete());
        assert_eq!(decoder.assemble().unwrap(), data);
    }

    #[test]
    fn test_empty_block() {
        let mut encoder = BlockEncoder::new(b"", 64, 0.15);
        assert_eq!(encoder.symbol_count(), 1);
        let mut decoder = BlockDecoder::new(64);
        let mut rng = rng(2);
        while !decoder.is_complete() && !encoder.is_exhausted() {
            decoder.push(encoder.emit(&mut rng)).unwrap();
        }
        assert!(decoder.is_complete());
        assert_eq!(decoder.assemble().unwrap(), b"");
    }

    #[test]
    fn test_decode_from_coded_only() {
        // Drop all systematic symbols; seeded combinations alone decode
        let data = vec![0xA5u8; 300];
        let mut encoder = BlockEncoder::new(&data, 32, 4.0);
        let mut decoder = BlockDecoder::new(32);
        let mut rng = rng(3);

        let k = encoder.symbol_count();
        for _ in 0..k {
            let _ = encoder.emit(&mut rng); // systematic, lost
        }
        while !decoder.is_complete() && !encoder.is_exhausted() {
            decoder.push(encoder.emit(&mut rng)).unwrap();
        }
        assert!(decoder.is_complete());
        assert_eq!(decoder.assemble().unwrap(), data);
    }

    fn drop_channel_sweep(k: usize, runs: u64, drop_rate: f64) -> u64 {
        let symbol_size = 8;
        let data: Vec<u8> = (0..k * symbol_size).map(|i| (i * 31 % 256) as u8).collect();
        let mut successes = 0;
        for run in 0..runs {
            let mut encoder = BlockEncoder::new(&data, symbol_size, 0.25);
            assert_eq!(encoder.symbol_count(), k);
            let mut decoder = BlockDecoder::new(symbol_size);
            let mut encode_rng = rng(run);
            let mut drop_rng = rng(10_000 + run);

            // Rateless: the sender keeps emitting past the proactive
            // budget until the block decodes
            let mut emissions = 0usize;
            while !decoder.is_complete() {
                emissions += 1;
                assert!(emissions < 3 * k, "run {run} failed to converge");
                let combination = encoder.emit(&mut encode_rng);
                if drop_rng.gen::<f64>() < drop_rate {
                    continue; // dropped by the channel
                }
                decoder.push(combination).unwrap();
            }
            if decoder.assemble().as_deref() == Some(&data[..]) {
                successes += 1;
            }
        }
        successes
    }

    #[test]
    fn test_rateless_under_drop() {
        let successes = drop_channel_sweep(100, 100, 0.20);
        assert_eq!(successes, 100, "only {successes}/100 runs decoded");
    }

    #[test]
    #[ignore = "soak test, several minutes"]
    fn test_rateless_under_drop_full_scale() {
        // k = 1000 symbols, 20% drop, 100 runs, every run must decode
        let successes = drop_channel_sweep(1000, 100, 0.20);
        assert_eq!(successes, 100, "only {successes}/100 runs decoded");
    }

    #[test]
    fn test_planned_emissions() {
        assert_eq!(planned_emissions(0, 64, 0.15), 2);
        assert_eq!(planned_emissions(64, 64, 0.15), 2);
        assert_eq!(planned_emissions(6400, 64, 0.15), 115);
    }
}
