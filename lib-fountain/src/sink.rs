//! Stream sink
//!
//! Accumulates combinations over the sliding coding window and yields
//! the decoded byte stream in order. The decoded prefix is what the
//! link reports back as its `seen` counter; the sender slides its
//! window on it.

use crate::combination::{unpack_symbol, Combination};
use crate::matrix::Eliminator;
use crate::{FountainError, STREAM_WINDOW};
use std::collections::VecDeque;

pub struct Sink {
    symbol_size: usize,
    window: usize,
    /// Columns cover absolute symbols [next_decoded, next_decoded + window)
    matrix: Eliminator,
    /// Decoded prefix: symbols below this are recovered
    next_decoded: u64,
    /// Recently decoded vectors, for cancelling known components
    history: VecDeque<Vec<u8>>,
    /// Combinations received, useful or not
    received: u64,
    /// Decoded byte stream awaiting the reader
    output: VecDeque<u8>,
}

impl Sink {
    pub fn new(symbol_size: usize) -> Self {
        Self::with_window(symbol_size, STREAM_WINDOW)
    }

    pub fn with_window(symbol_size: usize, window: usize) -> Self {
        assert!(symbol_size > 0 && window > 0);
        Self {
            symbol_size,
            window,
            matrix: Eliminator::new(window),
            next_decoded: 0,
            history: VecDeque::new(),
            received: 0,
            output: VecDeque::new(),
        }
    }

    /// The decoded prefix, reported to the peer as `seen`
    pub fn seen(&self) -> u64 {
        self.next_decoded
    }

    /// Total combinations received
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Feed one combination; decoded bytes become readable
    pub fn push(&mut self, combination: Combination) -> Result<(), FountainError> {
        self.received += 1;

        let vector_len = self.symbol_size + 2;
        if combination.data.len() != vector_len {
            return Err(FountainError::InvalidData(format!(
                "vector length {} != {vector_len}",
                combination.data.len()
            )));
        }

        let last = combination.last();
        if last < self.next_decoded {
            return Ok(()); // everything already known
        }
        let window_end = self.next_decoded + self.window as u64;
        if last >= window_end {
            return Err(FountainError::InvalidData(format!(
                "component {last} beyond window end {window_end}"
            )));
        }

        let coefficients = combination.coefficients();
        let mut data = combination.data;

        // Cancel components already decoded
        for (i, &coefficient) in coefficients.iter().enumerate() {
            let index = combination.first + i as u64;
            if index < self.next_decoded {
                if coefficient == 0 {
                    continue;
                }
                let age = (self.next_decoded - 1 - index) as usize;
                let Some(known) = self.history.get(self.history.len().checked_sub(age + 1).ok_or_else(|| {
                    FountainError::InvalidData("component older than history".into())
                })?) else {
                    return Err(FountainError::InvalidData(
                        "component older than history".into(),
                    ));
                };
                crate::gf256::mul_add_assign(&mut data, known, coefficient);
            }
        }

        // Window-relative coefficient vector
        let mut window_coeffs = vec![0u8; self.window];
        for (i, &coefficient) in coefficients.iter().enumerate() {
            let index = combination.first + i as u64;
            if index >= self.next_decoded {
                window_coeffs[(index - self.next_decoded) as usize] = coefficient;
            }
        }

        self.matrix.insert(window_coeffs, data);
        self.advance();
        Ok(())
    }

    fn advance(&mut self) {
        while let Some(vector) = self.matrix.decoded(0).map(|d| d.to_vec()) {
            if let Ok(chunk) = unpack_symbol(&vector) {
                self.output.extend(chunk);
            }
            self.matrix.remove_column(0);
            self.matrix.grow(self.window);
            self.history.push_back(vector);
            while self.history.len() > self.window {
                self.history.pop_front();
            }
            self.next_decoded += 1;
        }
    }

    /// Drain the decoded byte stream
    pub fn read(&mut self) -> Vec<u8> {
        self.output.drain(..).collect()
    }

    pub fn readable(&self) -> usize {
        self.output.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Source;
    use rand::prelude::*;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn test_lossless_round_trip() {
        let mut source = Source::with_window(4, 8);
        let mut sink = Sink::with_window(4, 8);
        let mut rng = rng();

        source.write(b"hello fountain stream");
        source.flush();
        let mut out = Vec::new();
        while let Some(combination) = source.emit(&mut rng) {
            sink.push(combination).unwrap();
            out.extend(sink.read());
            source.acknowledge(sink.seen());
        }
        assert_eq!(out, b"hello fountain stream");
        assert_eq!(sink.seen(), 6);
    }

    #[test]
    fn test_loss_recovered_by_repair() {
        let mut source = Source::with_window(4, 8);
        let mut sink = Sink::with_window(4, 8);
        let mut rng = rng();

        source.write(b"abcdefgh"); // two symbols
        // Lose the first systematic symbol
        let _lost = source.emit(&mut rng).unwrap();
        sink.push(source.emit(&mut rng).unwrap()).unwrap();
        assert_eq!(sink.seen(), 0);

        // One repair combination replaces the loss
        sink.push(source.repair(&mut rng).unwrap()).unwrap();
        assert_eq!(sink.seen(), 2);
        assert_eq!(sink.read(), b"abcdefgh");
    }

    #[test]
    fn test_acknowledged_flow_continues() {
        let mut source = Source::with_window(2, 4);
        let mut sink = Sink::with_window(2, 4);
        let mut rng = rng();

        let payload: Vec<u8> = (0u8..=99).collect();
        source.write(&payload);
        source.flush();

        let mut out = Vec::new();
        loop {
            match source.emit(&mut rng) {
                Some(combination) => {
                    sink.push(combination).unwrap();
                    out.extend(sink.read());
                    source.acknowledge(sink.seen());
                }
                None => break,
            }
        }
        assert_eq!(out, payload);
    }

    #[test]
    fn test_duplicate_combinations_harmless() {
        let mut source = Source::with_window(4, 8);
        let mut sink = Sink::with_window(4, 8);
        let mut rng = rng();

        source.write(b"abcd");
        let combination = source.emit(&mut rng).unwrap();
        sink.push(combination.clone()).unwrap();
        sink.push(combination).unwrap();
        assert_eq!(sink.seen(), 1);
        assert_eq!(sink.read(), b"abcd");
        assert_eq!(sink.received(), 2);
    }

    #[test]
    fn test_out_of_window_rejected() {
        let mut sink = Sink::with_window(4, 4);
        let vector = crate::combination::pack_symbol(b"zzzz", 4);
        let combination = Combination::systematic(10, vector);
        assert!(sink.push(combination).is_err());
    }
}
