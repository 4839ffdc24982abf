//! Stream source
//!
//! Buffers outgoing bytes as fixed-size symbols and produces
//! combinations: each symbol once systematically, then seeded
//! combinations over the coding window for repair. The window slides on
//! the peer's decoded prefix; symbol creation stalls rather than let an
//! undecoded symbol fall out of the window.

use crate::combination::{pack_symbol, Combination};
use crate::{FountainError, STREAM_WINDOW};
use rand::Rng;
use std::collections::VecDeque;

pub struct Source {
    symbol_size: usize,
    window: usize,
    /// Bytes written but not yet cut into symbols
    staging: VecDeque<u8>,
    /// Packed vectors for symbols [base, base + buffered.len())
    buffered: VecDeque<Vec<u8>>,
    base: u64,
    /// Index of the next symbol to create
    next_index: u64,
    /// Next symbol to emit systematically
    next_systematic: u64,
    /// Peer's decoded prefix
    acked: u64,
    /// Combinations emitted so far (the wire `count`)
    emitted: u64,
}

impl Source {
    pub fn new(symbol_size: usize) -> Self {
        Self::with_window(symbol_size, STREAM_WINDOW)
    }

    pub fn with_window(symbol_size: usize, window: usize) -> Self {
        assert!(symbol_size > 0 && window > 0);
        Self {
            symbol_size,
            window,
            staging: VecDeque::new(),
            buffered: VecDeque::new(),
            base: 0,
            next_index: 0,
            next_systematic: 0,
            acked: 0,
            emitted: 0,
        }
    }

    pub fn symbol_size(&self) -> usize {
        self.symbol_size
    }

    /// Queue outgoing bytes; full symbols are cut eagerly
    pub fn write(&mut self, bytes: &[u8]) {
        self.staging.extend(bytes);
        self.promote(false);
    }

    /// Cut any remaining partial symbol so queued bytes can be emitted
    pub fn flush(&mut self) {
        self.promote(true);
    }

    fn promote(&mut self, include_partial: bool) {
        loop {
            // Never let an undecoded symbol fall behind the window
            if self.next_index - self.acked >= self.window as u64 {
                return;
            }
            let available = self.staging.len();
            if available == 0 {
                return;
            }
            if available < self.symbol_size && !include_partial {
                return;
            }
            let take = available.min(self.symbol_size);
            let chunk: Vec<u8> = self.staging.drain(..take).collect();
            self.buffered.push_back(pack_symbol(&chunk, self.symbol_size));
            self.next_index += 1;
            self.slide();
        }
    }

    fn slide(&mut self) {
        // Retain exactly the last `window` symbols; older ones are
        // outside every future coefficient range
        while self.buffered.len() > self.window {
            self.buffered.pop_front();
            self.base += 1;
        }
    }

    /// Record the peer's decoded prefix
    pub fn acknowledge(&mut self, seen: u64) {
        if seen > self.acked {
            self.acked = seen.min(self.next_index);
            self.promote(false);
        }
    }

    /// Symbols created but not yet sent systematically
    pub fn pending(&self) -> u64 {
        self.next_index - self.next_systematic
    }

    /// True while unacknowledged symbols may still need repair
    pub fn unacked(&self) -> u64 {
        self.next_index - self.acked
    }

    /// Bytes queued (staged or symbolized but unacknowledged)
    pub fn backlog(&self) -> usize {
        self.staging.len() + (self.unacked() as usize) * self.symbol_size
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Produce the next combination: systematic while fresh symbols
    /// remain, otherwise a seeded repair combination over the window.
    /// Returns None when nothing is buffered at all.
    pub fn emit<R: Rng>(&mut self, rng: &mut R) -> Option<Combination> {
        if self.next_systematic < self.next_index {
            let offset = (self.next_systematic - self.base) as usize;
            let vector = self.buffered[offset].clone();
            let combination = Combination::systematic(self.next_systematic, vector);
            self.next_systematic += 1;
            self.emitted += 1;
            return Some(combination);
        }
        self.repair(rng)
    }

    /// A seeded combination over the current window, for repair and
    /// keepalive traffic. None when every symbol has been acknowledged.
    pub fn repair<R: Rng>(&mut self, rng: &mut R) -> Option<Combination> {
        if self.buffered.is_empty() || self.unacked() == 0 {
            return None;
        }
        // The range is fixed by the window rule so the receiver can
        // reconstruct it from the last index alone
        let last = self.next_index - 1;
        let first = last.saturating_sub(self.window as u64 - 1);
        let vectors: Vec<Vec<u8>> = self
            .buffered
            .iter()
            .skip((first - self.base) as usize)
            .cloned()
            .collect();
        let seed = loop {
            let seed: u32 = rng.gen();
            if seed != 0 {
                break seed;
            }
        };
        let combination =
            Combination::combine(first, &vectors, seed).expect("seed is non-zero");
        self.emitted += 1;
        Some(combination)
    }
}
