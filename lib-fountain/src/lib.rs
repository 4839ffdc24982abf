//! Teapotnet rateless erasure code
//!
//! Both streams of a fountain link (typed records and block pushes) are
//! carried as random linear combinations of fixed-size symbols over
//! GF(256). The sender needs no acknowledgement per packet: any k
//! linearly independent combinations of k source symbols reconstruct
//! them. Coefficients are derived from a 32-bit seed carried with each
//! combination; seed zero marks a plain (systematic) symbol.
//!
//! Symbols embed a two-byte length prefix before padding so short tails
//! survive combination intact.

pub mod block;
pub mod combination;
pub mod gf256;
pub mod matrix;
pub mod sink;
pub mod source;

pub use block::{BlockDecoder, BlockEncoder};
pub use combination::{expand_coefficients, pack_symbol, unpack_symbol, Combination};
pub use sink::Sink;
pub use source::Source;

use thiserror::Error;

/// Coefficient window for the continuous record stream, in symbols.
/// A coded symbol with index b combines components [b+1-W, b] (clamped
/// at zero); the source never lets undecoded symbols fall behind the
/// window.
pub const STREAM_WINDOW: usize = 64;

#[derive(Debug, Error)]
pub enum FountainError {
    #[error("invalid combination: {0}")]
    InvalidData(String),

    #[error("combination seed must be non-zero")]
    ZeroSeed,

    #[error("write stalled: coding window full")]
    WindowFull,
}
