//! Datagram AEAD cipher with replay protection
//!
//! Frames are ChaCha20-Poly1305 sealed with an explicit 64-bit sequence
//! number: `seq(8 LE) | ciphertext | tag(16)`. The receive side keeps a
//! 64-entry sliding window over sequence numbers and rejects anything
//! replayed or older than the window.

use crate::error::CryptoError;
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use zeroize::Zeroizing;

/// AEAD tag length in bytes
pub const TAG_SIZE: usize = 16;

/// Sequence prefix length in bytes
pub const SEQ_SIZE: usize = 8;

/// Replay window width in sequence numbers
const WINDOW: u64 = 64;

fn nonce_for(seq: u64) -> Nonce {
    let mut bytes = [0u8; 12];
    bytes[4..].copy_from_slice(&seq.to_le_bytes());
    *Nonce::from_slice(&bytes)
}

/// One direction of an established session
pub struct DatagramCipher {
    cipher: ChaCha20Poly1305,
    send_seq: u64,
    recv_highest: u64,
    recv_window: u64,
}

impl DatagramCipher {
    /// Build from 32 bytes of key material
    pub fn new(key: &[u8; 32]) -> Self {
        let key = Zeroizing::new(*key);
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key.as_ref())),
            send_seq: 0,
            recv_highest: 0,
            recv_window: 0,
        }
    }

    /// Seal a payload into a framed datagram
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let seq = self.send_seq;
        self.send_seq = self
            .send_seq
            .checked_add(1)
            .ok_or_else(|| CryptoError::State("send sequence exhausted".into()))?;

        let ciphertext = self
            .cipher
            .encrypt(&nonce_for(seq), plaintext)
            .map_err(|_| CryptoError::State("encryption failed".into()))?;

        let mut frame = Vec::with_capacity(SEQ_SIZE + ciphertext.len());
        frame.extend_from_slice(&seq.to_le_bytes());
        frame.extend_from_slice(&ciphertext);
        Ok(frame)
    }

    /// Open a framed datagram, enforcing the replay window
    pub fn open(&mut self, frame: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if frame.len() < SEQ_SIZE + TAG_SIZE {
            return Err(CryptoError::InvalidData("frame too short".into()));
        }
        let mut seq_bytes = [0u8; SEQ_SIZE];
        seq_bytes.copy_from_slice(&frame[..SEQ_SIZE]);
        let seq = u64::from_le_bytes(seq_bytes);

        self.check_replay(seq)?;

        let plaintext = self
            .cipher
            .decrypt(&nonce_for(seq), &frame[SEQ_SIZE..])
            .map_err(|_| CryptoError::InvalidData("bad tag".into()))?;

        self.mark_seen(seq);
        Ok(plaintext)
    }

    fn check_replay(&self, seq: u64) -> Result<(), CryptoError> {
        if seq > self.recv_highest {
            return Ok(());
        }
        let delta = self.recv_highest - seq;
        if delta >= WINDOW {
            return Err(CryptoError::InvalidData("sequence too old".into()));
        }
        if self.recv_window & (1u64 << delta) != 0 {
            return Err(CryptoError::InvalidData("sequence replayed".into()));
        }
        Ok(())
    }

    fn mark_seen(&mut self, seq: u64) {
        if seq > self.recv_highest {
            let shift = seq - self.recv_highest;
            self.recv_window = if shift >= WINDOW {
                0
            } else {
                self.recv_window << shift
            };
            self.recv_window |= 1;
            self.recv_highest = seq;
        } else {
            self.recv_window |= 1u64 << (self.recv_highest - seq);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (DatagramCipher, DatagramCipher) {
        let key = [7u8; 32];
        (DatagramCipher::new(&key), DatagramCipher::new(&key))
    }

    #[test]
    fn test_seal_open_round_trip() {
        let (mut tx, mut rx) = pair();
        let frame = tx.seal(b"hello").unwrap();
        assert_eq!(rx.open(&frame).unwrap(), b"hello");
    }

    #[test]
    fn test_replay_rejected() {
        let (mut tx, mut rx) = pair();
        let frame = tx.seal(b"once").unwrap();
        rx.open(&frame).unwrap();
        assert!(rx.open(&frame).is_err());
    }

    #[test]
    fn test_out_of_order_within_window() {
        let (mut tx, mut rx) = pair();
        let first = tx.seal(b"first").unwrap();
        let second = tx.seal(b"second").unwrap();
        assert_eq!(rx.open(&second).unwrap(), b"second");
        assert_eq!(rx.open(&first).unwrap(), b"first");
        assert!(rx.open(&first).is_err());
    }

    #[test]
    fn test_tampering_rejected() {
        let (mut tx, mut rx) = pair();
        let mut frame = tx.seal(b"payload").unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        assert!(rx.open(&frame).is_err());
    }

    #[test]
    fn test_too_old_rejected() {
        let (mut tx, mut rx) = pair();
        let old = tx.seal(b"old").unwrap();
        for _ in 0..70 {
            let f = tx.seal(b"fill").unwrap();
            rx.open(&f).unwrap();
        }
        assert!(rx.open(&old).is_err());
    }
}
