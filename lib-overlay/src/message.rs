//! Overlay messages and their wire frame
//!
//! The frame layout is normative, little-endian, digests raw:
//!
//! `magic(4) | version(1) | flags(1) | ttl(1) | type(1) | src(32) |
//!  dst(32) | length(2) | payload[length]`

use crate::error::OverlayError;
use lib_crypto::{sha256, Digest};

/// Frame magic: "TPOT"
pub const MAGIC: [u8; 4] = *b"TPOT";

/// Overlay protocol version
pub const VERSION: u8 = 1;

/// Maximum payload carried by one overlay message
pub const MAX_PAYLOAD: usize = 4096;

/// TTL cap; bounds amplification on forwarding loops
pub const MAX_TTL: u8 = 16;

/// Fixed header length ahead of the payload
pub const HEADER_SIZE: usize = 4 + 1 + 1 + 1 + 1 + 32 + 32 + 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Node lookup request; forwarders append address hints
    Call = 0x01,
    /// Node lookup response
    CallResponse = 0x02,
    /// DHT value store
    Store = 0x03,
    /// DHT value lookup
    Retrieve = 0x04,
    /// DHT value lookup response
    RetrieveResponse = 0x05,
    /// Tunnel datagram for the secure tunneler
    Tunnel = 0x06,
    /// Liveness probe
    Ping = 0x07,
    /// Liveness reply
    Pong = 0x08,
    /// Candidate nodes for a destination the sender could not reach
    Suggest = 0x09,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x01 => MessageType::Call,
            0x02 => MessageType::CallResponse,
            0x03 => MessageType::Store,
            0x04 => MessageType::Retrieve,
            0x05 => MessageType::RetrieveResponse,
            0x06 => MessageType::Tunnel,
            0x07 => MessageType::Ping,
            0x08 => MessageType::Pong,
            0x09 => MessageType::Suggest,
            _ => return None,
        })
    }
}

/// One overlay message
#[derive(Clone, Debug)]
pub struct Message {
    pub flags: u8,
    pub ttl: u8,
    pub message_type: MessageType,
    pub source: Digest,
    pub destination: Digest,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(
        message_type: MessageType,
        source: Digest,
        destination: Digest,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            flags: 0,
            ttl: MAX_TTL,
            message_type,
            source,
            destination,
            payload,
        }
    }

    /// Serialize to the wire frame
    pub fn encode(&self) -> Result<Vec<u8>, OverlayError> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(OverlayError::InvalidData(format!(
                "payload too large: {} bytes",
                self.payload.len()
            )));
        }
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&MAGIC);
        out.push(VERSION);
        out.push(self.flags);
        out.push(self.ttl);
        out.push(self.message_type as u8);
        out.extend_from_slice(self.source.as_bytes());
        out.extend_from_slice(self.destination.as_bytes());
        out.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Parse a wire frame
    pub fn decode(input: &[u8]) -> Result<Self, OverlayError> {
        if input.len() < HEADER_SIZE {
            return Err(OverlayError::InvalidData("frame too short".into()));
        }
        if input[0..4] != MAGIC {
            return Err(OverlayError::InvalidData("bad magic".into()));
        }
        if input[4] != VERSION {
            return Err(OverlayError::Unsupported(format!("frame version {}", input[4])));
        }
        let flags = input[5];
        let ttl = input[6];
        let message_type = MessageType::from_u8(input[7])
            .ok_or_else(|| OverlayError::InvalidData(format!("unknown type {:#x}", input[7])))?;
        let source = Digest::from_slice(&input[8..40]).expect("fixed 32-byte slice");
        let destination = Digest::from_slice(&input[40..72]).expect("fixed 32-byte slice");
        let length = u16::from_le_bytes([input[72], input[73]]) as usize;
        if length > MAX_PAYLOAD {
            return Err(OverlayError::InvalidData(format!("payload length {length}")));
        }
        if input.len() != HEADER_SIZE + length {
            return Err(OverlayError::InvalidData("frame length mismatch".into()));
        }
        Ok(Self {
            flags,
            ttl,
            message_type,
            source,
            destination,
            payload: input[HEADER_SIZE..].to_vec(),
        })
    }

    /// Identity of the message for duplicate suppression. Excludes the
    /// TTL so a forwarded copy still matches.
    pub fn dedup_digest(&self) -> Digest {
        let mut bytes = Vec::with_capacity(66 + self.payload.len());
        bytes.push(self.message_type as u8);
        bytes.extend_from_slice(self.source.as_bytes());
        bytes.extend_from_slice(self.destination.as_bytes());
        bytes.extend_from_slice(&self.payload);
        sha256(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Message {
        Message::new(
            MessageType::Store,
            sha256(b"src"),
            sha256(b"dst"),
            b"some payload".to_vec(),
        )
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let message = sample();
        let frame = message.encode().unwrap();
        let decoded = Message::decode(&frame).unwrap();
        assert_eq!(decoded.message_type, message.message_type);
        assert_eq!(decoded.source, message.source);
        assert_eq!(decoded.destination, message.destination);
        assert_eq!(decoded.ttl, MAX_TTL);
        assert_eq!(decoded.payload, message.payload);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut frame = sample().encode().unwrap();
        frame[0] = b'X';
        assert!(matches!(
            Message::decode(&frame),
            Err(OverlayError::InvalidData(_))
        ));
    }

    #[test]
    fn test_bad_version_rejected() {
        let mut frame = sample().encode().unwrap();
        frame[4] = 9;
        assert!(matches!(
            Message::decode(&frame),
            Err(OverlayError::Unsupported(_))
        ));
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let mut frame = sample().encode().unwrap();
        frame.push(0);
        assert!(Message::decode(&frame).is_err());
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let mut message = sample();
        message.payload = vec![0u8; MAX_PAYLOAD + 1];
        assert!(message.encode().is_err());
    }

    #[test]
    fn test_dedup_ignores_ttl() {
        let message = sample();
        let mut forwarded = message.clone();
        forwarded.ttl -= 1;
        assert_eq!(message.dedup_digest(), forwarded.dedup_digest());
    }
}
