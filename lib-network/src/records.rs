//! Typed records on the fountain link
//!
//! Records are (type, payload) pairs framed inside the decoded record
//! stream as `type_len(1) | type | payload_len(4 LE) | payload`. The
//! control records of the pub/sub plane carry JSON payloads; unknown
//! types are handed to registered listeners untouched.

use lib_crypto::Digest;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Control record type names
pub const TYPE_PUBLISH: &str = "publish";
pub const TYPE_TARGET: &str = "target";
pub const TYPE_ISSUE: &str = "issue";
pub const TYPE_CALL: &str = "call";

/// Hard cap on one record payload
pub const MAX_RECORD_PAYLOAD: usize = 1 << 20;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("record type too long")]
    TypeTooLong,
    #[error("record payload too large: {0}")]
    PayloadTooLarge(usize),
}

/// Interest in a prefix, asking the peer to announce matching targets
#[derive(Serialize, Deserialize, Debug)]
pub struct PublishRecord {
    pub path: String,
}

/// Announcement of targets under a published path
#[derive(Serialize, Deserialize, Debug)]
pub struct TargetRecord {
    pub path: String,
    /// Hex block digests
    pub targets: Vec<String>,
}

impl TargetRecord {
    pub fn new(path: &str, targets: &[Digest]) -> Self {
        Self {
            path: path.to_string(),
            targets: targets.iter().map(|d| d.to_hex()).collect(),
        }
    }

    pub fn digests(&self) -> Vec<Digest> {
        self.targets
            .iter()
            .filter_map(|hex| Digest::from_hex(hex))
            .collect()
    }
}

/// Unsolicited application payload pushed under a prefix
#[derive(Serialize, Deserialize, Debug)]
pub struct IssueRecord {
    pub path: String,
    pub payload: serde_json::Value,
}

/// Request that the peer push a block over this link
#[derive(Serialize, Deserialize, Debug)]
pub struct CallRecord {
    /// Hex digest of the wanted block
    pub target: String,
    /// Redundancy tokens for the push
    pub tokens: u32,
}

impl CallRecord {
    pub fn new(target: &Digest, tokens: u32) -> Self {
        Self { target: target.to_hex(), tokens }
    }

    pub fn digest(&self) -> Option<Digest> {
        Digest::from_hex(&self.target)
    }
}

/// Frame one record into the outgoing stream
pub fn encode_record(record_type: &str, payload: &[u8]) -> Result<Vec<u8>, RecordError> {
    let type_bytes = record_type.as_bytes();
    if type_bytes.len() > u8::MAX as usize {
        return Err(RecordError::TypeTooLong);
    }
    if payload.len() > MAX_RECORD_PAYLOAD {
        return Err(RecordError::PayloadTooLarge(payload.len()));
    }
    let mut out = Vec::with_capacity(1 + type_bytes.len() + 4 + payload.len());
    out.push(type_bytes.len() as u8);
    out.extend_from_slice(type_bytes);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Incremental parser over the decoded record stream
#[derive(Default)]
pub struct RecordParser {
    buffer: Vec<u8>,
}

impl RecordParser {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Pop the next complete record, if any. A stream whose declared
    /// payload length exceeds the cap is unrecoverable and is flagged.
    pub fn next(&mut self) -> Result<Option<(String, Vec<u8>)>, RecordError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        let type_len = self.buffer[0] as usize;
        let header = 1 + type_len + 4;
        if self.buffer.len() < header {
            return Ok(None);
        }
        let payload_len = u32::from_le_bytes([
            self.buffer[1 + type_len],
            self.buffer[2 + type_len],
            self.buffer[3 + type_len],
            self.buffer[4 + type_len],
        ]) as usize;
        if payload_len > MAX_RECORD_PAYLOAD {
            return Err(RecordError::PayloadTooLarge(payload_len));
        }
        if self.buffer.len() < header + payload_len {
            return Ok(None);
        }
        let record_type = String::from_utf8_lossy(&self.buffer[1..1 + type_len]).into_owned();
        let payload = self.buffer[header..header + payload_len].to_vec();
        self.buffer.drain(..header + payload_len);
        Ok(Some((record_type, payload)))
    }
}
