//! DHT value storage and lookup payloads
//!
//! Keys are digests (block digests or contact identifiers); each key
//! maps to a bounded set of values with per-value expiry. The payload
//! codecs here are shared by the store, retrieve and call message
//! handlers in the node pipeline.

use crate::address::NodeAddr;
use crate::error::OverlayError;
use lib_crypto::Digest;
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Values kept per key; oldest evicted beyond this
pub const MAX_VALUES_PER_KEY: usize = 8;

/// Default value lifetime
pub const VALUE_TTL: Duration = Duration::from_secs(3600);

/// Nodes replicated to on store, and returned in lookup responses
pub const REPLICATION: usize = 16;

/// Parallel queries per lookup round (the Kademlia alpha)
pub const LOOKUP_ALPHA: usize = 3;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

struct StoredValue {
    value: Vec<u8>,
    expires: u64,
}

/// Bounded in-memory value store
#[derive(Default)]
pub struct ValueStore {
    entries: HashMap<Digest, Vec<StoredValue>>,
}

impl ValueStore {
    pub fn new() -> Self {
        Self { entries: HashMap::new() }
    }

    /// Insert a value; duplicates refresh their expiry, overflow evicts
    /// the oldest value for the key
    pub fn insert(&mut self, key: Digest, value: Vec<u8>) {
        let expires = now_secs() + VALUE_TTL.as_secs();
        let values = self.entries.entry(key).or_default();
        if let Some(existing) = values.iter_mut().find(|v| v.value == value) {
            existing.expires = expires;
            return;
        }
        if values.len() >= MAX_VALUES_PER_KEY {
            values.remove(0);
        }
        values.push(StoredValue { value, expires });
    }

    /// All live values for a key, in arrival order
    pub fn get(&self, key: &Digest) -> Vec<Vec<u8>> {
        let now = now_secs();
        self.entries
            .get(key)
            .map(|values| {
                values
                    .iter()
                    .filter(|v| v.expires > now)
                    .map(|v| v.value.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop expired values and empty keys
    pub fn cleanup(&mut self) {
        let now = now_secs();
        self.entries.retain(|_, values| {
            values.retain(|v| v.expires > now);
            !values.is_empty()
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A node with its transport addresses, as carried in lookup responses
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    pub node: Digest,
    pub addresses: Vec<NodeAddr>,
}

impl NodeInfo {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.node.as_bytes());
        out.push(self.addresses.len().min(4) as u8);
        for addr in self.addresses.iter().take(4) {
            addr.encode(out);
        }
    }

    fn decode(input: &[u8]) -> Option<(Self, usize)> {
        if input.len() < 33 {
            return None;
        }
        let node = Digest::from_slice(&input[..32])?;
        let count = input[32] as usize;
        let mut offset = 33;
        let mut addresses = Vec::with_capacity(count);
        for _ in 0..count {
            let (addr, used) = NodeAddr::decode(&input[offset..])?;
            addresses.push(addr);
            offset += used;
        }
        Some((NodeInfo { node, addresses }, offset))
    }
}

fn encode_nodes(nodes: &[NodeInfo], out: &mut Vec<u8>) {
    out.push(nodes.len().min(REPLICATION) as u8);
    for node in nodes.iter().take(REPLICATION) {
        node.encode(out);
    }
}

fn decode_nodes(input: &[u8]) -> Option<(Vec<NodeInfo>, usize)> {
    let count = *input.first()? as usize;
    let mut offset = 1;
    let mut nodes = Vec::with_capacity(count);
    for _ in 0..count {
        let (node, used) = NodeInfo::decode(&input[offset..])?;
        nodes.push(node);
        offset += used;
    }
    Some((nodes, offset))
}

/// STORE payload: `key(32) | value_len(2) | value`
pub fn encode_store(key: &Digest, value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(34 + value.len());
    out.extend_from_slice(key.as_bytes());
    out.extend_from_slice(&(value.len() as u16).to_le_bytes());
    out.extend_from_slice(value);
    out
}

pub fn decode_store(payload: &[u8]) -> Result<(Digest, Vec<u8>), OverlayError> {
    if payload.len() < 34 {
        return Err(OverlayError::InvalidData("store payload too short".into()));
    }
    let key = Digest::from_slice(&payload[..32]).expect("fixed 32-byte slice");
    let len = u16::from_le_bytes([payload[32], payload[33]]) as usize;
    if payload.len() != 34 + len {
        return Err(OverlayError::InvalidData("store payload length mismatch".into()));
    }
    Ok((key, payload[34..].to_vec()))
}

/// RETRIEVE payload: `key(32)`
pub fn encode_retrieve(key: &Digest) -> Vec<u8> {
    key.to_vec()
}

pub fn decode_retrieve(payload: &[u8]) -> Result<Digest, OverlayError> {
    Digest::from_slice(payload)
        .ok_or_else(|| OverlayError::InvalidData("retrieve payload must be a digest".into()))
}

/// RETRIEVE-RESPONSE payload:
/// `key(32) | value_count(1) | [len(2) value]* | nodes`
pub fn encode_retrieve_response(key: &Digest, values: &[Vec<u8>], nodes: &[NodeInfo]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(key.as_bytes());
    out.push(values.len().min(MAX_VALUES_PER_KEY) as u8);
    for value in values.iter().take(MAX_VALUES_PER_KEY) {
        out.extend_from_slice(&(value.len() as u16).to_le_bytes());
        out.extend_from_slice(value);
    }
    encode_nodes(nodes, &mut out);
    out
}

pub fn decode_retrieve_response(
    payload: &[u8],
) -> Result<(Digest, Vec<Vec<u8>>, Vec<NodeInfo>), OverlayError> {
    let bad = || OverlayError::InvalidData("malformed retrieve response".into());
    if payload.len() < 33 {
        return Err(bad());
    }
    let key = Digest::from_slice(&payload[..32]).expect("fixed 32-byte slice");
    let value_count = payload[32] as usize;
    let mut offset = 33;
    let mut values = Vec::with_capacity(value_count);
    for _ in 0..value_count {
        if payload.len() < offset + 2 {
            return Err(bad());
        }
        let len = u16::from_le_bytes([payload[offset], payload[offset + 1]]) as usize;
        offset += 2;
        if payload.len() < offset + len {
            return Err(bad());
        }
        values.push(payload[offset..offset + len].to_vec());
        offset += len;
    }
    let (nodes, _) = decode_nodes(&payload[offset..]).ok_or_else(bad)?;
    Ok((key, values, nodes))
}

/// CALL payload: `target(32) | hint nodes`; forwarders append hints.
/// CALL-RESPONSE and SUGGEST share the layout.
pub fn encode_call(target: &Digest, hints: &[NodeInfo]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(target.as_bytes());
    encode_nodes(hints, &mut out);
    out
}

pub fn decode_call(payload: &[u8]) -> Result<(Digest, Vec<NodeInfo>), OverlayError> {
    let bad = || OverlayError::InvalidData("malformed call payload".into());
    if payload.len() < 33 {
        return Err(bad());
    }
    let target = Digest::from_slice(&payload[..32]).expect("fixed 32-byte slice");
    let (nodes, _) = decode_nodes(&payload[32..]).ok_or_else(bad)?;
    Ok((target, nodes))
}

/// PING / PONG payload: `nonce(8)`
pub fn encode_ping(nonce: u64) -> Vec<u8> {
    nonce.to_le_bytes().to_vec()
}

pub fn decode_ping(payload: &[u8]) -> Result<u64, OverlayError> {
    let bytes: [u8; 8] = payload
        .try_into()
        .map_err(|_| OverlayError::InvalidData("ping payload must be 8 bytes".into()))?;
    Ok(u64::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_crypto::sha256;

    #[test]
    fn test_value_store_bounds_per_key() {
        let mut store = ValueStore::new();
        let key = sha256(b"key");
        for i in 0..20u8 {
            store.insert(key, vec![i]);
        }
        let values = store.get(&key);
        assert_eq!(values.len(), MAX_VALUES_PER_KEY);
        // Oldest evicted first
        assert_eq!(values[0], vec![12]);
        assert_eq!(values.last().unwrap(), &vec![19]);
    }

    #[test]
    fn test_value_store_dedup() {
        let mut store = ValueStore::new();
        let key = sha256(b"key");
        store.insert(key, b"v".to_vec());
        store.insert(key, b"v".to_vec());
        assert_eq!(store.get(&key).len(), 1);
    }

    #[test]
    fn test_store_payload_round_trip() {
        let key = sha256(b"key");
        let payload = encode_store(&key, b"value");
        let (k, v) = decode_store(&payload).unwrap();
        assert_eq!(k, key);
        assert_eq!(v, b"value");
    }

    #[test]
    fn test_retrieve_response_round_trip() {
        let key = sha256(b"key");
        let values = vec![b"a".to_vec(), b"bb".to_vec()];
        let nodes = vec![NodeInfo {
            node: sha256(b"node"),
            addresses: vec![NodeAddr("127.0.0.1:9000".parse().unwrap())],
        }];
        let payload = encode_retrieve_response(&key, &values, &nodes);
        let (k, v, n) = decode_retrieve_response(&payload).unwrap();
        assert_eq!(k, key);
        assert_eq!(v, values);
        assert_eq!(n, nodes);
    }

    #[test]
    fn test_call_round_trip_empty_hints() {
        let target = sha256(b"target");
        let payload = encode_call(&target, &[]);
        let (t, hints) = decode_call(&payload).unwrap();
        assert_eq!(t, target);
        assert!(hints.is_empty());
    }

    #[test]
    fn test_malformed_payloads_rejected() {
        assert!(decode_store(&[0u8; 10]).is_err());
        assert!(decode_retrieve(&[0u8; 31]).is_err());
        assert!(decode_retrieve_response(&[0u8; 5]).is_err());
        assert!(decode_call(&[0u8; 32]).is_err());
        assert!(decode_ping(&[0u8; 7]).is_err());
    }
}
