//! Kademlia-style routing table
//!
//! Nodes are kept in 256 buckets indexed by the length of the common
//! prefix with the local identifier (equivalently, by XOR distance).
//! Each bucket holds at most K entries. The table never contains the
//! local node. Ties between equally distant candidates break towards
//! the most recently seen.

use crate::address::NodeAddr;
use lib_crypto::Digest;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Bucket capacity (the Kademlia K parameter)
pub const BUCKET_SIZE: usize = 16;

/// Number of buckets for 256-bit identifiers
pub const BUCKET_COUNT: usize = 256;

/// Entries failing this many probes in a row are dropped
pub const MAX_FAILURES: u32 = 3;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Clone, Debug)]
pub struct RouteEntry {
    pub node: Digest,
    pub addresses: Vec<NodeAddr>,
    pub last_seen: u64,
    pub failures: u32,
}

/// Routing table for one local node
pub struct RoutingTable {
    local: Digest,
    entries: HashMap<Digest, RouteEntry>,
    bucket_fill: [usize; BUCKET_COUNT],
}

impl RoutingTable {
    pub fn new(local: Digest) -> Self {
        Self {
            local,
            entries: HashMap::new(),
            bucket_fill: [0; BUCKET_COUNT],
        }
    }

    fn bucket_index(&self, node: &Digest) -> usize {
        let prefix = self.local.distance(node).leading_zero_bits() as usize;
        prefix.min(BUCKET_COUNT - 1)
    }

    /// Insert or refresh a node. The local node is never added. When the
    /// bucket is full, the least recently seen failing entry makes room;
    /// a full bucket of healthy entries rejects the newcomer.
    pub fn insert(&mut self, node: Digest, addresses: Vec<NodeAddr>) -> bool {
        if node == self.local {
            return false;
        }
        let now = now_secs();
        if let Some(entry) = self.entries.get_mut(&node) {
            for addr in addresses {
                if !entry.addresses.contains(&addr) {
                    entry.addresses.push(addr);
                }
            }
            entry.addresses.sort();
            entry.last_seen = now;
            entry.failures = 0;
            return true;
        }

        let bucket = self.bucket_index(&node);
        if self.bucket_fill[bucket] >= BUCKET_SIZE {
            let victim = self
                .entries
                .values()
                .filter(|e| self.bucket_index(&e.node) == bucket && e.failures >= MAX_FAILURES)
                .min_by_key(|e| e.last_seen)
                .map(|e| e.node);
            match victim {
                Some(victim) => {
                    self.remove(&victim);
                }
                None => return false,
            }
        }

        let mut addresses = addresses;
        addresses.sort();
        addresses.dedup();
        self.entries.insert(
            node,
            RouteEntry { node, addresses, last_seen: now, failures: 0 },
        );
        self.bucket_fill[bucket] += 1;
        true
    }

    pub fn remove(&mut self, node: &Digest) -> Option<RouteEntry> {
        let entry = self.entries.remove(node)?;
        let bucket = self.bucket_index(node);
        self.bucket_fill[bucket] = self.bucket_fill[bucket].saturating_sub(1);
        Some(entry)
    }

    pub fn get(&self, node: &Digest) -> Option<&RouteEntry> {
        self.entries.get(node)
    }

    pub fn contains(&self, node: &Digest) -> bool {
        self.entries.contains_key(node)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Mark a probe failure; drops the entry past the failure budget
    pub fn mark_failed(&mut self, node: &Digest) {
        let drop_it = match self.entries.get_mut(node) {
            Some(entry) => {
                entry.failures += 1;
                entry.failures >= MAX_FAILURES
            }
            None => false,
        };
        if drop_it {
            self.remove(node);
        }
    }

    /// Mark a successful contact
    pub fn mark_seen(&mut self, node: &Digest) {
        if let Some(entry) = self.entries.get_mut(node) {
            entry.last_seen = now_secs();
            entry.failures = 0;
        }
    }

    /// The `count` nodes closest to `target` by XOR distance, excluding
    /// `exclude`. Ties break towards the most recently seen.
    pub fn closest(&self, target: &Digest, count: usize, exclude: &[Digest]) -> Vec<RouteEntry> {
        let mut nodes: Vec<&RouteEntry> = self
            .entries
            .values()
            .filter(|e| !exclude.contains(&e.node))
            .collect();
        nodes.sort_by(|a, b| {
            target
                .distance(&a.node)
                .cmp(&target.distance(&b.node))
                .then(b.last_seen.cmp(&a.last_seen))
        });
        nodes.into_iter().take(count).cloned().collect()
    }

    /// All known nodes, unordered
    pub fn nodes(&self) -> impl Iterator<Item = &RouteEntry> {
        self.entries.values()
    }

    /// Drop entries not seen for `max_age_secs`; returns how many went
    pub fn prune_stale(&mut self, max_age_secs: u64) -> usize {
        let cutoff = now_secs().saturating_sub(max_age_secs);
        let stale: Vec<Digest> = self
            .entries
            .values()
            .filter(|e| e.last_seen < cutoff)
            .map(|e| e.node)
            .collect();
        let count = stale.len();
        for node in stale {
            self.remove(&node);
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_crypto::sha256;

    fn digest(n: u8) -> Digest {
        sha256(&[n])
    }

    fn addr(port: u16) -> NodeAddr {
        NodeAddr(format!("127.0.0.1:{port}").parse().unwrap())
    }

    #[test]
    fn test_never_holds_self() {
        let local = digest(0);
        let mut table = RoutingTable::new(local);
        assert!(!table.insert(local, vec![addr(1)]));
        assert!(table.is_empty());
    }

    #[test]
    fn test_insert_and_closest() {
        let mut table = RoutingTable::new(digest(0));
        for i in 1..=10u8 {
            table.insert(digest(i), vec![addr(1000 + i as u16)]);
        }
        assert_eq!(table.len(), 10);

        let target = digest(7);
        let closest = table.closest(&target, 3, &[]);
        assert_eq!(closest.len(), 3);
        assert_eq!(closest[0].node, digest(7), "exact match sorts first");

        // Ordering is by XOR distance
        for pair in closest.windows(2) {
            assert!(target.distance(&pair[0].node) <= target.distance(&pair[1].node));
        }
    }

    #[test]
    fn test_closest_excludes() {
        let mut table = RoutingTable::new(digest(0));
        for i in 1..=5u8 {
            table.insert(digest(i), vec![addr(1000 + i as u16)]);
        }
        let target = digest(3);
        let closest = table.closest(&target, 5, &[digest(3)]);
        assert!(closest.iter().all(|e| e.node != digest(3)));
    }

    #[test]
    fn test_failures_drop_entry() {
        let mut table = RoutingTable::new(digest(0));
        table.insert(digest(1), vec![addr(1001)]);
        for _ in 0..MAX_FAILURES {
            table.mark_failed(&digest(1));
        }
        assert!(!table.contains(&digest(1)));
    }

    #[test]
    fn test_refresh_merges_addresses() {
        let mut table = RoutingTable::new(digest(0));
        table.insert(digest(1), vec![addr(1001)]);
        table.insert(digest(1), vec![addr(1002)]);
        let entry = table.get(&digest(1)).unwrap();
        assert_eq!(entry.addresses.len(), 2);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_full_healthy_bucket_rejects() {
        // Force many nodes; buckets for random digests concentrate at
        // small prefix lengths, so at least one bucket fills up.
        let mut table = RoutingTable::new(digest(0));
        let mut rejected = false;
        for i in 1..=255u8 {
            if !table.insert(digest(i), vec![addr(2000 + i as u16)]) {
                rejected = true;
            }
        }
        assert!(rejected, "expected at least one full-bucket rejection");
        assert!(table.len() <= 255);
    }
}
