use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Consistent hash ring mapping scopes to shard indices.
///
/// Each physical shard contributes `virtual_nodes` points on the ring; a key
/// is owned by the first point at or after its hash (wrapping). Adding or
/// removing one shard of N moves at most ~1/N of the keyspace. Lookup is a
/// binary search over the sorted point list, and identical inputs always
/// resolve to the same shard.
#[derive(Debug)]
pub struct HashRing {
    /// Sorted (hash, shard index) points.
    points: Vec<(u64, usize)>,
    node_count: usize,
}

impl HashRing {
    pub fn new(node_ids: &[String], virtual_nodes: usize) -> Self {
        let mut points = Vec::with_capacity(node_ids.len() * virtual_nodes);
        for (idx, node) in node_ids.iter().enumerate() {
            for replica in 0..virtual_nodes {
                let point = hash_str(&format!("{}#{}", node, replica));
                points.push((point, idx));
            }
        }
        points.sort_unstable_by_key(|(h, _)| *h);

        Self {
            points,
            node_count: node_ids.len(),
        }
    }

    /// Shard index owning `key`, or `None` when the ring is empty.
    pub fn shard_for(&self, key: &str) -> Option<usize> {
        if self.points.is_empty() {
            return None;
        }
        let h = hash_str(key);
        let idx = match self.points.binary_search_by_key(&h, |(p, _)| *p) {
            Ok(i) => i,
            Err(i) => {
                if i == self.points.len() {
                    0 // wrap around
                } else {
                    i
                }
            }
        };
        Some(self.points[idx].1)
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }
}

fn hash_str(s: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    s.hash(&mut hasher);
    hasher.finish()
}
