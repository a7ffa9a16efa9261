use serde::Serialize;
use std::collections::HashMap;

/// Bounded per-key request/denial counters.
///
/// When an insert would exceed the cap, the least-recently-updated entry is
/// evicted, so memory stays O(cap) regardless of key cardinality (dynamic
/// paths, rotating clients).
pub struct CounterMap {
    entries: HashMap<String, CounterEntry>,
    cap: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CounterEntry {
    pub requests: u64,
    pub denials: u64,
    pub last_seen_ms: i64,
}

impl CounterMap {
    pub fn new(cap: usize) -> Self {
        Self {
            entries: HashMap::new(),
            cap: cap.max(1),
        }
    }

    pub fn record(&mut self, key: &str, denied: bool, now_ms: i64) {
        if !self.entries.contains_key(key) && self.entries.len() >= self.cap {
            self.evict_least_recent();
        }

        let entry = self.entries.entry(key.to_string()).or_default();
        entry.requests += 1;
        if denied {
            entry.denials += 1;
        }
        entry.last_seen_ms = now_ms;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> HashMap<String, CounterEntry> {
        self.entries.clone()
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }

    fn evict_least_recent(&mut self) {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.last_seen_ms)
            .map(|(k, _)| k.clone());
        if let Some(key) = victim {
            self.entries.remove(&key);
        }
    }
}
