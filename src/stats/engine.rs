use crate::config::StatsConfig;
use crate::limiter::now_ms;
use crate::stats::counters::{CounterEntry, CounterMap};
use crate::stats::process::ProcessProbe;
use crate::stats::samples::SampleBuffer;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Bounded statistics engine feeding the observability endpoints.
///
/// Three stores composed: a circular response-time buffer, a per-endpoint
/// counter map, and a per-identity counter map — each behind its own mutex
/// held only for constant-time sections. Total memory is O(buffer +
/// endpoint_cap + identity_cap) regardless of traffic.
///
/// Lock order everywhere: samples → endpoints → identities.
pub struct StatsEngine {
    samples: Mutex<SampleBuffer>,
    endpoints: Mutex<CounterMap>,
    identities: Mutex<CounterMap>,
    total_requests: AtomicU64,
    denied_requests: AtomicU64,
    fail_open_events: AtomicU64,
    started: Instant,
    cache_ttl: Duration,
    cache: Mutex<Option<(Instant, StatsSnapshot)>>,
    probe: Mutex<ProcessProbe>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub denied_requests: u64,
    /// Requests admitted unchecked because both limiters failed. Operators
    /// should alert on nonzero values.
    pub fail_open_events: u64,
    pub rps: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub sample_count: usize,
    pub per_endpoint: HashMap<String, CounterEntry>,
    pub per_identity: HashMap<String, CounterEntry>,
    pub memory_bytes: u64,
    pub cpu_percent: f64,
    pub uptime_secs: u64,
}

impl StatsEngine {
    pub fn new(cfg: &StatsConfig) -> Self {
        Self {
            samples: Mutex::new(SampleBuffer::new(cfg.buffer_size)),
            endpoints: Mutex::new(CounterMap::new(cfg.endpoint_cap)),
            identities: Mutex::new(CounterMap::new(cfg.identity_cap)),
            total_requests: AtomicU64::new(0),
            denied_requests: AtomicU64::new(0),
            fail_open_events: AtomicU64::new(0),
            started: Instant::now(),
            cache_ttl: Duration::from_millis(cfg.snapshot_cache_ms),
            cache: Mutex::new(None),
            probe: Mutex::new(ProcessProbe::new()),
        }
    }

    /// Record one decisioned request. Every write holds a lock for constant
    /// time only.
    pub fn record(&self, endpoint: &str, identity: &str, denied: bool, duration_ms: f64) {
        let now = now_ms();

        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if denied {
            self.denied_requests.fetch_add(1, Ordering::Relaxed);
        }

        self.samples.lock().unwrap().push(duration_ms);
        self.endpoints.lock().unwrap().record(endpoint, denied, now);
        self.identities.lock().unwrap().record(identity, denied, now);
    }

    pub fn record_fail_open(&self) {
        self.fail_open_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fail_open_events(&self) -> u64 {
        self.fail_open_events.load(Ordering::Relaxed)
    }

    /// Derived snapshot, cached so concurrent readers share one computation.
    pub fn snapshot(&self) -> StatsSnapshot {
        {
            let cache = self.cache.lock().unwrap();
            if let Some((at, ref snap)) = *cache {
                if at.elapsed() < self.cache_ttl {
                    return snap.clone();
                }
            }
        }

        let snap = self.build_snapshot();
        *self.cache.lock().unwrap() = Some((Instant::now(), snap.clone()));
        snap
    }

    /// Replace all three buffers in one operation. Readers observe either
    /// the old set or the empty one, never a mix.
    pub fn reset(&self) {
        let mut samples = self.samples.lock().unwrap();
        let mut endpoints = self.endpoints.lock().unwrap();
        let mut identities = self.identities.lock().unwrap();

        samples.reset();
        endpoints.reset();
        identities.reset();
        self.total_requests.store(0, Ordering::Relaxed);
        self.denied_requests.store(0, Ordering::Relaxed);
        self.fail_open_events.store(0, Ordering::Relaxed);
        *self.cache.lock().unwrap() = None;
    }

    fn build_snapshot(&self) -> StatsSnapshot {
        let (percentiles, sample_count) = {
            let samples = self.samples.lock().unwrap();
            (samples.percentiles(), samples.len())
        };
        let per_endpoint = self.endpoints.lock().unwrap().snapshot();
        let per_identity = self.identities.lock().unwrap().snapshot();
        let usage = self.probe.lock().unwrap().sample();

        let uptime_secs = self.started.elapsed().as_secs();
        let total = self.total_requests.load(Ordering::Relaxed);

        StatsSnapshot {
            total_requests: total,
            denied_requests: self.denied_requests.load(Ordering::Relaxed),
            fail_open_events: self.fail_open_events.load(Ordering::Relaxed),
            rps: total as f64 / self.started.elapsed().as_secs_f64().max(1.0),
            p50: percentiles.p50,
            p95: percentiles.p95,
            p99: percentiles.p99,
            sample_count,
            per_endpoint,
            per_identity,
            memory_bytes: usage.rss_bytes,
            cpu_percent: usage.cpu_percent,
            uptime_secs,
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> StatsEngine {
        StatsEngine::new(&StatsConfig {
            buffer_size: 64,
            endpoint_cap: 4,
            identity_cap: 4,
            snapshot_cache_ms: 1000,
        })
    }

    #[test]
    fn test_record_and_snapshot() {
        let stats = engine();
        stats.record("/api/x", "ip:10.0.0.1", false, 1.5);
        stats.record("/api/x", "ip:10.0.0.1", true, 2.5);
        stats.record("/api/y", "ip:10.0.0.2", false, 3.5);

        let snap = stats.snapshot();
        assert_eq!(snap.total_requests, 3);
        assert_eq!(snap.denied_requests, 1);
        assert_eq!(snap.sample_count, 3);
        assert_eq!(snap.per_endpoint["/api/x"].requests, 2);
        assert_eq!(snap.per_endpoint["/api/x"].denials, 1);
        assert_eq!(snap.per_identity["ip:10.0.0.2"].requests, 1);
    }

    #[test]
    fn test_snapshot_is_cached() {
        let stats = engine();
        stats.record("/a", "i", false, 1.0);
        let first = stats.snapshot();
        // New traffic within the cache window is not reflected.
        stats.record("/a", "i", false, 1.0);
        let second = stats.snapshot();
        assert_eq!(first.total_requests, second.total_requests);
    }

    #[test]
    fn test_reset_clears_everything() {
        let stats = engine();
        stats.record("/a", "i", true, 1.0);
        stats.record_fail_open();
        stats.reset();

        let snap = stats.snapshot();
        assert_eq!(snap.total_requests, 0);
        assert_eq!(snap.denied_requests, 0);
        assert_eq!(snap.fail_open_events, 0);
        assert_eq!(snap.sample_count, 0);
        assert!(snap.per_endpoint.is_empty());
    }

    #[test]
    fn test_endpoint_cap_bounds_memory() {
        let stats = engine();
        for i in 0..100 {
            stats.record(&format!("/path/{}", i), "i", false, 1.0);
        }
        stats.reset(); // drop cache
        for i in 0..100 {
            stats.record(&format!("/path/{}", i), "i", false, 1.0);
        }
        let snap = stats.snapshot();
        assert!(snap.per_endpoint.len() <= 4);
        assert!(snap.per_identity.len() <= 4);
    }

    #[test]
    fn test_fail_open_counter() {
        let stats = engine();
        assert_eq!(stats.fail_open_events(), 0);
        stats.record_fail_open();
        stats.record_fail_open();
        assert_eq!(stats.fail_open_events(), 2);
    }
}
