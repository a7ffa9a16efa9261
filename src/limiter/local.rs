use crate::limiter::policy::{Policy, Verdict};
use crate::limiter::scripts;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// In-process fallback limiter — the same three algorithms over a sharded
/// map, used while a shard's breaker is open.
///
/// Decisions here are local to this instance: during an outage, N instances
/// may collectively admit up to N× the configured limit. That over-admission
/// is the accepted cost of staying available.
///
/// Memory is bounded two ways: a background sweep drops entries whose reset
/// time has passed, and inserts at the cap evict the soonest-expiring entry
/// first (the new request then starts from a fresh window).
pub struct LocalLimiter {
    entries: DashMap<String, Arc<LocalEntry>>,
    max_entries: usize,
}

/// Sweep cadence for expired entries.
const SWEEP_INTERVAL_SECS: u64 = 60;
/// Default entry cap.
pub const DEFAULT_MAX_ENTRIES: usize = 100_000;

struct LocalEntry {
    inner: Mutex<EntryState>,
    /// When this entry's state stops mattering — eviction order key.
    /// Atomic so the sweeper can read it without taking the state lock.
    reset_at_ms: AtomicI64,
}

enum EntryState {
    Bucket { tokens: f64, last_refill_ms: i64 },
    Window { log: VecDeque<i64> },
    Counter { window_start: i64, count: u64 },
}

impl EntryState {
    fn fresh(policy: &Policy, now_ms: i64) -> Self {
        match policy {
            Policy::TokenBucket { burst_capacity, .. } => EntryState::Bucket {
                tokens: *burst_capacity as f64,
                last_refill_ms: now_ms,
            },
            Policy::SlidingWindow { .. } => EntryState::Window {
                log: VecDeque::new(),
            },
            Policy::FixedWindow { window_ms, .. } => EntryState::Counter {
                window_start: scripts::window_start(now_ms, *window_ms),
                count: 0,
            },
        }
    }

    /// True when the state shape matches the policy's algorithm. A scope can
    /// change algorithm across rule reloads; stale state is discarded.
    fn matches(&self, policy: &Policy) -> bool {
        matches!(
            (self, policy),
            (EntryState::Bucket { .. }, Policy::TokenBucket { .. })
                | (EntryState::Window { .. }, Policy::SlidingWindow { .. })
                | (EntryState::Counter { .. }, Policy::FixedWindow { .. })
        )
    }
}

impl LocalLimiter {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Evaluate `scope` against `policy` at `now_ms`.
    pub async fn check(&self, policy: &Policy, scope: &str, now_ms: i64) -> Verdict {
        // Fast path: key already exists — no allocation.
        let entry = if let Some(e) = self.entries.get(scope) {
            e.value().clone()
        } else {
            if self.entries.len() >= self.max_entries {
                self.evict_soonest_expiring();
            }
            self.entries
                .entry(scope.to_string())
                .or_insert_with(|| {
                    Arc::new(LocalEntry {
                        inner: Mutex::new(EntryState::fresh(policy, now_ms)),
                        reset_at_ms: AtomicI64::new(now_ms + policy.window_ms() as i64),
                    })
                })
                .clone()
        };

        let mut state = entry.inner.lock().await;
        if !state.matches(policy) {
            *state = EntryState::fresh(policy, now_ms);
        }

        let verdict = match (&mut *state, policy) {
            (
                EntryState::Bucket {
                    tokens,
                    last_refill_ms,
                },
                Policy::TokenBucket {
                    burst_capacity,
                    refill_per_sec,
                    ..
                },
            ) => {
                let capacity = *burst_capacity as f64;
                let elapsed = (now_ms - *last_refill_ms).max(0) as f64 / 1000.0;
                *tokens = (*tokens + elapsed * refill_per_sec).min(capacity);
                *last_refill_ms = now_ms;

                let allowed = *tokens >= 1.0;
                if allowed {
                    *tokens -= 1.0;
                }
                let reset_hint_ms =
                    (((capacity - *tokens) / refill_per_sec) * 1000.0).ceil() as i64;
                Verdict {
                    allowed,
                    remaining: if allowed { tokens.floor() as u64 } else { 0 },
                    reset_hint_ms,
                }
            }
            (
                EntryState::Window { log },
                Policy::SlidingWindow {
                    window_ms,
                    max_requests,
                },
            ) => {
                let cutoff = now_ms - *window_ms as i64;
                while log.front().is_some_and(|t| *t < cutoff) {
                    log.pop_front();
                }

                if (log.len() as u64) < *max_requests {
                    log.push_back(now_ms);
                    Verdict {
                        allowed: true,
                        remaining: *max_requests - log.len() as u64,
                        reset_hint_ms: *window_ms as i64,
                    }
                } else {
                    Verdict {
                        allowed: false,
                        remaining: 0,
                        reset_hint_ms: *window_ms as i64,
                    }
                }
            }
            (
                EntryState::Counter {
                    window_start,
                    count,
                },
                Policy::FixedWindow {
                    window_ms,
                    max_requests,
                },
            ) => {
                let current = scripts::window_start(now_ms, *window_ms);
                if current != *window_start {
                    *window_start = current;
                    *count = 0;
                }
                *count += 1;
                Verdict {
                    allowed: *count <= *max_requests,
                    remaining: max_requests.saturating_sub(*count),
                    reset_hint_ms: *window_ms as i64,
                }
            }
            // matches() above guarantees state/policy agreement.
            _ => unreachable!("entry state reset to match policy"),
        };

        entry
            .reset_at_ms
            .store(now_ms + policy.window_ms() as i64, Ordering::Relaxed);

        verdict
    }

    /// Drop all state for one scope. The next request starts fresh.
    pub fn reset(&self, scope: &str) -> bool {
        self.entries.remove(scope).is_some()
    }

    /// Remove entries whose reset time has passed.
    pub fn sweep(&self, now_ms: i64) {
        self.entries
            .retain(|_, e| e.reset_at_ms.load(Ordering::Relaxed) >= now_ms);
    }

    /// Spawn a background task that sweeps expired entries periodically.
    /// Call once after construction.
    pub fn start_sweeper(self: &Arc<Self>) {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(SWEEP_INTERVAL_SECS));
            loop {
                interval.tick().await;
                limiter.sweep(crate::limiter::policy::now_ms());
            }
        });
    }

    /// Evict the single entry that expires soonest, making room for a new
    /// scope. The evicted scope is treated as if no prior state existed —
    /// under sustained overload during an outage, admitting fresh is
    /// preferred over refusing outright.
    fn evict_soonest_expiring(&self) {
        let mut victim: Option<(String, i64)> = None;
        for r in self.entries.iter() {
            let reset = r.value().reset_at_ms.load(Ordering::Relaxed);
            match victim {
                Some((_, best)) if reset >= best => {}
                _ => victim = Some((r.key().clone(), reset)),
            }
        }
        if let Some((key, _)) = victim {
            self.entries.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyConfig;

    fn fixed(window_ms: u64, max: u64) -> Policy {
        Policy::FixedWindow {
            window_ms,
            max_requests: max,
        }
    }

    fn sliding(window_ms: u64, max: u64) -> Policy {
        Policy::SlidingWindow {
            window_ms,
            max_requests: max,
        }
    }

    fn bucket(burst: u64, per_interval: u64, window_ms: u64) -> Policy {
        Policy::from_config(&PolicyConfig {
            algorithm: "token-bucket".to_string(),
            window_ms,
            max_requests: per_interval,
            burst_capacity: Some(burst),
            tokens_per_interval: Some(per_interval),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_fixed_window_counts_down_then_denies() {
        let limiter = LocalLimiter::new(100);
        let policy = fixed(60_000, 5);

        for i in 0..5 {
            let v = limiter.check(&policy, "ip:10.0.0.1:/demo", 1000).await;
            assert!(v.allowed, "request {} should be allowed", i);
            assert_eq!(v.remaining, 4 - i);
        }
        let v = limiter.check(&policy, "ip:10.0.0.1:/demo", 1500).await;
        assert!(!v.allowed);
        assert_eq!(v.remaining, 0);
    }

    #[tokio::test]
    async fn test_fixed_window_boundary_starts_new_window() {
        let limiter = LocalLimiter::new(100);
        let policy = fixed(60_000, 1);

        assert!(limiter.check(&policy, "k", 59_999).await.allowed);
        assert!(!limiter.check(&policy, "k", 59_999).await.allowed);
        // Exactly at the boundary: first request of the new window.
        assert!(limiter.check(&policy, "k", 60_000).await.allowed);
    }

    #[tokio::test]
    async fn test_sliding_window_ages_out_samples() {
        let limiter = LocalLimiter::new(100);
        let policy = sliding(2000, 2);

        assert!(limiter.check(&policy, "k", 0).await.allowed);
        assert!(limiter.check(&policy, "k", 1000).await.allowed);
        assert!(!limiter.check(&policy, "k", 1500).await.allowed);
        // t=0 sample has aged out of the 2000ms window by t=2100.
        assert!(limiter.check(&policy, "k", 2100).await.allowed);
    }

    #[tokio::test]
    async fn test_token_bucket_burst_then_drain() {
        let limiter = LocalLimiter::new(100);
        let policy = bucket(15, 10, 60_000);

        for i in 0..15 {
            let v = limiter.check(&policy, "k", 100).await;
            assert!(v.allowed, "burst request {} should pass", i);
        }
        assert!(!limiter.check(&policy, "k", 150).await.allowed);

        // 6 seconds later: 10/60000ms * 6000ms = 1 token refilled.
        let v = limiter.check(&policy, "k", 6150).await;
        assert!(v.allowed);
        assert_eq!(v.remaining, 0);
    }

    #[tokio::test]
    async fn test_token_bucket_single_token_at_refill_instant() {
        let limiter = LocalLimiter::new(100);
        // 1 token per second, burst 1.
        let policy = bucket(1, 1, 1000);

        assert!(limiter.check(&policy, "k", 0).await.allowed);
        assert!(!limiter.check(&policy, "k", 500).await.allowed);
        // Half a second accrued at t=500; full token available by t=1500.
        assert!(limiter.check(&policy, "k", 1500).await.allowed);
    }

    #[tokio::test]
    async fn test_max_requests_one_denies_second_for_all_algorithms() {
        let limiter = LocalLimiter::new(100);
        for (name, policy) in [
            ("fw", fixed(60_000, 1)),
            ("sw", sliding(60_000, 1)),
            ("tb", bucket(1, 1, 60_000)),
        ] {
            assert!(limiter.check(&policy, name, 10).await.allowed);
            assert!(
                !limiter.check(&policy, name, 20).await.allowed,
                "{}: second request must be denied",
                name
            );
        }
    }

    #[tokio::test]
    async fn test_scopes_are_independent() {
        let limiter = LocalLimiter::new(100);
        let policy = fixed(60_000, 1);

        assert!(limiter.check(&policy, "a", 0).await.allowed);
        assert!(limiter.check(&policy, "b", 0).await.allowed);
        assert!(!limiter.check(&policy, "a", 1).await.allowed);
    }

    #[tokio::test]
    async fn test_reset_gives_fresh_window() {
        let limiter = LocalLimiter::new(100);
        let policy = fixed(60_000, 2);

        limiter.check(&policy, "k", 0).await;
        limiter.check(&policy, "k", 1).await;
        assert!(!limiter.check(&policy, "k", 2).await.allowed);

        assert!(limiter.reset("k"));
        let v = limiter.check(&policy, "k", 3).await;
        assert!(v.allowed);
        assert_eq!(v.remaining, 1);
    }

    #[tokio::test]
    async fn test_sweep_removes_expired() {
        let limiter = LocalLimiter::new(100);
        let policy = fixed(1000, 5);

        limiter.check(&policy, "old", 0).await;
        limiter.check(&policy, "new", 5000).await;
        assert_eq!(limiter.len(), 2);

        limiter.sweep(5500);
        assert_eq!(limiter.len(), 1);
        assert!(limiter.entries.get("new").is_some());
    }

    #[tokio::test]
    async fn test_cap_evicts_soonest_expiring() {
        let limiter = LocalLimiter::new(2);
        let short = fixed(1000, 5);
        let long = fixed(60_000, 5);

        limiter.check(&short, "short-lived", 0).await;
        limiter.check(&long, "long-lived", 0).await;
        // Third scope forces eviction of the soonest-expiring entry.
        limiter.check(&long, "newcomer", 10).await;

        assert_eq!(limiter.len(), 2);
        assert!(limiter.entries.get("short-lived").is_none());
        assert!(limiter.entries.get("long-lived").is_some());
        assert!(limiter.entries.get("newcomer").is_some());
    }

    #[tokio::test]
    async fn test_algorithm_change_resets_state() {
        let limiter = LocalLimiter::new(100);
        let fw = fixed(60_000, 1);
        let sw = sliding(60_000, 1);

        assert!(limiter.check(&fw, "k", 0).await.allowed);
        assert!(!limiter.check(&fw, "k", 1).await.allowed);
        // Rule reload switched the algorithm: state starts fresh.
        assert!(limiter.check(&sw, "k", 2).await.allowed);
    }
}
