use crate::config::BreakerConfig;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Circuit breaker state machine: Closed → Open → HalfOpen → Closed/Open.
///
/// Per-shard granularity — each Redis shard gets its own breaker, so a single
/// unhealthy node degrades only the keyspace hashed to it.
///
/// The breaker never references the client it guards; callers ask
/// `check()` before a call and report the outcome with `record_success` /
/// `record_failure`.
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<ShardBreaker>>,
    config: BreakerConfig,
}

struct ShardBreaker {
    /// 0 = Closed, 1 = Open, 2 = HalfOpen.
    state: AtomicU8,
    /// Failures within the current rolling window (Closed state).
    window: std::sync::Mutex<FailureWindow>,
    /// Consecutive successes while HalfOpen.
    half_open_successes: AtomicU32,
    /// Single-probe gate: set while a HalfOpen probe is in flight. Parallel
    /// probes against a still-recovering server are exactly the herd the
    /// breaker exists to prevent.
    probe_in_flight: AtomicBool,
    opened_at: std::sync::Mutex<Option<Instant>>,
    config: BreakerConfig,
}

struct FailureWindow {
    count: u32,
    started: Instant,
}

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Result of consulting the breaker before a shard call.
pub enum BreakerCheck {
    /// Breaker is closed — proceed normally.
    Allowed,
    /// Breaker is half-open and this caller won the probe slot.
    Probe,
    /// Breaker is open (or the probe slot is taken) — use the fallback.
    Rejected,
}

pub fn state_name(state: u8) -> &'static str {
    match state {
        STATE_OPEN => "open",
        STATE_HALF_OPEN => "half-open",
        _ => "closed",
    }
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    pub fn check(&self, shard_id: &str) -> BreakerCheck {
        self.get_or_create(shard_id).check()
    }

    pub fn record_success(&self, shard_id: &str) {
        self.get_or_create(shard_id).record_success();
    }

    pub fn record_failure(&self, shard_id: &str) {
        self.get_or_create(shard_id).record_failure();
    }

    /// Snapshot of every shard's breaker state, for /health and
    /// /stats/distributed.
    pub fn states(&self) -> Vec<(String, &'static str)> {
        self.breakers
            .iter()
            .map(|r| {
                (
                    r.key().clone(),
                    state_name(r.value().state.load(Ordering::Acquire)),
                )
            })
            .collect()
    }

    /// True when at least one known shard is not Open (or no failure has been
    /// recorded yet for a shard, in which case it has no breaker entry and is
    /// considered reachable).
    pub fn any_shard_available(&self, shard_ids: &[String]) -> bool {
        shard_ids.iter().any(|id| match self.breakers.get(id) {
            Some(b) => b.state.load(Ordering::Acquire) != STATE_OPEN,
            None => true,
        })
    }

    fn get_or_create(&self, shard_id: &str) -> Arc<ShardBreaker> {
        // Fast path: key already exists — no allocation.
        if let Some(entry) = self.breakers.get(shard_id) {
            return entry.value().clone();
        }
        self.breakers
            .entry(shard_id.to_string())
            .or_insert_with(|| {
                Arc::new(ShardBreaker {
                    state: AtomicU8::new(STATE_CLOSED),
                    window: std::sync::Mutex::new(FailureWindow {
                        count: 0,
                        started: Instant::now(),
                    }),
                    half_open_successes: AtomicU32::new(0),
                    probe_in_flight: AtomicBool::new(false),
                    opened_at: std::sync::Mutex::new(None),
                    config: self.config.clone(),
                })
            })
            .clone()
    }
}

impl ShardBreaker {
    fn check(&self) -> BreakerCheck {
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => BreakerCheck::Allowed,
            STATE_OPEN => {
                let cooled_down = {
                    let opened_at = self.opened_at.lock().unwrap();
                    opened_at.is_some_and(|at| {
                        at.elapsed() >= Duration::from_millis(self.config.cooldown_ms)
                    })
                };
                if cooled_down
                    && self
                        .state
                        .compare_exchange(
                            STATE_OPEN,
                            STATE_HALF_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    // The transition winner takes the first probe.
                    self.half_open_successes.store(0, Ordering::Relaxed);
                    self.probe_in_flight.store(true, Ordering::Release);
                    tracing::info!(
                        state = "half-open",
                        failures = self.config.failure_threshold,
                        successes = 0,
                        reason = "cooldown elapsed",
                        "breaker: probing"
                    );
                    return BreakerCheck::Probe;
                }
                BreakerCheck::Rejected
            }
            STATE_HALF_OPEN => {
                // Exactly one probe at a time.
                if self
                    .probe_in_flight
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    BreakerCheck::Probe
                } else {
                    BreakerCheck::Rejected
                }
            }
            _ => BreakerCheck::Allowed,
        }
    }

    fn record_success(&self) {
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => {
                let mut window = self.window.lock().unwrap();
                window.count = 0;
            }
            STATE_HALF_OPEN => {
                self.probe_in_flight.store(false, Ordering::Release);
                let count = self.half_open_successes.fetch_add(1, Ordering::Relaxed) + 1;
                if count >= self.config.success_threshold {
                    self.state.store(STATE_CLOSED, Ordering::Release);
                    self.window.lock().unwrap().count = 0;
                    *self.opened_at.lock().unwrap() = None;
                    tracing::info!(
                        state = "closed",
                        failures = 0,
                        successes = count,
                        reason = "probe streak complete",
                        "breaker: recovered"
                    );
                }
            }
            _ => {}
        }
    }

    fn record_failure(&self) {
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => {
                let tripped = {
                    let mut window = self.window.lock().unwrap();
                    if window.started.elapsed()
                        >= Duration::from_millis(self.config.rolling_window_ms)
                    {
                        window.count = 0;
                        window.started = Instant::now();
                    }
                    window.count += 1;
                    window.count >= self.config.failure_threshold
                };
                if tripped {
                    self.state.store(STATE_OPEN, Ordering::Release);
                    *self.opened_at.lock().unwrap() = Some(Instant::now());
                    tracing::warn!(
                        state = "open",
                        failures = self.config.failure_threshold,
                        successes = 0,
                        reason = "failure threshold reached",
                        "breaker: opened"
                    );
                }
            }
            STATE_HALF_OPEN => {
                self.state.store(STATE_OPEN, Ordering::Release);
                *self.opened_at.lock().unwrap() = Some(Instant::now());
                self.half_open_successes.store(0, Ordering::Relaxed);
                self.probe_in_flight.store(false, Ordering::Release);
                tracing::warn!(
                    state = "open",
                    failures = 1,
                    successes = 0,
                    reason = "probe failed",
                    "breaker: re-opened"
                );
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(failures: u32, successes: u32, cooldown_ms: u64) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: failures,
            success_threshold: successes,
            cooldown_ms,
            rolling_window_ms: 60_000,
        }
    }

    #[test]
    fn test_starts_closed() {
        let reg = BreakerRegistry::new(config(3, 2, 1000));
        assert!(matches!(reg.check("a:6379"), BreakerCheck::Allowed));
    }

    #[test]
    fn test_opens_after_threshold() {
        let reg = BreakerRegistry::new(config(3, 2, 60_000));
        for _ in 0..3 {
            reg.record_failure("a:6379");
        }
        assert!(matches!(reg.check("a:6379"), BreakerCheck::Rejected));
    }

    #[test]
    fn test_success_resets_failure_count() {
        let reg = BreakerRegistry::new(config(3, 2, 60_000));
        reg.record_failure("a:6379");
        reg.record_failure("a:6379");
        reg.record_success("a:6379");
        reg.record_failure("a:6379");
        reg.record_failure("a:6379");
        assert!(matches!(reg.check("a:6379"), BreakerCheck::Allowed));
    }

    #[test]
    fn test_shards_isolated() {
        let reg = BreakerRegistry::new(config(1, 1, 60_000));
        reg.record_failure("bad:6379");
        assert!(matches!(reg.check("bad:6379"), BreakerCheck::Rejected));
        assert!(matches!(reg.check("good:6379"), BreakerCheck::Allowed));
    }

    #[test]
    fn test_single_probe_after_cooldown() {
        let reg = BreakerRegistry::new(config(1, 1, 0));
        reg.record_failure("a:6379");
        std::thread::sleep(Duration::from_millis(10));

        // First caller after cooldown wins the probe slot.
        assert!(matches!(reg.check("a:6379"), BreakerCheck::Probe));
        // Second caller is rejected while the probe is in flight.
        assert!(matches!(reg.check("a:6379"), BreakerCheck::Rejected));
    }

    #[test]
    fn test_probe_success_streak_closes() {
        let reg = BreakerRegistry::new(config(1, 2, 0));
        reg.record_failure("a:6379");
        std::thread::sleep(Duration::from_millis(10));

        assert!(matches!(reg.check("a:6379"), BreakerCheck::Probe));
        reg.record_success("a:6379");
        // Still half-open: next probe slot opens up.
        assert!(matches!(reg.check("a:6379"), BreakerCheck::Probe));
        reg.record_success("a:6379");
        assert!(matches!(reg.check("a:6379"), BreakerCheck::Allowed));
    }

    #[test]
    fn test_probe_failure_reopens() {
        let reg = BreakerRegistry::new(config(1, 2, 0));
        reg.record_failure("a:6379");
        std::thread::sleep(Duration::from_millis(10));

        assert!(matches!(reg.check("a:6379"), BreakerCheck::Probe));
        reg.record_failure("a:6379");

        // Back to Open; with cooldown=0 the next check becomes a probe again,
        // proving the Open → HalfOpen cycle restarted.
        std::thread::sleep(Duration::from_millis(10));
        assert!(matches!(reg.check("a:6379"), BreakerCheck::Probe));
    }

    #[test]
    fn test_states_snapshot() {
        let reg = BreakerRegistry::new(config(1, 1, 60_000));
        reg.record_failure("a:6379");
        let _ = reg.check("b:6379");

        let states = reg.states();
        assert_eq!(states.len(), 2);
        let a = states.iter().find(|(id, _)| id == "a:6379").unwrap();
        assert_eq!(a.1, "open");
        let b = states.iter().find(|(id, _)| id == "b:6379").unwrap();
        assert_eq!(b.1, "closed");
    }

    #[test]
    fn test_any_shard_available() {
        let reg = BreakerRegistry::new(config(1, 1, 60_000));
        let ids = vec!["a:6379".to_string(), "b:6379".to_string()];
        assert!(reg.any_shard_available(&ids));

        reg.record_failure("a:6379");
        assert!(reg.any_shard_available(&ids));

        reg.record_failure("b:6379");
        assert!(!reg.any_shard_available(&ids));
    }

    #[test]
    fn test_rolling_window_expires_old_failures() {
        let reg = BreakerRegistry::new(BreakerConfig {
            failure_threshold: 2,
            success_threshold: 1,
            cooldown_ms: 60_000,
            rolling_window_ms: 20,
        });
        reg.record_failure("a:6379");
        std::thread::sleep(Duration::from_millis(30));
        // The first failure has aged out of the rolling window.
        reg.record_failure("a:6379");
        assert!(matches!(reg.check("a:6379"), BreakerCheck::Allowed));
    }
}
