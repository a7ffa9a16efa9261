use crate::config::PolicyConfig;
use serde::Serialize;

/// A compiled, validated rate-limit policy. One variant per algorithm so
/// fields that only apply to one algorithm cannot exist half-filled.
#[derive(Debug, Clone, PartialEq)]
pub enum Policy {
    TokenBucket {
        window_ms: u64,
        max_requests: u64,
        burst_capacity: u64,
        /// Derived: tokens_per_interval scaled to one second.
        refill_per_sec: f64,
    },
    SlidingWindow {
        window_ms: u64,
        max_requests: u64,
    },
    FixedWindow {
        window_ms: u64,
        max_requests: u64,
    },
}

impl Policy {
    /// Compile a raw config policy, enforcing the invariants that are fatal
    /// at startup: positive window and limit, and for token buckets
    /// `burst_capacity >= max_requests` with a positive refill.
    pub fn from_config(cfg: &PolicyConfig) -> Result<Self, String> {
        if cfg.window_ms == 0 {
            return Err("window_ms must be > 0".to_string());
        }
        if cfg.max_requests == 0 {
            return Err("max_requests must be > 0".to_string());
        }

        match cfg.algorithm.as_str() {
            "fixed-window" => Ok(Policy::FixedWindow {
                window_ms: cfg.window_ms,
                max_requests: cfg.max_requests,
            }),
            "sliding-window" => Ok(Policy::SlidingWindow {
                window_ms: cfg.window_ms,
                max_requests: cfg.max_requests,
            }),
            "token-bucket" => {
                let burst = cfg.burst_capacity.unwrap_or(cfg.max_requests);
                if burst < cfg.max_requests {
                    return Err(format!(
                        "burst_capacity {} must be >= max_requests {}",
                        burst, cfg.max_requests
                    ));
                }
                let per_interval = cfg.tokens_per_interval.unwrap_or(cfg.max_requests);
                if per_interval == 0 {
                    return Err("tokens_per_interval must be > 0".to_string());
                }
                let refill_per_sec = per_interval as f64 / (cfg.window_ms as f64 / 1000.0);
                Ok(Policy::TokenBucket {
                    window_ms: cfg.window_ms,
                    max_requests: cfg.max_requests,
                    burst_capacity: burst,
                    refill_per_sec,
                })
            }
            other => Err(format!("unknown algorithm '{}'", other)),
        }
    }

    pub fn algorithm(&self) -> &'static str {
        match self {
            Policy::TokenBucket { .. } => "token-bucket",
            Policy::SlidingWindow { .. } => "sliding-window",
            Policy::FixedWindow { .. } => "fixed-window",
        }
    }

    pub fn window_ms(&self) -> u64 {
        match self {
            Policy::TokenBucket { window_ms, .. }
            | Policy::SlidingWindow { window_ms, .. }
            | Policy::FixedWindow { window_ms, .. } => *window_ms,
        }
    }

    /// The advertised limit: burst capacity for token buckets (the number of
    /// requests a cold client can actually make), max_requests otherwise.
    pub fn limit(&self) -> u64 {
        match self {
            Policy::TokenBucket { burst_capacity, .. } => *burst_capacity,
            Policy::SlidingWindow { max_requests, .. }
            | Policy::FixedWindow { max_requests, .. } => *max_requests,
        }
    }
}

/// Raw algorithm verdict, before Decision assembly. Produced by both the
/// Redis scripts and the in-process fallback implementations.
#[derive(Debug, Clone, Copy)]
pub struct Verdict {
    pub allowed: bool,
    pub remaining: u64,
    pub reset_hint_ms: i64,
}

/// The structured result of one rate-limit evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at_ms: i64,
    pub algorithm: &'static str,
    /// The shard that evaluated this request, or `"fallback"` when the
    /// in-process limiter was used.
    pub shard_id: String,
    pub instance_id: String,
    /// Set on degraded outcomes: `"fail-open"` when both limiters failed and
    /// the request was admitted unchecked, `"corruption"` when the key had an
    /// unexpected type and the request was denied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_tag: Option<&'static str>,
}

impl Decision {
    pub fn retry_after_secs(&self, now_ms: i64) -> u64 {
        let delta = self.reset_at_ms.saturating_sub(now_ms);
        ((delta as f64) / 1000.0).ceil() as u64
    }
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(algorithm: &str) -> PolicyConfig {
        PolicyConfig {
            algorithm: algorithm.to_string(),
            window_ms: 60_000,
            max_requests: 10,
            burst_capacity: None,
            tokens_per_interval: None,
        }
    }

    #[test]
    fn test_compile_fixed_window() {
        let p = Policy::from_config(&raw("fixed-window")).unwrap();
        assert_eq!(p.algorithm(), "fixed-window");
        assert_eq!(p.limit(), 10);
        assert_eq!(p.window_ms(), 60_000);
    }

    #[test]
    fn test_compile_token_bucket_defaults_burst_to_max() {
        let p = Policy::from_config(&raw("token-bucket")).unwrap();
        match p {
            Policy::TokenBucket {
                burst_capacity,
                refill_per_sec,
                ..
            } => {
                assert_eq!(burst_capacity, 10);
                // 10 tokens per 60s window.
                assert!((refill_per_sec - 10.0 / 60.0).abs() < 1e-9);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_compile_rejects_small_burst() {
        let mut cfg = raw("token-bucket");
        cfg.burst_capacity = Some(5);
        assert!(Policy::from_config(&cfg).is_err());
    }

    #[test]
    fn test_compile_rejects_zero_refill() {
        let mut cfg = raw("token-bucket");
        cfg.tokens_per_interval = Some(0);
        assert!(Policy::from_config(&cfg).is_err());
    }

    #[test]
    fn test_compile_rejects_zero_window_and_limit() {
        let mut cfg = raw("sliding-window");
        cfg.window_ms = 0;
        assert!(Policy::from_config(&cfg).is_err());

        let mut cfg = raw("sliding-window");
        cfg.max_requests = 0;
        assert!(Policy::from_config(&cfg).is_err());
    }

    #[test]
    fn test_token_bucket_limit_is_burst() {
        let mut cfg = raw("token-bucket");
        cfg.burst_capacity = Some(15);
        cfg.tokens_per_interval = Some(10);
        let p = Policy::from_config(&cfg).unwrap();
        assert_eq!(p.limit(), 15);
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let d = Decision {
            allowed: false,
            limit: 5,
            remaining: 0,
            reset_at_ms: 10_500,
            algorithm: "fixed-window",
            shard_id: "s0".to_string(),
            instance_id: "test-1".to_string(),
            error_tag: None,
        };
        assert_eq!(d.retry_after_secs(10_000), 1);
        assert_eq!(d.retry_after_secs(9_000), 2);
        assert_eq!(d.retry_after_secs(11_000), 0);
    }
}
