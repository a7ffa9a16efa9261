use crate::config::RedisConfig;
use crate::error::LimitError;
use crate::limiter::policy::{Policy, Verdict};
use crate::limiter::ring::HashRing;
use crate::limiter::scripts;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::time::Duration;
use tokio::sync::Mutex;

struct Shard {
    /// Short identifier surfaced in decisions and breaker state, e.g.
    /// `"127.0.0.1:6379"`.
    id: String,
    client: redis::Client,
    /// Lazily established; `ConnectionManager` reconnects on its own after
    /// transient failures, which is what lets the breaker's half-open probe
    /// succeed once the server returns.
    manager: Mutex<Option<ConnectionManager>>,
}

/// Redis shard pool. Scopes are routed to shards by consistent hashing; every
/// operation runs under the configured per-call deadline and classifies
/// timeouts as upstream failures for the breaker.
pub struct RedisShards {
    shards: Vec<Shard>,
    ring: HashRing,
    op_timeout: Duration,
}

/// Deadline for administrative operations (reset, key scans) — these are off
/// the hot path and may touch many keys.
const ADMIN_OP_TIMEOUT: Duration = Duration::from_secs(2);

impl RedisShards {
    pub fn new(cfg: &RedisConfig) -> Result<Self, LimitError> {
        let mut shards = Vec::with_capacity(cfg.nodes.len());
        for url in &cfg.nodes {
            let client = redis::Client::open(url.as_str())
                .map_err(|e| LimitError::Config(format!("bad redis url '{}': {}", url, e)))?;
            shards.push(Shard {
                id: shard_id_from_url(url),
                client,
                manager: Mutex::new(None),
            });
        }

        let ids: Vec<String> = shards.iter().map(|s| s.id.clone()).collect();
        Ok(Self {
            shards,
            ring: HashRing::new(&ids, cfg.virtual_nodes),
            op_timeout: Duration::from_millis(cfg.op_timeout_ms),
        })
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard_ids(&self) -> Vec<String> {
        self.shards.iter().map(|s| s.id.clone()).collect()
    }

    /// Deterministic shard id for a scope, or `None` when no shards are
    /// configured.
    pub fn shard_for(&self, scope: &str) -> Option<&str> {
        self.ring
            .shard_for(scope)
            .map(|idx| self.shards[idx].id.as_str())
    }

    /// Execute one rate-limit check on the shard owning `scope`. The only
    /// hot-path operation.
    pub async fn check(&self, policy: &Policy, scope: &str) -> Result<Verdict, LimitError> {
        let idx = self
            .ring
            .shard_for(scope)
            .ok_or_else(|| LimitError::Upstream("no shards configured".to_string()))?;
        let mut conn = self.connection(idx).await?;

        let now = crate::limiter::policy::now_ms();
        let invocation = async {
            let result: (i64, i64, i64) = match policy {
                Policy::TokenBucket {
                    window_ms,
                    burst_capacity,
                    refill_per_sec,
                    ..
                } => {
                    Script::new(scripts::TOKEN_BUCKET)
                        .key(format!("tb:{}", scope))
                        .arg(*burst_capacity)
                        .arg(*refill_per_sec)
                        .arg(now)
                        .arg(*window_ms)
                        .invoke_async(&mut conn)
                        .await?
                }
                Policy::SlidingWindow {
                    window_ms,
                    max_requests,
                } => {
                    let member = format!("{}-{:08x}", now, rand::random::<u32>());
                    Script::new(scripts::SLIDING_WINDOW)
                        .key(format!("sw:{}", scope))
                        .arg(now)
                        .arg(*window_ms)
                        .arg(*max_requests)
                        .arg(member)
                        .invoke_async(&mut conn)
                        .await?
                }
                Policy::FixedWindow {
                    window_ms,
                    max_requests,
                } => {
                    Script::new(scripts::FIXED_WINDOW)
                        .key(format!("fw:{}", scope))
                        .arg(*max_requests)
                        .arg(*window_ms)
                        .arg(now)
                        .invoke_async(&mut conn)
                        .await?
                }
            };
            Ok::<_, redis::RedisError>(result)
        };

        let (allowed, remaining, reset_hint_ms) = tokio::time::timeout(self.op_timeout, invocation)
            .await
            .map_err(|_| {
                LimitError::Upstream(format!(
                    "deadline exceeded after {}ms",
                    self.op_timeout.as_millis()
                ))
            })??;

        Ok(Verdict {
            allowed: allowed == 1,
            remaining: remaining.max(0) as u64,
            reset_hint_ms: reset_hint_ms.max(0),
        })
    }

    /// Administrative reset: remove all counter state for `scope` on every
    /// shard (broadcast — never used on the hot path). The next request to
    /// the scope sees a fresh window.
    pub async fn reset(&self, scope: &str) -> Result<u64, LimitError> {
        let mut removed = 0u64;
        for idx in 0..self.shards.len() {
            let mut conn = self.connection(idx).await?;
            let scope = scope.to_string();

            let op = async {
                let n: u64 = redis::cmd("DEL")
                    .arg(format!("tb:{}", scope))
                    .arg(format!("sw:{}", scope))
                    .query_async(&mut conn)
                    .await?;
                let mut total = n;

                // Fixed-window keys carry a window-start suffix; collect them
                // with SCAN rather than KEYS.
                let pattern = format!("fw:{}:*", scope);
                let mut cursor: u64 = 0;
                loop {
                    let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(100)
                        .query_async(&mut conn)
                        .await?;
                    if !keys.is_empty() {
                        let n: u64 = conn.del(keys).await?;
                        total += n;
                    }
                    cursor = next;
                    if cursor == 0 {
                        break;
                    }
                }
                Ok::<u64, redis::RedisError>(total)
            };

            removed += tokio::time::timeout(ADMIN_OP_TIMEOUT, op)
                .await
                .map_err(|_| LimitError::Upstream("reset deadline exceeded".to_string()))??;
        }
        Ok(removed)
    }

    /// GET a string value, routed to the shard owning `key`.
    pub async fn get_string(&self, key: &str) -> Result<Option<String>, LimitError> {
        let mut conn = self.connection_for(key).await?;
        let key = key.to_string();
        let op = async {
            let v: Option<String> = conn.get(&key).await?;
            Ok::<_, redis::RedisError>(v)
        };
        tokio::time::timeout(self.op_timeout, op)
            .await
            .map_err(|_| LimitError::Upstream("get deadline exceeded".to_string()))?
            .map_err(LimitError::from)
    }

    /// HGETALL a hash, routed to the shard owning `key`.
    pub async fn hgetall(
        &self,
        key: &str,
    ) -> Result<std::collections::HashMap<String, String>, LimitError> {
        let mut conn = self.connection_for(key).await?;
        let key = key.to_string();
        let op = async {
            let v: std::collections::HashMap<String, String> = conn.hgetall(&key).await?;
            Ok::<_, redis::RedisError>(v)
        };
        tokio::time::timeout(self.op_timeout, op)
            .await
            .map_err(|_| LimitError::Upstream("hgetall deadline exceeded".to_string()))?
            .map_err(LimitError::from)
    }

    /// INCR a counter, routed to the shard owning `key`. Sets `ttl_secs` on
    /// first increment when provided.
    pub async fn incr(&self, key: &str, ttl_secs: Option<u64>) -> Result<u64, LimitError> {
        let mut conn = self.connection_for(key).await?;
        let key = key.to_string();
        let op = async {
            let n: u64 = conn.incr(&key, 1u64).await?;
            if n == 1 {
                if let Some(ttl) = ttl_secs {
                    let _: bool = conn.expire(&key, ttl as i64).await?;
                }
            }
            Ok::<_, redis::RedisError>(n)
        };
        tokio::time::timeout(self.op_timeout, op)
            .await
            .map_err(|_| LimitError::Upstream("incr deadline exceeded".to_string()))?
            .map_err(LimitError::from)
    }

    async fn connection_for(&self, key: &str) -> Result<ConnectionManager, LimitError> {
        let idx = self
            .ring
            .shard_for(key)
            .ok_or_else(|| LimitError::Upstream("no shards configured".to_string()))?;
        self.connection(idx).await
    }

    /// Ping one shard and report round-trip latency.
    pub async fn ping(&self, idx: usize) -> Result<f64, LimitError> {
        let mut conn = self.connection(idx).await?;
        let start = std::time::Instant::now();
        let op = async {
            let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok::<String, redis::RedisError>(pong)
        };
        tokio::time::timeout(self.op_timeout, op)
            .await
            .map_err(|_| LimitError::Upstream("ping deadline exceeded".to_string()))??;
        Ok(start.elapsed().as_secs_f64() * 1000.0)
    }

    async fn connection(&self, idx: usize) -> Result<ConnectionManager, LimitError> {
        let shard = &self.shards[idx];
        let mut guard = shard.manager.lock().await;
        if let Some(m) = guard.as_ref() {
            return Ok(m.clone());
        }

        let manager = tokio::time::timeout(self.op_timeout, shard.client.get_connection_manager())
            .await
            .map_err(|_| {
                LimitError::Upstream(format!("connect to {} deadline exceeded", shard.id))
            })??;

        tracing::info!("redis: connected, shard={}", shard.id);
        *guard = Some(manager.clone());
        Ok(manager)
    }
}

fn shard_id_from_url(url: &str) -> String {
    url.trim_start_matches("redis://")
        .trim_start_matches("rediss://")
        .trim_end_matches('/')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyConfig;

    fn cfg(nodes: &[&str]) -> RedisConfig {
        RedisConfig {
            nodes: nodes.iter().map(|s| s.to_string()).collect(),
            op_timeout_ms: 50,
            virtual_nodes: 64,
        }
    }

    #[test]
    fn test_shard_id_from_url() {
        assert_eq!(shard_id_from_url("redis://10.0.0.1:6379"), "10.0.0.1:6379");
        assert_eq!(shard_id_from_url("rediss://cache:6380/"), "cache:6380");
    }

    #[test]
    fn test_rejects_malformed_url() {
        assert!(RedisShards::new(&cfg(&["not a url"])).is_err());
    }

    #[test]
    fn test_shard_for_is_deterministic() {
        let shards =
            RedisShards::new(&cfg(&["redis://a:6379", "redis://b:6379", "redis://c:6379"]))
                .unwrap();
        let first = shards.shard_for("api:k1:/demo").map(str::to_string);
        assert!(first.is_some());
        for _ in 0..50 {
            assert_eq!(
                shards.shard_for("api:k1:/demo").map(str::to_string),
                first
            );
        }
    }

    #[test]
    fn test_empty_pool_has_no_shard() {
        let shards = RedisShards::new(&cfg(&[])).unwrap();
        assert_eq!(shards.shard_for("any"), None);
        assert_eq!(shards.shard_count(), 0);
    }

    #[tokio::test]
    async fn test_check_with_no_shards_is_upstream_error() {
        let shards = RedisShards::new(&cfg(&[])).unwrap();
        let policy = Policy::from_config(&PolicyConfig {
            algorithm: "fixed-window".to_string(),
            window_ms: 1000,
            max_requests: 1,
            burst_capacity: None,
            tokens_per_interval: None,
        })
        .unwrap();
        match shards.check(&policy, "ip:1.2.3.4:/x").await {
            Err(LimitError::Upstream(_)) => {}
            other => panic!("expected upstream error, got {:?}", other.map(|v| v.allowed)),
        }
    }
}
