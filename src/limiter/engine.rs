use crate::config::{BreakerConfig, RedisConfig};
use crate::error::LimitError;
use crate::limiter::breaker::{BreakerCheck, BreakerRegistry};
use crate::limiter::local::{LocalLimiter, DEFAULT_MAX_ENTRIES};
use crate::limiter::policy::{now_ms, Decision, Policy, Verdict};
use crate::limiter::redis::RedisShards;
use std::sync::Arc;

/// Shard id stamped on decisions made by the in-process fallback limiter,
/// so operators can detect degraded mode from response headers alone.
pub const FALLBACK_SHARD: &str = "fallback";

/// The decision engine: routes each evaluation to the Redis shard owning the
/// scope, gated by that shard's breaker, and falls back to the local limiter
/// on breaker-open or upstream failure. Never surfaces infrastructure errors
/// to the caller — the worst case is a fail-open decision tagged in
/// `error_tag`.
pub struct DecisionEngine {
    shards: Arc<RedisShards>,
    local: Arc<LocalLimiter>,
    breakers: BreakerRegistry,
    instance_id: String,
}

impl DecisionEngine {
    pub fn new(
        redis_cfg: &RedisConfig,
        breaker_cfg: BreakerConfig,
        instance_id: String,
    ) -> Result<Self, LimitError> {
        Ok(Self {
            shards: Arc::new(RedisShards::new(redis_cfg)?),
            local: Arc::new(LocalLimiter::new(DEFAULT_MAX_ENTRIES)),
            breakers: BreakerRegistry::new(breaker_cfg),
            instance_id,
        })
    }

    /// Shared handle to the shard pool, for collaborators that need raw key
    /// access (the API-key store).
    pub fn shards(&self) -> Arc<RedisShards> {
        self.shards.clone()
    }

    /// Spawn the fallback limiter's expiry sweeper. Call once at bootstrap.
    pub fn start_background_tasks(&self) {
        self.local.start_sweeper();
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn shard_ids(&self) -> Vec<String> {
        self.shards.shard_ids()
    }

    pub fn breaker_states(&self) -> Vec<(String, &'static str)> {
        self.breakers.states()
    }

    /// True when at least one shard's breaker would admit traffic.
    pub fn any_shard_available(&self) -> bool {
        let ids = self.shards.shard_ids();
        !ids.is_empty() && self.breakers.any_shard_available(&ids)
    }

    pub fn fallback_entries(&self) -> usize {
        self.local.len()
    }

    /// Ping every shard; returns (shard id, latency ms or None).
    pub async fn probe_shards(&self) -> Vec<(String, Option<f64>)> {
        let ids = self.shards.shard_ids();
        let mut results = Vec::with_capacity(ids.len());
        for (idx, id) in ids.into_iter().enumerate() {
            let latency = self.shards.ping(idx).await.ok();
            results.push((id, latency));
        }
        results
    }

    /// Evaluate one request. Infallible by design: infrastructure failures
    /// degrade to the fallback limiter, and a failure of the fallback itself
    /// fails open.
    pub async fn check(&self, policy: &Policy, scope: &str) -> Decision {
        let now = now_ms();

        let shard_id = match self.shards.shard_for(scope) {
            Some(id) => id.to_string(),
            None => return self.check_fallback(policy, scope, now).await,
        };

        match self.breakers.check(&shard_id) {
            BreakerCheck::Rejected => self.check_fallback(policy, scope, now).await,
            BreakerCheck::Allowed | BreakerCheck::Probe => {
                match self.shards.check(policy, scope).await {
                    Ok(verdict) => {
                        self.breakers.record_success(&shard_id);
                        self.assemble(policy, verdict, shard_id, now, None)
                    }
                    Err(LimitError::Corruption(msg)) => {
                        // The shard answered, so it is healthy — the key
                        // itself is damaged. Deny with a distinct tag.
                        self.breakers.record_success(&shard_id);
                        tracing::error!(
                            "engine: corrupted key, scope={}, shard={}, error={}",
                            scope,
                            shard_id,
                            msg
                        );
                        self.assemble(
                            policy,
                            Verdict {
                                allowed: false,
                                remaining: 0,
                                reset_hint_ms: policy.window_ms() as i64,
                            },
                            shard_id,
                            now,
                            Some("corruption"),
                        )
                    }
                    Err(e) => {
                        self.breakers.record_failure(&shard_id);
                        tracing::warn!(
                            "engine: shard call failed, scope={}, shard={}, error={}",
                            scope,
                            shard_id,
                            e
                        );
                        self.check_fallback(policy, scope, now).await
                    }
                }
            }
        }
    }

    /// Administrative reset of one scope: broadcast to every shard and clear
    /// local fallback state. Redis errors are reported (this path may run
    /// during an outage) but local state is always cleared.
    pub async fn reset(&self, scope: &str) -> Result<u64, LimitError> {
        self.local.reset(scope);
        if self.shards.shard_count() == 0 {
            return Ok(0);
        }
        self.shards.reset(scope).await
    }

    async fn check_fallback(&self, policy: &Policy, scope: &str, now: i64) -> Decision {
        match self.local_verdict(policy, scope, now).await {
            Ok(verdict) => self.assemble(policy, verdict, FALLBACK_SHARD.to_string(), now, None),
            Err(e) => {
                // Both limiters failed: fail open rather than refuse traffic.
                tracing::error!("engine: fallback failed, scope={}, error={}", scope, e);
                self.fail_open(policy, now)
            }
        }
    }

    async fn local_verdict(
        &self,
        policy: &Policy,
        scope: &str,
        now: i64,
    ) -> Result<Verdict, LimitError> {
        Ok(self.local.check(policy, scope, now).await)
    }

    fn fail_open(&self, policy: &Policy, now: i64) -> Decision {
        Decision {
            allowed: true,
            limit: policy.limit(),
            remaining: policy.limit(),
            reset_at_ms: now + policy.window_ms() as i64,
            algorithm: policy.algorithm(),
            shard_id: FALLBACK_SHARD.to_string(),
            instance_id: self.instance_id.clone(),
            error_tag: Some("fail-open"),
        }
    }

    fn assemble(
        &self,
        policy: &Policy,
        verdict: Verdict,
        shard_id: String,
        now: i64,
        error_tag: Option<&'static str>,
    ) -> Decision {
        Decision {
            allowed: verdict.allowed,
            limit: policy.limit(),
            remaining: verdict.remaining,
            reset_at_ms: now + verdict.reset_hint_ms,
            algorithm: policy.algorithm(),
            shard_id,
            instance_id: self.instance_id.clone(),
            error_tag,
        }
    }
}
