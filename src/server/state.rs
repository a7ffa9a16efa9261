use crate::config::ServiceConfig;
use crate::identity::IdentityResolver;
use crate::limiter::local::LocalLimiter;
use crate::limiter::{DecisionEngine, Policy};
use crate::metrics::Metrics;
use crate::pipeline::{EchoHandler, HostHandler};
use crate::rules::RuleSet;
use crate::stats::StatsEngine;
use anyhow::Result;
use arc_swap::ArcSwap;
use std::sync::Arc;
use tracing::info;

/// Shared service state, cheaply cloneable — one composed object passed by
/// reference into the request pipeline. Tests construct one per case; there
/// is no module-level state.
///
/// The rule set is read through `ArcSwap`, so readers always observe a
/// consistent set and replacements are atomic.
#[derive(Clone)]
pub struct ServiceState {
    pub config: Arc<ArcSwap<ServiceConfig>>,
    pub rules: Arc<ArcSwap<RuleSet>>,
    pub engine: Arc<DecisionEngine>,
    pub resolver: Arc<IdentityResolver>,
    pub stats: Arc<StatsEngine>,
    pub metrics: Metrics,
    pub handler: Arc<dyn HostHandler>,
    /// Self-limit for the observability endpoints — local by design, so a
    /// Redis outage cannot take /health down with it.
    pub admin_limiter: Arc<LocalLimiter>,
    pub admin_policy: Policy,
}

/// Requests per minute allowed per client on the admin endpoints.
const ADMIN_LIMIT_PER_MIN: u64 = 120;

impl ServiceState {
    pub fn new(config: ServiceConfig) -> Result<Self> {
        Self::with_handler(config, Arc::new(EchoHandler))
    }

    pub fn with_handler(config: ServiceConfig, handler: Arc<dyn HostHandler>) -> Result<Self> {
        let instance_id = config.resolve_instance_id();
        info!("state: instance_id={}", instance_id);

        let engine = Arc::new(DecisionEngine::new(
            &config.redis,
            config.breaker.clone(),
            instance_id,
        )?);
        let resolver = Arc::new(IdentityResolver::new(&config, engine.shards())?);
        let rules = RuleSet::compile(&config)?;
        let stats = Arc::new(StatsEngine::new(&config.stats));
        let metrics = Metrics::install();

        Ok(Self {
            config: Arc::new(ArcSwap::new(Arc::new(config))),
            rules: Arc::new(ArcSwap::new(Arc::new(rules))),
            engine,
            resolver,
            stats,
            metrics,
            handler,
            admin_limiter: Arc::new(LocalLimiter::new(10_000)),
            admin_policy: Policy::FixedWindow {
                window_ms: 60_000,
                max_requests: ADMIN_LIMIT_PER_MIN,
            },
        })
    }

    /// Replace the active rule set. Readers switch atomically; in-flight
    /// requests finish against the set they loaded.
    pub fn swap_rules(&self, rules: RuleSet) {
        self.rules.store(Arc::new(rules));
        info!("state: rule set replaced");
    }
}
