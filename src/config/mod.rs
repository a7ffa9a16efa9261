pub mod types;

pub use types::*;

use crate::limiter::Policy;
use anyhow::Result;
use std::path::Path;

impl ServiceConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides. When the file does not exist, built-in defaults are
    /// used — allowing the service to start with zero configuration for local
    /// development.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: ServiceConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!(
                "config file not found at {}, using defaults",
                path.display()
            );
            ServiceConfig::default()
        };

        config.apply_env_overrides();

        config.validate()?;
        tracing::info!(
            "config: loaded, rules={}, shards={}",
            config.rules.len(),
            config.redis.nodes.len()
        );
        Ok(config)
    }

    /// Apply environment variable overrides for infrastructure settings.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("LIMITD_REDIS_NODES") {
            self.redis.nodes = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(v) = std::env::var("LIMITD_REDIS_OP_TIMEOUT_MS") {
            if let Ok(n) = v.parse::<u64>() {
                self.redis.op_timeout_ms = n;
            }
        }
        if let Ok(v) = std::env::var("LIMITD_TRUST_PROXY") {
            self.trust_proxy = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("LIMITD_INSTANCE_ID") {
            self.instance_id = Some(v);
        }
        if let Ok(v) = std::env::var("LIMITD_JWT_SECRET") {
            self.auth.jwt_secret = Some(v);
        }
        if let Ok(v) = std::env::var("LIMITD_BREAKER_FAILURE_THRESHOLD") {
            if let Ok(n) = v.parse::<u32>() {
                self.breaker.failure_threshold = n;
            }
        }
        if let Ok(v) = std::env::var("LIMITD_BREAKER_COOLDOWN_MS") {
            if let Ok(n) = v.parse::<u64>() {
                self.breaker.cooldown_ms = n;
            }
        }
    }

    /// Reject misconfiguration before serving any traffic. A policy that
    /// cannot be compiled (e.g. token bucket with `burst_capacity <
    /// max_requests`) is fatal.
    pub fn validate(&self) -> Result<()> {
        Policy::from_config(&self.default_policy)
            .map_err(|e| anyhow::anyhow!("default_policy: {e}"))?;

        for rule in &self.rules {
            Policy::from_config(&rule.policy)
                .map_err(|e| anyhow::anyhow!("rule '{}': {e}", rule.display_name()))?;
            regex::Regex::new(&rule.path_pattern)
                .map_err(|e| anyhow::anyhow!("rule '{}': bad pattern: {e}", rule.display_name()))?;
        }

        for (tier, policy) in &self.tiers {
            Policy::from_config(policy).map_err(|e| anyhow::anyhow!("tier '{tier}': {e}"))?;
        }
        for (role, policy) in &self.roles {
            Policy::from_config(policy).map_err(|e| anyhow::anyhow!("role '{role}': {e}"))?;
        }

        for cidr in self.ip_whitelist.iter().chain(self.ip_blacklist.iter()) {
            cidr.parse::<ipnetwork::IpNetwork>()
                .map_err(|e| anyhow::anyhow!("bad CIDR '{cidr}': {e}"))?;
        }

        if self.redis.virtual_nodes == 0 {
            anyhow::bail!("redis.virtual_nodes must be > 0");
        }

        Ok(())
    }
}

impl RuleConfig {
    pub fn display_name(&self) -> &str {
        if !self.name.is_empty() {
            &self.name
        } else if !self.id.is_empty() {
            &self.id
        } else {
            &self.path_pattern
        }
    }
}
