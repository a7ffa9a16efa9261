use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// Deserialize a `T` that implements `Default` — treats JSON `null` the same as
/// a missing field (returns `T::default()`).  Use with:
///   `#[serde(default, deserialize_with = "deserialize_null_default")]`
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Top-level service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Applied when no rule matches the request.
    #[serde(default = "default_policy")]
    pub default_policy: PolicyConfig,

    /// Ordered rule set. Highest priority wins; ties broken by position.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub rules: Vec<RuleConfig>,

    /// Honor the left-most parseable `X-Forwarded-For` entry as the client
    /// address. Only enable behind a trusted reverse proxy.
    #[serde(default)]
    pub trust_proxy: bool,

    /// CIDR ranges that bypass rate limiting entirely.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub ip_whitelist: Vec<String>,

    /// CIDR ranges rejected with 403 before any other processing.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub ip_blacklist: Vec<String>,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub stats: StatsConfig,

    /// Stable identifier for this process. Defaults to `<hostname>-<pid>`.
    #[serde(default)]
    pub instance_id: Option<String>,

    /// API-key tier → policy. Pre-populated with the bundled tier map.
    #[serde(default = "default_tier_policies")]
    pub tiers: HashMap<String, PolicyConfig>,

    /// Bearer-token role → policy. Pre-populated with the bundled role map.
    #[serde(default = "default_role_policies")]
    pub roles: HashMap<String, PolicyConfig>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            redis: RedisConfig::default(),
            breaker: BreakerConfig::default(),
            default_policy: default_policy(),
            rules: Vec::new(),
            trust_proxy: false,
            ip_whitelist: Vec::new(),
            ip_blacklist: Vec::new(),
            auth: AuthConfig::default(),
            stats: StatsConfig::default(),
            instance_id: None,
            tiers: default_tier_policies(),
            roles: default_role_policies(),
        }
    }
}

impl ServiceConfig {
    /// Resolve the effective instance id, defaulting to `<hostname>-<pid>`.
    pub fn resolve_instance_id(&self) -> String {
        match self.instance_id {
            Some(ref id) if !id.is_empty() => id.clone(),
            _ => {
                let host = hostname::get()
                    .ok()
                    .and_then(|h| h.into_string().ok())
                    .unwrap_or_else(|| "unknown".to_string());
                format!("{}-{}", host, std::process::id())
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Shard endpoints as `redis://` URLs; credentials and database select
    /// embed in the URL (`redis://:pass@host:6379/2`). Keys are distributed
    /// across shards via consistent hashing. Empty means fallback-only
    /// operation.
    #[serde(default = "default_redis_nodes")]
    pub nodes: Vec<String>,

    /// Per-call deadline in milliseconds. Exceeding it counts as a failure.
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,

    /// Virtual nodes per physical shard on the hash ring.
    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            nodes: default_redis_nodes(),
            op_timeout_ms: default_op_timeout_ms(),
            virtual_nodes: default_virtual_nodes(),
        }
    }
}

fn default_redis_nodes() -> Vec<String> {
    vec!["redis://127.0.0.1:6379".to_string()]
}

fn default_op_timeout_ms() -> u64 {
    50
}

fn default_virtual_nodes() -> usize {
    128
}

/// State machine: Closed → Open → HalfOpen → Closed/Open. One breaker per shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// How long the breaker stays Open before admitting a probe.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    /// Failures older than this window no longer count toward the threshold.
    #[serde(default = "default_rolling_window_ms")]
    pub rolling_window_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            cooldown_ms: default_cooldown_ms(),
            rolling_window_ms: default_rolling_window_ms(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    3
}

fn default_cooldown_ms() -> u64 {
    30_000
}

fn default_rolling_window_ms() -> u64 {
    60_000
}

/// Raw policy as written in config. Compiled and validated into
/// `limiter::Policy` at load time; invalid combinations refuse to start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// "fixed-window", "sliding-window", or "token-bucket".
    #[serde(default = "default_algorithm")]
    pub algorithm: String,

    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    #[serde(default = "default_max_requests")]
    pub max_requests: u64,

    /// Token bucket only. Must be >= max_requests.
    #[serde(default)]
    pub burst_capacity: Option<u64>,

    /// Token bucket only. Tokens added per window. Must be > 0.
    #[serde(default)]
    pub tokens_per_interval: Option<u64>,
}

fn default_algorithm() -> String {
    "fixed-window".to_string()
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_max_requests() -> u64 {
    100
}

fn default_policy() -> PolicyConfig {
    PolicyConfig {
        algorithm: default_algorithm(),
        window_ms: default_window_ms(),
        max_requests: default_max_requests(),
        burst_capacity: None,
        tokens_per_interval: None,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// Regex matched against the request path. Anchoring is the author's
    /// responsibility (include `^`/`$` as needed).
    pub path_pattern: String,

    /// Empty means all methods.
    #[serde(default)]
    pub method: Option<String>,

    /// Higher value = higher priority.
    #[serde(default)]
    pub priority: i32,

    #[serde(default = "default_true")]
    pub enabled: bool,

    pub policy: PolicyConfig,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HMAC secret for bearer-token verification. Tokens are rejected when
    /// unset.
    #[serde(default)]
    pub jwt_secret: Option<String>,

    /// Accept `?api_key=` as a fallback credential source.
    #[serde(default)]
    pub allow_api_key_query: bool,

    /// Accept `?access_token=` / an `access_token` cookie for bearer tokens.
    #[serde(default)]
    pub allow_token_query: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            allow_api_key_query: false,
            allow_token_query: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    /// Response-time samples retained in the circular buffer.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Per-endpoint counter entries retained (least-recently-updated evicted).
    #[serde(default = "default_endpoint_cap")]
    pub endpoint_cap: usize,

    /// Per-identity counter entries retained.
    #[serde(default = "default_identity_cap")]
    pub identity_cap: usize,

    /// Derived snapshot cache lifetime.
    #[serde(default = "default_snapshot_cache_ms")]
    pub snapshot_cache_ms: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            endpoint_cap: default_endpoint_cap(),
            identity_cap: default_identity_cap(),
            snapshot_cache_ms: default_snapshot_cache_ms(),
        }
    }
}

fn default_buffer_size() -> usize {
    1024
}

fn default_endpoint_cap() -> usize {
    500
}

fn default_identity_cap() -> usize {
    1000
}

fn default_snapshot_cache_ms() -> u64 {
    1000
}

/// Bundled tier → policy map (overridable from the config file).
fn default_tier_policies() -> HashMap<String, PolicyConfig> {
    let mut map = HashMap::new();
    map.insert(
        "free".to_string(),
        PolicyConfig {
            algorithm: "fixed-window".to_string(),
            window_ms: 60_000,
            max_requests: 100,
            burst_capacity: None,
            tokens_per_interval: None,
        },
    );
    map.insert(
        "premium".to_string(),
        PolicyConfig {
            algorithm: "token-bucket".to_string(),
            window_ms: 60_000,
            max_requests: 1000,
            burst_capacity: Some(1150),
            tokens_per_interval: Some(1000),
        },
    );
    map.insert(
        "enterprise".to_string(),
        PolicyConfig {
            algorithm: "token-bucket".to_string(),
            window_ms: 60_000,
            max_requests: 10_000,
            burst_capacity: Some(11_500),
            tokens_per_interval: Some(10_000),
        },
    );
    map
}

/// Bundled role → policy map for bearer tokens (overridable).
fn default_role_policies() -> HashMap<String, PolicyConfig> {
    let mut map = HashMap::new();
    map.insert(
        "admin".to_string(),
        PolicyConfig {
            algorithm: "token-bucket".to_string(),
            window_ms: 60_000,
            max_requests: 10_000,
            burst_capacity: Some(11_500),
            tokens_per_interval: Some(10_000),
        },
    );
    map.insert(
        "premium".to_string(),
        PolicyConfig {
            algorithm: "token-bucket".to_string(),
            window_ms: 60_000,
            max_requests: 1000,
            burst_capacity: Some(1150),
            tokens_per_interval: Some(1000),
        },
    );
    map.insert(
        "user".to_string(),
        PolicyConfig {
            algorithm: "sliding-window".to_string(),
            window_ms: 60_000,
            max_requests: 500,
            burst_capacity: None,
            tokens_per_interval: None,
        },
    );
    map.insert(
        "guest".to_string(),
        PolicyConfig {
            algorithm: "fixed-window".to_string(),
            window_ms: 60_000,
            max_requests: 100,
            burst_capacity: None,
            tokens_per_interval: None,
        },
    );
    map
}
