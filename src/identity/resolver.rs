use crate::config::ServiceConfig;
use crate::error::LimitError;
use crate::identity::api_key::{self, ApiKeyStore};
use crate::identity::token::TokenValidator;
use crate::identity::Principal;
use crate::limiter::redis::RedisShards;
use crate::limiter::Policy;
use http::header::AUTHORIZATION;
use http::HeaderMap;
use ipnetwork::IpNetwork;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

/// Resolves the request's principal from its credentials, in priority order:
/// API key, bearer token, remote address.
pub struct IdentityResolver {
    api_keys: ApiKeyStore,
    tokens: Option<TokenValidator>,
    tier_policies: HashMap<String, Policy>,
    role_policies: HashMap<String, Policy>,
    trust_proxy: bool,
    allow_api_key_query: bool,
    allow_token_query: bool,
    whitelist: Vec<IpNetwork>,
    blacklist: Vec<IpNetwork>,
}

impl IdentityResolver {
    pub fn new(cfg: &ServiceConfig, shards: Arc<RedisShards>) -> Result<Self, LimitError> {
        let compile_map = |raw: &HashMap<String, crate::config::PolicyConfig>| {
            raw.iter()
                .map(|(name, policy_cfg)| {
                    Policy::from_config(policy_cfg)
                        .map(|p| (name.clone(), p))
                        .map_err(|e| LimitError::Config(format!("policy '{}': {}", name, e)))
                })
                .collect::<Result<HashMap<_, _>, _>>()
        };

        let parse_cidrs = |raw: &[String]| {
            raw.iter()
                .map(|c| {
                    c.parse::<IpNetwork>()
                        .map_err(|e| LimitError::Config(format!("bad CIDR '{}': {}", c, e)))
                })
                .collect::<Result<Vec<_>, _>>()
        };

        Ok(Self {
            api_keys: ApiKeyStore::new(shards),
            tokens: cfg.auth.jwt_secret.as_deref().map(TokenValidator::new),
            tier_policies: compile_map(&cfg.tiers)?,
            role_policies: compile_map(&cfg.roles)?,
            trust_proxy: cfg.trust_proxy,
            allow_api_key_query: cfg.auth.allow_api_key_query,
            allow_token_query: cfg.auth.allow_token_query,
            whitelist: parse_cidrs(&cfg.ip_whitelist)?,
            blacklist: parse_cidrs(&cfg.ip_blacklist)?,
        })
    }

    /// The effective client address. With trust-proxy enabled, the first
    /// non-loopback parseable `X-Forwarded-For` entry wins; otherwise the
    /// socket peer address is used.
    pub fn client_ip(&self, headers: &HeaderMap, peer: IpAddr) -> IpAddr {
        if !self.trust_proxy {
            return peer;
        }
        headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| {
                v.split(',')
                    .filter_map(|s| s.trim().parse::<IpAddr>().ok())
                    .find(|ip| !ip.is_loopback())
            })
            .unwrap_or(peer)
    }

    pub fn is_whitelisted(&self, ip: IpAddr) -> bool {
        self.whitelist.iter().any(|net| net.contains(ip))
    }

    pub fn is_blacklisted(&self, ip: IpAddr) -> bool {
        self.blacklist.iter().any(|net| net.contains(ip))
    }

    /// Resolve the request's principal.
    ///
    /// Returns `AuthInvalid` (401) for present-but-bad credentials and
    /// `QuotaExceeded` (429) when an API key's monthly budget is spent. An
    /// unreachable key store degrades to an unverified per-key principal —
    /// availability wins over quota precision.
    pub async fn resolve(
        &self,
        headers: &HeaderMap,
        query: Option<&str>,
        client_ip: IpAddr,
    ) -> Result<Principal, LimitError> {
        if let Some(raw_key) = self.extract_api_key(headers, query) {
            return self.resolve_api_key(&raw_key).await;
        }

        if let Some(token) = self.extract_bearer(headers, query)? {
            return self.resolve_token(&token);
        }

        Ok(Principal::Anonymous {
            remote_addr: client_ip,
        })
    }

    /// Record quota usage for an allowed request. Fire-and-forget; only
    /// verified API keys consume quota.
    pub fn record_usage(&self, principal: &Principal) {
        if let Principal::ApiKey {
            id, verified: true, ..
        } = principal
        {
            self.api_keys.record_usage(id);
        }
    }

    async fn resolve_api_key(&self, raw_key: &str) -> Result<Principal, LimitError> {
        let record = match self.api_keys.lookup(raw_key).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                return Err(LimitError::AuthInvalid("invalid_api_key".to_string()));
            }
            Err(LimitError::Corruption(msg)) => {
                tracing::error!("identity: api-key store corrupted, error={}", msg);
                return Err(LimitError::AuthInvalid("invalid_api_key".to_string()));
            }
            Err(e) => {
                // Store unreachable: rate-limit per key digest, skip quota.
                tracing::warn!("identity: api-key lookup degraded, error={}", e);
                return Ok(Principal::ApiKey {
                    id: api_key::unverified_id(raw_key),
                    tier: "unknown".to_string(),
                    policy: None,
                    monthly_quota: 0,
                    month_usage: 0,
                    verified: false,
                });
            }
        };

        self.evaluate_record(record)
    }

    /// Turn a stored key record into a principal, enforcing the active flag
    /// and the monthly quota pre-check.
    fn evaluate_record(
        &self,
        record: crate::identity::api_key::ApiKeyRecord,
    ) -> Result<Principal, LimitError> {
        if !record.active {
            return Err(LimitError::AuthInvalid("invalid_api_key".to_string()));
        }

        if record.monthly_quota > 0 && record.month_usage >= record.monthly_quota {
            return Err(LimitError::QuotaExceeded {
                limit: record.monthly_quota,
                used: record.month_usage,
                reset_at_ms: api_key::quota_reset_at_ms(),
            });
        }

        Ok(Principal::ApiKey {
            policy: self.tier_policies.get(&record.tier).cloned(),
            id: record.id,
            tier: record.tier,
            monthly_quota: record.monthly_quota,
            month_usage: record.month_usage,
            verified: true,
        })
    }

    fn resolve_token(&self, token: &str) -> Result<Principal, LimitError> {
        let validator = self
            .tokens
            .as_ref()
            .ok_or_else(|| LimitError::AuthInvalid("token verification not configured".to_string()))?;

        let claims = validator.validate(token)?;
        let role = claims.role.unwrap_or_else(|| "guest".to_string());

        Ok(Principal::Token {
            policy: self.role_policies.get(&role).cloned(),
            subject: claims.sub,
            role,
            permissions: claims.permissions.unwrap_or_default(),
        })
    }

    fn extract_api_key(&self, headers: &HeaderMap, query: Option<&str>) -> Option<String> {
        if let Some(v) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
            if !v.is_empty() {
                return Some(v.to_string());
            }
        }
        if self.allow_api_key_query {
            return query_param(query, "api_key");
        }
        None
    }

    fn extract_bearer(
        &self,
        headers: &HeaderMap,
        query: Option<&str>,
    ) -> Result<Option<String>, LimitError> {
        if let Some(auth) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
            if let Some(token) = auth.strip_prefix("Bearer ") {
                if token.is_empty() {
                    return Err(LimitError::AuthMissing("bearer token"));
                }
                return Ok(Some(token.to_string()));
            }
        }

        if self.allow_token_query {
            if let Some(token) = query_param(query, "access_token") {
                return Ok(Some(token));
            }
            if let Some(cookie) = headers.get("cookie").and_then(|v| v.to_str().ok()) {
                for pair in cookie.split(';') {
                    if let Some((name, value)) = pair.trim().split_once('=') {
                        if name == "access_token" && !value.is_empty() {
                            return Ok(Some(value.to_string()));
                        }
                    }
                }
            }
        }

        Ok(None)
    }
}

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    let query = query?;
    for pair in query.split('&') {
        if let Some((k, v)) = pair.split_once('=') {
            if k == name && !v.is_empty() {
                return Some(v.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RedisConfig;
    use crate::identity::token::{create_test_token, Claims};
    use http::HeaderValue;

    fn resolver(mutate: impl FnOnce(&mut ServiceConfig)) -> IdentityResolver {
        let mut cfg = ServiceConfig {
            auth: crate::config::AuthConfig {
                jwt_secret: Some("test-secret".to_string()),
                allow_api_key_query: false,
                allow_token_query: false,
            },
            ..ServiceConfig::default()
        };
        mutate(&mut cfg);
        // Empty shard pool: api-key lookups degrade instead of reaching Redis.
        let shards = Arc::new(
            RedisShards::new(&RedisConfig {
                nodes: vec![],
                op_timeout_ms: 50,
                virtual_nodes: 16,
            })
            .unwrap(),
        );
        IdentityResolver::new(&cfg, shards).unwrap()
    }

    fn now_secs() -> usize {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs() as usize
    }

    #[tokio::test]
    async fn test_anonymous_when_no_credentials() {
        let r = resolver(|_| {});
        let headers = HeaderMap::new();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();

        match r.resolve(&headers, None, ip).await.unwrap() {
            Principal::Anonymous { remote_addr } => assert_eq!(remote_addr, ip),
            other => panic!("expected anonymous, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_token_resolution_with_role_policy() {
        let r = resolver(|_| {});
        let token = create_test_token(
            &Claims {
                sub: "alice".to_string(),
                exp: now_secs() + 3600,
                iat: now_secs(),
                role: Some("user".to_string()),
                permissions: Some(vec!["read".to_string()]),
            },
            "test-secret",
        )
        .unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
        );

        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        match r.resolve(&headers, None, ip).await.unwrap() {
            Principal::Token {
                subject,
                role,
                policy,
                ..
            } => {
                assert_eq!(subject, "alice");
                assert_eq!(role, "user");
                // Bundled role map: user → sliding-window 500/min.
                assert_eq!(policy.unwrap().limit(), 500);
            }
            other => panic!("expected token principal, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_token_is_auth_invalid() {
        let r = resolver(|_| {});
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer garbage"));
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(matches!(
            r.resolve(&headers, None, ip).await,
            Err(LimitError::AuthInvalid(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_bearer_is_auth_missing() {
        let r = resolver(|_| {});
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer "));
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(matches!(
            r.resolve(&headers, None, ip).await,
            Err(LimitError::AuthMissing(_))
        ));
    }

    #[tokio::test]
    async fn test_api_key_outranks_token() {
        // Both credentials present: the API key wins. With no shards the
        // lookup degrades to an unverified per-key principal.
        let r = resolver(|_| {});
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("rl_live_abc"));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer whatever"));

        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        match r.resolve(&headers, None, ip).await.unwrap() {
            Principal::ApiKey { verified, tier, .. } => {
                assert!(!verified);
                assert_eq!(tier, "unknown");
            }
            other => panic!("expected api-key principal, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_api_key_query_param_honored_when_enabled() {
        let r = resolver(|cfg| cfg.auth.allow_api_key_query = true);
        let headers = HeaderMap::new();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();

        match r
            .resolve(&headers, Some("api_key=rl_live_abc&x=1"), ip)
            .await
            .unwrap()
        {
            Principal::ApiKey { .. } => {}
            other => panic!("expected api-key principal, got {:?}", other),
        }

        // Disabled by default: same query resolves anonymous.
        let r = resolver(|_| {});
        match r
            .resolve(&headers, Some("api_key=rl_live_abc"), ip)
            .await
            .unwrap()
        {
            Principal::Anonymous { .. } => {}
            other => panic!("expected anonymous, got {:?}", other),
        }
    }

    #[test]
    fn test_client_ip_respects_trust_proxy() {
        let peer: IpAddr = "192.0.2.7".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("127.0.0.1, 10.0.0.1, 172.16.0.1"),
        );

        let untrusting = resolver(|_| {});
        assert_eq!(untrusting.client_ip(&headers, peer), peer);

        let trusting = resolver(|cfg| cfg.trust_proxy = true);
        // First non-loopback entry wins.
        assert_eq!(
            trusting.client_ip(&headers, peer),
            "10.0.0.1".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn test_client_ip_falls_back_on_garbage_xff() {
        let peer: IpAddr = "192.0.2.7".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("not-an-ip"));
        let trusting = resolver(|cfg| cfg.trust_proxy = true);
        assert_eq!(trusting.client_ip(&headers, peer), peer);
    }

    #[test]
    fn test_ip_lists() {
        let r = resolver(|cfg| {
            cfg.ip_whitelist = vec!["10.1.0.0/16".to_string()];
            cfg.ip_blacklist = vec!["10.9.0.0/16".to_string()];
        });

        assert!(r.is_whitelisted("10.1.2.3".parse().unwrap()));
        assert!(!r.is_whitelisted("10.2.2.3".parse().unwrap()));
        assert!(r.is_blacklisted("10.9.1.1".parse().unwrap()));
        assert!(!r.is_blacklisted("10.1.2.3".parse().unwrap()));
    }

    #[test]
    fn test_inactive_key_rejected() {
        let r = resolver(|_| {});
        let record = crate::identity::api_key::ApiKeyRecord {
            id: "k1".to_string(),
            tier: "free".to_string(),
            monthly_quota: 1000,
            month_usage: 0,
            active: false,
        };
        assert!(matches!(
            r.evaluate_record(record),
            Err(LimitError::AuthInvalid(_))
        ));
    }

    #[test]
    fn test_exhausted_quota_rejected_with_figures() {
        let r = resolver(|_| {});
        let record = crate::identity::api_key::ApiKeyRecord {
            id: "k1".to_string(),
            tier: "free".to_string(),
            monthly_quota: 100,
            month_usage: 100,
            active: true,
        };
        match r.evaluate_record(record) {
            Err(LimitError::QuotaExceeded { limit, used, .. }) => {
                assert_eq!(limit, 100);
                assert_eq!(used, 100);
            }
            other => panic!("expected quota exceeded, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn test_active_key_gets_tier_policy() {
        let r = resolver(|_| {});
        let record = crate::identity::api_key::ApiKeyRecord {
            id: "k1".to_string(),
            tier: "premium".to_string(),
            monthly_quota: 100,
            month_usage: 99, // one request left this month
            active: true,
        };
        match r.evaluate_record(record).unwrap() {
            Principal::ApiKey {
                tier,
                policy,
                verified,
                ..
            } => {
                assert_eq!(tier, "premium");
                assert!(verified);
                // Bundled tier map: premium → token-bucket, burst 1150.
                assert_eq!(policy.unwrap().limit(), 1150);
            }
            other => panic!("expected api key principal, got {:?}", other),
        }
    }

    #[test]
    fn test_query_param_parsing() {
        assert_eq!(
            query_param(Some("a=1&api_key=k&b=2"), "api_key").as_deref(),
            Some("k")
        );
        assert_eq!(query_param(Some("api_key="), "api_key"), None);
        assert_eq!(query_param(None, "api_key"), None);
    }
}
