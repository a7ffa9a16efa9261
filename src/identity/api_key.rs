use crate::error::LimitError;
use crate::limiter::redis::RedisShards;
use chrono::{Datelike, TimeZone, Utc};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// API-key metadata and monthly-quota store.
///
/// Keys are opaque strings; only their SHA-256 digest ever reaches storage:
///   `apikey:hash:<sha256>` → key id (reverse index)
///   `apikey:meta:<id>`     → hash {tier, monthly_quota, active}
///   `apikey:usage:<id>:<yyyymm>` → integer counter
///
/// Usage is recorded fire-and-forget after an allowed decision; a failed
/// increment is dropped, so quota enforcement is approximate during an
/// outage.
pub struct ApiKeyStore {
    shards: Arc<RedisShards>,
}

#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    pub id: String,
    pub tier: String,
    pub monthly_quota: u64,
    pub month_usage: u64,
    pub active: bool,
}

/// Usage keys expire two full periods after creation — long enough for
/// end-of-month reporting, short enough not to accumulate forever.
const USAGE_TTL_SECS: u64 = 62 * 24 * 3600;

impl ApiKeyStore {
    pub fn new(shards: Arc<RedisShards>) -> Self {
        Self { shards }
    }

    /// Look up a raw API key by digest. `Ok(None)` means the key is unknown.
    pub async fn lookup(&self, raw_key: &str) -> Result<Option<ApiKeyRecord>, LimitError> {
        let digest = hash_key(raw_key);

        let id = match self
            .shards
            .get_string(&format!("apikey:hash:{}", digest))
            .await?
        {
            Some(id) => id,
            None => return Ok(None),
        };

        let meta = self.shards.hgetall(&format!("apikey:meta:{}", id)).await?;
        if meta.is_empty() {
            // Reverse index points at a missing record.
            return Err(LimitError::Corruption(format!(
                "apikey:meta:{} missing for indexed key",
                id
            )));
        }

        let tier = meta.get("tier").cloned().unwrap_or_else(|| "free".to_string());
        let monthly_quota = meta
            .get("monthly_quota")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let active = meta
            .get("active")
            .map(|v| v == "1" || v == "true")
            .unwrap_or(false);

        let month_usage = self
            .shards
            .get_string(&usage_key(&id, Utc::now().format("%Y%m")))
            .await?
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        Ok(Some(ApiKeyRecord {
            id,
            tier,
            monthly_quota,
            month_usage,
            active,
        }))
    }

    /// Record one request against the key's monthly quota. Fire-and-forget:
    /// spawned so it never delays the response, and a failure is dropped
    /// after a debug log.
    pub fn record_usage(&self, id: &str) {
        let shards = self.shards.clone();
        let key = usage_key(id, Utc::now().format("%Y%m"));
        tokio::spawn(async move {
            if let Err(e) = shards.incr(&key, Some(USAGE_TTL_SECS)).await {
                tracing::debug!("apikey: usage increment dropped, key={}, error={}", key, e);
            }
        });
    }
}

fn usage_key(id: &str, period: impl std::fmt::Display) -> String {
    format!("apikey:usage:{}:{}", id, period)
}

pub fn hash_key(raw_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw_key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Stable per-key identifier usable when the store is unreachable: the first
/// 16 hex chars of the digest. Rate limiting stays per-key even though the
/// record could not be verified.
pub fn unverified_id(raw_key: &str) -> String {
    hash_key(raw_key)[..16].to_string()
}

/// Epoch milliseconds of the start of the next month — when the current
/// quota period rolls over.
pub fn quota_reset_at_ms() -> i64 {
    let now = Utc::now();
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .map(|t| t.timestamp_millis())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_stable_hex_sha256() {
        let h = hash_key("rl_test_key");
        assert_eq!(h.len(), 64);
        assert_eq!(h, hash_key("rl_test_key"));
        assert_ne!(h, hash_key("rl_other_key"));
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_unverified_id_is_digest_prefix() {
        let id = unverified_id("rl_test_key");
        assert_eq!(id.len(), 16);
        assert!(hash_key("rl_test_key").starts_with(&id));
    }

    #[test]
    fn test_usage_key_embeds_period() {
        assert_eq!(usage_key("k1", "202608"), "apikey:usage:k1:202608");
    }

    #[test]
    fn test_quota_reset_is_in_the_future() {
        let reset = quota_reset_at_ms();
        assert!(reset > Utc::now().timestamp_millis());
        // No more than ~32 days out.
        assert!(reset < Utc::now().timestamp_millis() + 32 * 24 * 3600 * 1000);
    }
}
