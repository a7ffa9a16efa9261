use crate::identity::Principal;
use crate::limiter::{Decision, Policy};
use http::{HeaderMap, HeaderName, HeaderValue};

/// Write the standard rate-limit headers onto a decisioned response:
/// draft-style `RateLimit-*`, legacy `X-RateLimit-*` mirrors, the instance
/// and shard diagnostics, and `Retry-After` on denials.
pub fn apply_decision_headers(
    headers: &mut HeaderMap,
    decision: &Decision,
    policy: &Policy,
    now_ms: i64,
) {
    let reset_secs = decision.retry_after_secs(now_ms);
    let window_secs = policy.window_ms().div_ceil(1000);

    insert_num(headers, "ratelimit-limit", decision.limit);
    insert_num(headers, "ratelimit-remaining", decision.remaining);
    insert_num(headers, "ratelimit-reset", reset_secs);
    insert_str(
        headers,
        "ratelimit-policy",
        &format!(
            "{};w={};type={}",
            decision.limit, window_secs, decision.algorithm
        ),
    );

    insert_num(headers, "x-ratelimit-limit", decision.limit);
    insert_num(headers, "x-ratelimit-remaining", decision.remaining);
    insert_num(headers, "x-ratelimit-reset", reset_secs);
    insert_str(headers, "x-ratelimit-algorithm", decision.algorithm);
    insert_str(headers, "x-ratelimit-instance", &decision.instance_id);
    insert_str(headers, "x-ratelimit-shard", &decision.shard_id);

    if decision.error_tag == Some("fail-open") {
        headers.insert(
            HeaderName::from_static("x-ratelimit-error"),
            HeaderValue::from_static("true"),
        );
    }

    if !decision.allowed {
        insert_num(headers, "retry-after", reset_secs.max(1));
    }
}

/// Tier and quota headers for API-key principals. For an allowed request the
/// current request is counted against the quota figures, matching the
/// asynchronous usage increment that follows.
pub fn apply_api_key_headers(headers: &mut HeaderMap, principal: &Principal, allowed: bool) {
    let Principal::ApiKey {
        tier,
        monthly_quota,
        month_usage,
        verified,
        ..
    } = principal
    else {
        return;
    };

    insert_str(headers, "x-api-key-tier", tier);

    if *verified && *monthly_quota > 0 {
        let used = if allowed {
            month_usage + 1
        } else {
            *month_usage
        };
        insert_num(headers, "x-quota-limit", *monthly_quota);
        insert_num(headers, "x-quota-used", used);
        insert_num(headers, "x-quota-remaining", monthly_quota.saturating_sub(used));
        insert_num(
            headers,
            "x-quota-reset",
            (crate::identity::api_key::quota_reset_at_ms() / 1000) as u64,
        );
    }
}

/// Quota headers for the 429 produced when the monthly quota is exhausted.
pub fn apply_quota_exceeded_headers(headers: &mut HeaderMap, limit: u64, used: u64, reset_at_ms: i64) {
    insert_num(headers, "x-quota-limit", limit);
    insert_num(headers, "x-quota-used", used);
    insert_num(headers, "x-quota-remaining", limit.saturating_sub(used));
    insert_num(headers, "x-quota-reset", (reset_at_ms / 1000).max(0) as u64);
    let retry_secs = ((reset_at_ms - crate::limiter::now_ms()) / 1000).max(1) as u64;
    insert_num(headers, "retry-after", retry_secs);
}

fn insert_num(headers: &mut HeaderMap, name: &'static str, value: u64) {
    let mut buf = itoa::Buffer::new();
    if let Ok(v) = HeaderValue::from_str(buf.format(value)) {
        headers.insert(HeaderName::from_static(name), v);
    }
}

fn insert_str(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(v) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), v);
    }
}
