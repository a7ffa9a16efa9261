//! Server-side Lua scripts — one round trip per decision, atomic under
//! concurrent access from any number of service instances.
//!
//! All three scripts return `{allowed, remaining, reset_hint_ms}` as
//! integers. Token-bucket state keeps fractional tokens in the hash; only the
//! surfaced remaining count is floored.

/// KEYS[1] = tb:<scope>
/// ARGV = capacity, refill_per_sec, now_ms, window_ms
pub const TOKEN_BUCKET: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local refill = tonumber(ARGV[2])
local now_ms = tonumber(ARGV[3])
local window_ms = tonumber(ARGV[4])

local state = redis.call('HMGET', key, 'tokens', 'last_refill_ms')
local tokens = tonumber(state[1])
local last_refill = tonumber(state[2])

if tokens == nil then
  tokens = capacity
  last_refill = now_ms
end

local elapsed = math.max(0, now_ms - last_refill) / 1000.0
tokens = math.min(capacity, tokens + elapsed * refill)

local allowed = 0
local remaining = 0

if tokens >= 1 then
  tokens = tokens - 1
  allowed = 1
  remaining = math.floor(tokens)
end

redis.call('HMSET', key, 'tokens', tokens, 'last_refill_ms', now_ms)
redis.call('PEXPIRE', key, window_ms)

local reset_hint = math.ceil((capacity - tokens) / refill * 1000.0)
return {allowed, remaining, reset_hint}
"#;

/// KEYS[1] = sw:<scope>
/// ARGV = now_ms, window_ms, max_requests, member
///
/// The member is `<now_ms>-<nonce>` so that concurrent requests sharing a
/// millisecond still insert distinct set entries.
pub const SLIDING_WINDOW: &str = r#"
local key = KEYS[1]
local now_ms = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])
local max_requests = tonumber(ARGV[3])
local member = ARGV[4]

redis.call('ZREMRANGEBYSCORE', key, 0, now_ms - window_ms)
local count = redis.call('ZCARD', key)

if count < max_requests then
  redis.call('ZADD', key, now_ms, member)
  redis.call('PEXPIRE', key, window_ms)
  return {1, max_requests - count - 1, window_ms}
end

return {0, 0, window_ms}
"#;

/// KEYS[1] = fw:<scope> (the script derives the per-window key)
/// ARGV = max_requests, window_ms, now_ms
pub const FIXED_WINDOW: &str = r#"
local base = KEYS[1]
local max_requests = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])
local now_ms = tonumber(ARGV[3])

local window_start = math.floor(now_ms / window_ms) * window_ms
local key = base .. ':' .. window_start

local n = redis.call('INCR', key)
if n == 1 then
  redis.call('EXPIRE', key, math.ceil(window_ms / 1000))
end

local allowed = 0
if n <= max_requests then
  allowed = 1
end

return {allowed, math.max(0, max_requests - n), window_ms}
"#;

/// Start of the fixed window containing `now_ms`.
pub fn window_start(now_ms: i64, window_ms: u64) -> i64 {
    let w = window_ms as i64;
    (now_ms / w) * w
}

/// Fixed-window key TTL in whole seconds, rounded up.
pub fn window_ttl_secs(window_ms: u64) -> u64 {
    window_ms.div_ceil(1000)
}
