//! limitd — a standalone rate-limiting service.
//!
//! Requests are identified (API key, bearer token, or remote IP), matched
//! against a priority-ordered rule set, and counted by one of three
//! algorithms executed atomically on Redis. When Redis misbehaves, a
//! per-shard circuit breaker routes decisions to an in-process fallback
//! limiter; when everything misbehaves, the service fails open and says so
//! in the response headers.

pub mod config;
pub mod error;
pub mod identity;
pub mod limiter;
pub mod metrics;
pub mod pipeline;
pub mod rules;
pub mod server;
pub mod stats;
