use std::fmt;

/// Error taxonomy for the decision path.
///
/// Infrastructure failures (`Upstream`, `Internal`) are handled inside the
/// engine and never surface to clients as 5xx; they degrade to the fallback
/// limiter or fail open. Credential and limit failures map to 401/429.
#[derive(Debug)]
pub enum LimitError {
    /// Required credential absent. 401.
    AuthMissing(&'static str),
    /// Credential present but failed validation. 401.
    AuthInvalid(String),
    /// API-key monthly quota reached. 429 with quota headers.
    QuotaExceeded {
        limit: u64,
        used: u64,
        reset_at_ms: i64,
    },
    /// Redis call failed after timeout or error. Handled internally:
    /// increments the breaker and falls back to the local limiter.
    Upstream(String),
    /// Redis key has an unexpected type — signals keyspace corruption.
    /// The request is denied with a distinct internal tag.
    Corruption(String),
    Config(String),
    Internal(String),
}

impl fmt::Display for LimitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitError::AuthMissing(what) => write!(f, "missing credential: {}", what),
            LimitError::AuthInvalid(msg) => write!(f, "invalid credential: {}", msg),
            LimitError::QuotaExceeded { limit, used, .. } => {
                write!(f, "monthly quota exceeded: {}/{}", used, limit)
            }
            LimitError::Upstream(msg) => write!(f, "upstream error: {}", msg),
            LimitError::Corruption(msg) => write!(f, "keyspace corruption: {}", msg),
            LimitError::Config(msg) => write!(f, "config error: {}", msg),
            LimitError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for LimitError {}

impl From<redis::RedisError> for LimitError {
    fn from(e: redis::RedisError) -> Self {
        if e.kind() == redis::ErrorKind::TypeError {
            LimitError::Corruption(e.to_string())
        } else {
            LimitError::Upstream(e.to_string())
        }
    }
}
