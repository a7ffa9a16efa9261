use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use std::net::IpAddr;
use std::time::Instant;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// Per-request context that flows through the decision pipeline — carries
/// request metadata and accumulates the labels used by metrics and stats.
pub struct RequestContext {
    pub path: String,
    pub method: String,
    pub client_ip: IpAddr,
    /// Stats label for the resolved principal; empty until resolution.
    pub principal_label: String,
    /// Matched rule name, or `"_default"` — bounded metric label.
    pub rule_label: String,
    pub start: Instant,
}

impl RequestContext {
    pub fn new(path: String, method: String, client_ip: IpAddr) -> Self {
        Self {
            path,
            method,
            client_ip,
            principal_label: String::new(),
            rule_label: "_default".to_string(),
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    /// Build a JSON error response and record metrics in one place — the
    /// single exit point for all rejection paths.
    pub fn error_response(&self, status: StatusCode, msg: &str) -> hyper::Response<BoxBody> {
        self.finalize_metrics(status.as_u16());

        hyper::Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(full_body(format!(r#"{{"error":"{}"}}"#, msg)))
            .unwrap()
    }

    /// Record final request metrics.
    pub fn finalize_metrics(&self, status: u16) {
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(status);

        metrics::counter!(
            "limitd_requests_total",
            "rule" => self.rule_label.clone(),
            "method" => self.method.clone(),
            "status_code" => status_str.to_owned(),
        )
        .increment(1);

        metrics::histogram!(
            "limitd_request_duration_seconds",
            "rule" => self.rule_label.clone(),
        )
        .record(self.start.elapsed().as_secs_f64());
    }
}
