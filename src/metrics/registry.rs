use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`,
/// `gauge!`, `histogram!`) can be used anywhere in the codebase. The
/// `PrometheusHandle` is retained solely for rendering the `/metrics`
/// endpoint.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric
    /// descriptions. Must be called **once** at startup before any
    /// `counter!` / `gauge!` / `histogram!` calls.
    pub fn install() -> Self {
        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher");

        // A recorder may already be installed in this process (multiple
        // service states in one test binary); keep a detached handle then.
        let handle = match builder.install_recorder() {
            Ok(handle) => handle,
            Err(_) => PrometheusBuilder::new().build_recorder().handle(),
        };

        // --- Describe all metrics (adds HELP / TYPE lines) ---

        // decision path
        describe_counter!(
            "limitd_decisions_total",
            Unit::Count,
            "Rate-limit decisions by algorithm, outcome, and backend"
        );
        describe_counter!(
            "limitd_requests_total",
            Unit::Count,
            "Total HTTP requests processed"
        );
        describe_histogram!(
            "limitd_request_duration_seconds",
            Unit::Seconds,
            "Decision latency from request arrival to verdict"
        );
        describe_gauge!(
            "limitd_requests_in_flight",
            Unit::Count,
            "Requests currently being processed"
        );

        // degraded modes
        describe_counter!(
            "limitd_fallback_decisions_total",
            Unit::Count,
            "Decisions served by the in-process fallback limiter"
        );
        describe_counter!(
            "limitd_fail_open_total",
            Unit::Count,
            "Requests admitted unchecked because both limiters failed"
        );
        describe_counter!(
            "limitd_corrupted_keys_total",
            Unit::Count,
            "Decisions denied due to unexpected Redis key types"
        );

        // identity
        describe_counter!(
            "limitd_auth_rejections_total",
            Unit::Count,
            "Requests rejected during credential validation"
        );
        describe_counter!(
            "limitd_quota_rejections_total",
            Unit::Count,
            "Requests rejected for exhausted monthly quota"
        );
        describe_counter!(
            "limitd_blacklist_rejections_total",
            Unit::Count,
            "Requests rejected by the IP blacklist"
        );

        // connections
        describe_gauge!(
            "limitd_connections_active",
            Unit::Count,
            "Active downstream connections"
        );
        describe_counter!(
            "limitd_connections_total",
            Unit::Count,
            "Total connections accepted"
        );

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
