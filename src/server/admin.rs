use super::ServiceState;
use crate::limiter::now_ms;
use crate::pipeline::context::{full_body, BoxBody};
use hyper::body::Incoming;
use hyper::{Request, Response};

/// Read-only observability endpoints plus the administrative scope reset.
///
/// Each endpoint snapshots engine / stats state; none of them touch the hot
/// path. A light fixed-window self-limit (local, never Redis) protects
/// against observation-induced overload.
pub async fn handle_admin(
    req: Request<Incoming>,
    state: ServiceState,
    peer_ip: std::net::IpAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    let path = req.uri().path().to_string();

    let scope = format!("admin:{}:{}", peer_ip, path);
    let verdict = state
        .admin_limiter
        .check(&state.admin_policy, &scope, now_ms())
        .await;
    if !verdict.allowed {
        return Ok(Response::builder()
            .status(429)
            .header("content-type", "application/json")
            .body(full_body(r#"{"error":"too many requests"}"#))
            .unwrap());
    }

    match (req.method().as_str(), path.as_str()) {
        ("GET", "/health") | ("GET", "/healthz") => Ok(health(&state).await),

        ("GET", "/ready") | ("GET", "/readyz") => {
            let rules = state.rules.load();
            Ok(json_response(
                200,
                serde_json::json!({
                    "status": "ready",
                    "rules": rules.len(),
                    "shards": state.engine.shard_ids().len(),
                }),
            ))
        }

        ("GET", "/stats") => {
            let snap = state.stats.snapshot();
            Ok(json_response(200, serde_json::to_value(&snap).unwrap_or_default()))
        }

        ("GET", "/performance") => {
            let snap = state.stats.snapshot();
            Ok(json_response(
                200,
                serde_json::json!({
                    "samples": snap.sample_count,
                    "p50": snap.p50,
                    "p95": snap.p95,
                    "p99": snap.p99,
                    "rps": snap.rps,
                    "memory_bytes": snap.memory_bytes,
                    "cpu_percent": snap.cpu_percent,
                    "uptime_secs": snap.uptime_secs,
                }),
            ))
        }

        ("GET", "/stats/distributed") => {
            let breakers: serde_json::Map<String, serde_json::Value> = state
                .engine
                .breaker_states()
                .into_iter()
                .map(|(shard, breaker_state)| (shard, breaker_state.into()))
                .collect();
            Ok(json_response(
                200,
                serde_json::json!({
                    "instance": state.engine.instance_id(),
                    "shards": state.engine.shard_ids(),
                    "breakers": breakers,
                    "fallback_entries": state.engine.fallback_entries(),
                }),
            ))
        }

        ("GET", "/rules") => {
            let rules = state.rules.load();
            let listed: Vec<serde_json::Value> = rules
                .rules()
                .iter()
                .map(|r| {
                    serde_json::json!({
                        "id": r.id,
                        "name": r.name,
                        "pattern": r.pattern.as_str(),
                        "method": r.method,
                        "priority": r.priority,
                        "algorithm": r.policy.algorithm(),
                        "limit": r.policy.limit(),
                        "window_ms": r.policy.window_ms(),
                    })
                })
                .collect();
            Ok(json_response(
                200,
                serde_json::json!({
                    "rules": listed,
                    "default": {
                        "algorithm": rules.default_policy().algorithm(),
                        "limit": rules.default_policy().limit(),
                        "window_ms": rules.default_policy().window_ms(),
                    },
                }),
            ))
        }

        ("POST", "/reset") => {
            let Some(scope) = req
                .uri()
                .query()
                .and_then(|q| q.split('&').find_map(|p| p.strip_prefix("key=")))
                .filter(|s| !s.is_empty())
            else {
                return Ok(json_response(
                    400,
                    serde_json::json!({"error": "missing key parameter"}),
                ));
            };

            match state.engine.reset(scope).await {
                Ok(removed) => Ok(json_response(
                    200,
                    serde_json::json!({"reset": scope, "removed_keys": removed}),
                )),
                Err(e) => {
                    tracing::warn!("admin: reset failed, scope={}, error={}", scope, e);
                    Ok(json_response(
                        502,
                        serde_json::json!({"error": "reset incomplete", "detail": e.to_string()}),
                    ))
                }
            }
        }

        ("POST", "/stats/reset") => {
            state.stats.reset();
            Ok(json_response(200, serde_json::json!({"status": "reset"})))
        }

        ("GET", "/metrics") => {
            let body = state.metrics.render();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
                .body(full_body(body))
                .unwrap())
        }

        _ => Ok(Response::builder()
            .status(404)
            .body(full_body(r#"{"error":"not found"}"#))
            .unwrap()),
    }
}

async fn health(state: &ServiceState) -> Response<BoxBody> {
    let probes = state.engine.probe_shards().await;
    let connected = probes.iter().any(|(_, latency)| latency.is_some());
    let latency_ms = probes
        .iter()
        .filter_map(|(_, l)| *l)
        .fold(None::<f64>, |best, l| {
            Some(best.map_or(l, |b| b.min(l)))
        });

    let breakers: serde_json::Map<String, serde_json::Value> = state
        .engine
        .breaker_states()
        .into_iter()
        .map(|(shard, breaker_state)| (shard, breaker_state.into()))
        .collect();

    // The fallback limiter keeps the service answering even with every
    // shard down — report degraded rather than dead.
    let status = if connected || state.engine.any_shard_available() {
        "ok"
    } else {
        "degraded"
    };

    json_response(
        200,
        serde_json::json!({
            "status": status,
            "uptime_secs": state.stats.uptime_secs(),
            "redis": {
                "connected": connected,
                "latency_ms": latency_ms,
            },
            "breaker": breakers,
        }),
    )
}

fn json_response(status: u16, body: serde_json::Value) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(
            serde_json::to_string_pretty(&body).unwrap_or_default(),
        ))
        .unwrap()
}
