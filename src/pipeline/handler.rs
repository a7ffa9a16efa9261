use crate::error::LimitError;
use crate::identity::Principal;
use crate::limiter::{now_ms, Decision, Policy, FALLBACK_SHARD};
use crate::pipeline::context::{full_body, BoxBody, RequestContext};
use crate::pipeline::headers;
use crate::server::ServiceState;
use http::StatusCode;
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::net::SocketAddr;
use tracing::{debug, warn};

/// Handle an incoming request through a phased lifecycle:
///
/// 1. ADDRESS   — client IP resolution, blacklist / whitelist
/// 2. IDENTITY  — credential extraction and validation, quota pre-check
/// 3. RULES     — policy selection from the active rule set
/// 4. DECISION  — distributed (or fallback) rate-limit evaluation
/// 5. RESPOND   — host handler on allow, 429 on deny; headers either way
///
/// The request body is never read; only headers, method, path, and remote
/// address participate in the decision.
pub async fn handle_request(
    req: Request<Incoming>,
    state: ServiceState,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(|q| q.to_string());
    let method = req.method().as_str().to_string();
    let req_headers = req.headers().clone();

    let client_ip = state.resolver.client_ip(&req_headers, peer_addr.ip());
    let mut ctx = RequestContext::new(path, method, client_ip);

    metrics::gauge!("limitd_requests_in_flight").increment(1.0);
    let response = run_pipeline(&mut ctx, &req_headers, query.as_deref(), &state).await;
    metrics::gauge!("limitd_requests_in_flight").decrement(1.0);

    Ok(response)
}

async fn run_pipeline(
    ctx: &mut RequestContext,
    req_headers: &http::HeaderMap,
    query: Option<&str>,
    state: &ServiceState,
) -> Response<BoxBody> {
    // Address phase.
    if state.resolver.is_blacklisted(ctx.client_ip) {
        debug!("pipeline: blacklisted, ip={}", ctx.client_ip);
        metrics::counter!("limitd_blacklist_rejections_total").increment(1);
        state
            .stats
            .record(&ctx.path, &format!("ip:{}", ctx.client_ip), true, ctx.elapsed_ms());
        return ctx.error_response(StatusCode::FORBIDDEN, "forbidden");
    }

    if state.resolver.is_whitelisted(ctx.client_ip) {
        // Whitelisted callers bypass the decision engine; statistics still
        // record the request.
        ctx.principal_label = format!("ip:{}", ctx.client_ip);
        state
            .stats
            .record(&ctx.path, &ctx.principal_label, false, ctx.elapsed_ms());
        let resp = state.handler.respond(ctx);
        ctx.finalize_metrics(resp.status().as_u16());
        return resp;
    }

    // Identity phase.
    let principal = match state.resolver.resolve(req_headers, query, ctx.client_ip).await {
        Ok(p) => p,
        Err(e) => return reject_credential(ctx, state, e),
    };
    ctx.principal_label = principal.stat_id();

    // Rule phase: principal-specific policy (tier / role) outranks the
    // matched rule; the rule set's default applies last.
    let rules = state.rules.load();
    let (rule_policy, matched) = rules.select(&ctx.path, &ctx.method);
    if let Some(rule) = matched {
        ctx.rule_label = if rule.name.is_empty() {
            rule.pattern.as_str().to_string()
        } else {
            rule.name.clone()
        };
    }
    let policy = principal.policy().unwrap_or(rule_policy).clone();
    drop(rules);

    // Decision phase.
    let scope = principal.scope(&ctx.path);
    let decision = state.engine.check(&policy, &scope).await;
    record_decision(ctx, state, &decision);

    if decision.allowed {
        state.resolver.record_usage(&principal);

        let mut resp = state.handler.respond(ctx);
        headers::apply_decision_headers(resp.headers_mut(), &decision, &policy, now_ms());
        headers::apply_api_key_headers(resp.headers_mut(), &principal, true);
        ctx.finalize_metrics(resp.status().as_u16());
        resp
    } else {
        too_many_requests(ctx, &decision, &policy, &principal)
    }
}

fn record_decision(ctx: &RequestContext, state: &ServiceState, decision: &Decision) {
    let backend = if decision.shard_id == FALLBACK_SHARD {
        metrics::counter!("limitd_fallback_decisions_total").increment(1);
        "fallback"
    } else {
        "redis"
    };

    metrics::counter!(
        "limitd_decisions_total",
        "algorithm" => decision.algorithm,
        "allowed" => if decision.allowed { "true" } else { "false" },
        "backend" => backend,
    )
    .increment(1);

    match decision.error_tag {
        Some("fail-open") => {
            state.stats.record_fail_open();
            metrics::counter!("limitd_fail_open_total").increment(1);
        }
        Some("corruption") => {
            metrics::counter!("limitd_corrupted_keys_total").increment(1);
        }
        _ => {}
    }

    state.stats.record(
        &ctx.path,
        &ctx.principal_label,
        !decision.allowed,
        ctx.elapsed_ms(),
    );
}

fn reject_credential(
    ctx: &mut RequestContext,
    state: &ServiceState,
    error: LimitError,
) -> Response<BoxBody> {
    ctx.principal_label = format!("ip:{}", ctx.client_ip);
    state
        .stats
        .record(&ctx.path, &ctx.principal_label, true, ctx.elapsed_ms());

    match error {
        LimitError::QuotaExceeded {
            limit,
            used,
            reset_at_ms,
        } => {
            metrics::counter!("limitd_quota_rejections_total").increment(1);
            ctx.finalize_metrics(429);

            let body = serde_json::json!({
                "error": "quota_exceeded",
                "message": "monthly request quota exhausted",
                "limit": limit,
                "used": used,
            });
            let mut resp = Response::builder()
                .status(StatusCode::TOO_MANY_REQUESTS)
                .header("content-type", "application/json")
                .body(full_body(body.to_string()))
                .unwrap();
            headers::apply_quota_exceeded_headers(resp.headers_mut(), limit, used, reset_at_ms);
            resp
        }
        LimitError::AuthMissing(_) | LimitError::AuthInvalid(_) => {
            warn!(
                "pipeline: credential rejected, ip={}, error={}",
                ctx.client_ip, error
            );
            metrics::counter!("limitd_auth_rejections_total").increment(1);
            let msg = match error {
                LimitError::AuthInvalid(ref tag) if tag == "invalid_api_key" => "invalid_api_key",
                _ => "unauthorized",
            };
            ctx.error_response(StatusCode::UNAUTHORIZED, msg)
        }
        other => {
            // Resolver infrastructure errors degrade inside the resolver;
            // anything else here is unexpected.
            warn!("pipeline: unexpected resolve error: {}", other);
            ctx.error_response(StatusCode::UNAUTHORIZED, "unauthorized")
        }
    }
}

fn too_many_requests(
    ctx: &RequestContext,
    decision: &Decision,
    policy: &Policy,
    principal: &Principal,
) -> Response<BoxBody> {
    let now = now_ms();
    let retry_after = decision.retry_after_secs(now).max(1);

    debug!(
        "pipeline: rate limited, principal={}, path={}, algorithm={}",
        ctx.principal_label, ctx.path, decision.algorithm
    );

    let body = serde_json::json!({
        "error": "Too Many Requests",
        "message": "rate limit exceeded, slow down",
        "retryAfter": retry_after,
        "limit": decision.limit,
        "windowMs": policy.window_ms(),
        "algorithm": decision.algorithm,
    });

    let mut resp = Response::builder()
        .status(StatusCode::TOO_MANY_REQUESTS)
        .header("content-type", "application/json")
        .body(full_body(body.to_string()))
        .unwrap();

    headers::apply_decision_headers(resp.headers_mut(), decision, policy, now);
    headers::apply_api_key_headers(resp.headers_mut(), principal, false);
    ctx.finalize_metrics(429);
    resp
}
