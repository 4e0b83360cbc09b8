use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderValue, Method, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::time::Instant;
use tracing::warn;

use pixelflow_core::domain::DEFAULT_USER_ID;

use crate::metrics::route_label;
use crate::state::AppState;

/// Record request count and latency labelled by method, collapsed route and
/// status.
pub async fn track_metrics(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let started = Instant::now();
    let method = request.method().to_string();
    let route = route_label(request.uri().path());

    let response = next.run(request).await;

    let status = response.status().as_u16().to_string();
    state
        .metrics()
        .requests_total
        .with_label_values(&[&method, &route, &status])
        .inc();
    state
        .metrics()
        .request_duration
        .with_label_values(&[&method, &route, &status])
        .observe(started.elapsed().as_secs_f64());

    response
}

/// Gate mutating job routes behind the shared token bucket. GETs are
/// exempt, and limiter failures fail open: admission must not depend on
/// limiter availability.
pub async fn rate_limit(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(limiter) = state.limiter().cloned() else {
        return next.run(request).await;
    };

    if !should_rate_limit(request.method(), request.uri().path()) {
        return next.run(request).await;
    }

    let subject = request
        .headers()
        .get(state.user_id_header())
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_USER_ID);
    let route = route_label(request.uri().path());
    let bucket_key = format!("{subject}:{route}");

    let decision = match limiter.allow(&bucket_key).await {
        Ok(decision) => decision,
        Err(err) => {
            warn!(subject = %bucket_key, error = %err, "rate limiter check failed, failing open");
            return next.run(request).await;
        }
    };

    let remaining = HeaderValue::from_str(&decision.remaining.to_string())
        .unwrap_or_else(|_| HeaderValue::from_static("0"));

    if decision.allowed {
        let mut response = next.run(request).await;
        response
            .headers_mut()
            .insert("X-RateLimit-Remaining", remaining);
        return response;
    }

    let retry_after = (decision.retry_after.as_secs_f64().round() as u64).max(1);
    state
        .metrics()
        .rate_limit_rejections
        .with_label_values(&[&route])
        .inc();

    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({ "error": "rate limit exceeded" })),
    )
        .into_response();
    response
        .headers_mut()
        .insert("X-RateLimit-Remaining", remaining);
    response.headers_mut().insert(
        "Retry-After",
        HeaderValue::from_str(&retry_after.to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("1")),
    );
    response
}

fn should_rate_limit(method: &Method, path: &str) -> bool {
    method != Method::GET && path.starts_with("/v1/jobs")
}
