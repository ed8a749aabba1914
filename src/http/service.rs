//! Admission check service exposed over HTTP/JSON.
//!
//! # Endpoints
//!
//! - `POST /v1/check` with `{"policy": "login", "identifier": "ip:1.2.3.4"}`
//!   counts one request. Admitted: `200` with
//!   `{allowed, remaining, limit, resetAt, retryAfter}`. Denied: `429` with
//!   `{error, retryAfter}` and a `Retry-After` header. Both carry the
//!   `X-RateLimit-*` headers.
//! - `GET /v1/usage/{policy}/{identifier}` returns the live counter without
//!   counting.
//! - `GET /v1/stats` returns admission totals per policy.
//! - `GET /health` returns `OK`.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::enforce::{apply_headers, rejection};
use crate::error::TollgateError;
use crate::ratelimit::{Limiters, PolicyStats};

/// Body of `POST /v1/check`.
#[derive(Debug, Serialize, Deserialize)]
pub struct CheckRequest {
    pub policy: String,
    /// Missing identifiers are treated as the empty identifier
    #[serde(default)]
    pub identifier: String,
}

/// Body of an admitted check.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResponse {
    pub allowed: bool,
    pub remaining: u64,
    pub limit: u64,
    /// Epoch seconds
    pub reset_at: u64,
    pub retry_after: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageResponse {
    pub policy: String,
    pub identifier: String,
    pub count: u64,
    pub remaining: u64,
    /// Epoch seconds
    pub reset_at: u64,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub policies: Vec<PolicyStats>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(ErrorResponse { error: message })).into_response()
}

/// The service routes, sharing one set of limiters.
pub fn router(limiters: Arc<Limiters>) -> Router {
    Router::new()
        .route("/v1/check", post(handle_check))
        .route("/v1/usage/{policy}/{identifier}", get(handle_usage))
        .route("/v1/stats", get(handle_stats))
        .route("/health", get(|| async { "OK" }))
        .with_state(limiters)
}

async fn handle_check(
    State(limiters): State<Arc<Limiters>>,
    Json(request): Json<CheckRequest>,
) -> Response {
    if request.policy.is_empty() {
        warn!("Received check request with empty policy");
        return error_response(StatusCode::BAD_REQUEST, "policy is required".to_string());
    }

    let decision = match limiters.check(&request.policy, &request.identifier).await {
        Ok(decision) => decision,
        Err(e @ TollgateError::UnknownPolicy(_)) => {
            warn!(policy = %request.policy, "Check requested for unknown policy");
            return error_response(StatusCode::NOT_FOUND, e.to_string());
        }
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    debug!(
        policy = %request.policy,
        allowed = decision.result.allowed,
        remaining = decision.result.remaining,
        "Admission decision made"
    );

    if !decision.result.allowed {
        return rejection(&decision.result, decision.retry_after_secs);
    }

    let mut headers = HeaderMap::new();
    apply_headers(&decision.result, &mut headers);
    let body = CheckResponse {
        allowed: true,
        remaining: decision.result.remaining,
        limit: decision.result.limit,
        reset_at: decision.result.reset_at_secs(),
        retry_after: decision.retry_after_secs,
    };
    (StatusCode::OK, headers, Json(body)).into_response()
}

async fn handle_usage(
    State(limiters): State<Arc<Limiters>>,
    Path((policy, identifier)): Path<(String, String)>,
) -> Response {
    let Some(limiter) = limiters.get(&policy) else {
        return error_response(
            StatusCode::NOT_FOUND,
            TollgateError::UnknownPolicy(policy).to_string(),
        );
    };

    match limiter.peek(&identifier).await {
        Some(entry) => {
            let max = limiter.policy().max_requests;
            let reset_at_ms = entry
                .window_start_ms
                .saturating_add(limiter.policy().window_millis());
            Json(UsageResponse {
                policy,
                identifier,
                count: entry.count,
                remaining: max.saturating_sub(entry.count),
                reset_at: reset_at_ms.div_ceil(1000),
            })
            .into_response()
        }
        None => error_response(StatusCode::NOT_FOUND, "no active window".to_string()),
    }
}

async fn handle_stats(State(limiters): State<Arc<Limiters>>) -> Json<StatsResponse> {
    let policies = limiters.stats();
    info!(policies = policies.len(), "Serving admission stats");
    Json(StatsResponse { policies })
}
