//! Enforcement of admission decisions on HTTP requests.
//!
//! [`enforce`] is an axum middleware that checks a policy before the inner
//! handler runs. Denied requests get a `429 Too Many Requests` response and
//! never reach the handler; admitted ones carry the rate-limit headers on
//! their response.
//!
//! ```ignore
//! let guard = RateLimitGuard::new(limiters, "aiChat")?;
//! let app = Router::new()
//!     .route("/chat", post(chat))
//!     .layer(middleware::from_fn_with_state(guard, enforce));
//! ```

use std::fmt;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::{debug, error};

use crate::error::{Result, TollgateError};
use crate::ratelimit::{AdmissionResult, Decision, Limiters};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Message used for plain quota denials.
pub const TOO_MANY_REQUESTS: &str = "Too many requests";

/// Derives the rate-limit identifier of a request from its headers.
pub type IdentifierSource = Arc<dyn Fn(&HeaderMap) -> String + Send + Sync>;

/// Body of a 429 response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionBody {
    pub error: String,
    pub retry_after: u64,
}

/// Add `X-RateLimit-Limit`, `X-RateLimit-Remaining` and `X-RateLimit-Reset`
/// (epoch seconds) to `headers`.
pub fn apply_headers(result: &AdmissionResult, headers: &mut HeaderMap) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(result.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(result.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(result.reset_at_secs()));
}

/// Build the 429 response for a denied result.
pub fn rejection(result: &AdmissionResult, retry_after_secs: u64) -> Response {
    let body = RejectionBody {
        error: result
            .error_reason
            .clone()
            .unwrap_or_else(|| TOO_MANY_REQUESTS.to_string()),
        retry_after: retry_after_secs,
    };

    let mut headers = HeaderMap::new();
    apply_headers(result, &mut headers);
    headers.insert(RETRY_AFTER, HeaderValue::from(retry_after_secs));

    (StatusCode::TOO_MANY_REQUESTS, headers, Json(body)).into_response()
}

/// The client address: first `X-Forwarded-For` hop, then `X-Real-IP`, then
/// `"unknown"`.
pub fn client_ip(headers: &HeaderMap) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|hop| !hop.is_empty());
    if let Some(hop) = forwarded {
        return hop.to_string();
    }

    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .unwrap_or("unknown")
        .to_string()
}

/// Middleware state: the policy to enforce and how to identify callers.
#[derive(Clone)]
pub struct RateLimitGuard {
    limiters: Arc<Limiters>,
    policy: String,
    identify: IdentifierSource,
}

impl fmt::Debug for RateLimitGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitGuard")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl RateLimitGuard {
    /// Guard for `policy`, identifying callers by [`client_ip`].
    ///
    /// Fails if the policy is not registered, so a typo surfaces at startup
    /// instead of on the first request.
    pub fn new(limiters: Arc<Limiters>, policy: &str) -> Result<Self> {
        if !limiters.contains(policy) {
            return Err(TollgateError::UnknownPolicy(policy.to_string()));
        }
        Ok(Self {
            limiters,
            policy: policy.to_string(),
            identify: Arc::new(client_ip),
        })
    }

    pub fn with_identifier<F>(mut self, identify: F) -> Self
    where
        F: Fn(&HeaderMap) -> String + Send + Sync + 'static,
    {
        self.identify = Arc::new(identify);
        self
    }

    pub fn policy(&self) -> &str {
        &self.policy
    }

    async fn decide(&self, headers: &HeaderMap) -> Result<Decision> {
        let identifier = (self.identify)(headers);
        self.limiters.check(&self.policy, &identifier).await
    }
}

/// Check the guard's policy before running the rest of the stack.
pub async fn enforce(
    State(guard): State<RateLimitGuard>,
    request: Request,
    next: Next,
) -> Response {
    let decision = match guard.decide(request.headers()).await {
        Ok(decision) => decision,
        Err(e) => {
            error!(policy = %guard.policy, error = %e, "Admission check failed, denying request");
            guard.limiters.fail_closed(&guard.policy)
        }
    };

    if !decision.result.allowed {
        debug!(
            policy = %guard.policy,
            retry_after = decision.retry_after_secs,
            "Request rejected"
        );
        return rejection(&decision.result, decision.retry_after_secs);
    }

    let mut response = next.run(request).await;
    apply_headers(&decision.result, response.headers_mut());
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BypassConfig, TollgateConfig};
    use crate::ratelimit::{MockClock, UNAVAILABLE_REASON};
    use axum::body::{to_bytes, Body};
    use axum::http;
    use axum::middleware;
    use axum::routing::post;
    use axum::Router;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tower::ServiceExt;

    const START: u64 = 1_700_000_000_000;

    fn limiters(clock: &MockClock) -> Arc<Limiters> {
        let config = TollgateConfig {
            bypass: BypassConfig {
                tokens: vec!["10.0.0.9".to_string()],
            },
            ..TollgateConfig::default()
        };
        Arc::new(Limiters::from_config_with_clock(&config, Arc::new(clock.clone())).unwrap())
    }

    fn app(guard: RateLimitGuard, hits: Arc<AtomicUsize>) -> Router {
        Router::new()
            .route(
                "/chat",
                post(move || {
                    let hits = hits.clone();
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        "ok"
                    }
                }),
            )
            .layer(middleware::from_fn_with_state(guard, enforce))
    }

    fn request(ip: &str) -> Request {
        http::Request::builder()
            .method("POST")
            .uri("/chat")
            .header("x-forwarded-for", ip)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn test_client_ip_resolution() {
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers), "unknown");

        headers.insert("x-real-ip", HeaderValue::from_static("192.0.2.7"));
        assert_eq!(client_ip(&headers), "192.0.2.7");

        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static(" 203.0.113.5 , 10.0.0.1"),
        );
        assert_eq!(client_ip(&headers), "203.0.113.5");
    }

    #[test]
    fn test_unknown_policy_rejected_at_construction() {
        let clock = MockClock::new(START);
        let err = RateLimitGuard::new(limiters(&clock), "nope").unwrap_err();
        assert!(matches!(err, TollgateError::UnknownPolicy(_)));
    }

    #[tokio::test]
    async fn test_rejection_headers_and_body() {
        let policy = crate::ratelimit::Policy::new("login", 5, 60, false).unwrap();
        let result = AdmissionResult::from_count(&policy, 6, START);
        let response = rejection(&result, 50);

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let headers = response.headers();
        assert_eq!(headers[X_RATELIMIT_LIMIT], "5");
        assert_eq!(headers[X_RATELIMIT_REMAINING], "0");
        assert_eq!(headers[X_RATELIMIT_RESET], "1700000060");
        assert_eq!(headers[RETRY_AFTER], "50");

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], TOO_MANY_REQUESTS);
        assert_eq!(json["retryAfter"], 50);
    }

    #[tokio::test]
    async fn test_denied_request_never_reaches_handler() {
        let clock = MockClock::new(START);
        let hits = Arc::new(AtomicUsize::new(0));
        let guard = RateLimitGuard::new(limiters(&clock), "aiChat").unwrap();
        let app = app(guard, hits.clone());

        for expected in (0..5).rev() {
            let response = app.clone().oneshot(request("203.0.113.5")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(
                response.headers()[X_RATELIMIT_REMAINING],
                expected.to_string().as_str()
            );
        }

        clock.advance(Duration::from_secs(10));
        let response = app.clone().oneshot(request("203.0.113.5")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[RETRY_AFTER], "50");
        assert_eq!(hits.load(Ordering::SeqCst), 5);

        // Other clients keep their own quota.
        let response = app.oneshot(request("198.51.100.1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_failed_check_denies_with_full_headers() {
        let clock = MockClock::new(START);
        let hits = Arc::new(AtomicUsize::new(0));
        let guard = RateLimitGuard {
            limiters: limiters(&clock),
            policy: "unregistered".to_string(),
            identify: Arc::new(client_ip),
        };
        let app = app(guard, hits.clone());

        let response = app.oneshot(request("203.0.113.5")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let headers = response.headers();
        assert_eq!(headers[X_RATELIMIT_LIMIT], "0");
        assert_eq!(headers[X_RATELIMIT_REMAINING], "0");
        assert_eq!(headers[X_RATELIMIT_RESET], "1700000000");
        assert_eq!(headers[RETRY_AFTER], "0");
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], UNAVAILABLE_REASON);
        assert_eq!(json["retryAfter"], 0);
    }

    #[tokio::test]
    async fn test_bypass_identifier_passes() {
        let clock = MockClock::new(START);
        let hits = Arc::new(AtomicUsize::new(0));
        let guard = RateLimitGuard::new(limiters(&clock), "aiChat").unwrap();
        let app = app(guard, hits.clone());

        for _ in 0..20 {
            let response = app.clone().oneshot(request("10.0.0.9")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()[X_RATELIMIT_REMAINING], "5");
        }
        assert_eq!(hits.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn test_custom_identifier_source() {
        let clock = MockClock::new(START);
        let hits = Arc::new(AtomicUsize::new(0));
        let guard = RateLimitGuard::new(limiters(&clock), "register")
            .unwrap()
            .with_identifier(|headers: &HeaderMap| {
                headers
                    .get("x-user-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string()
            });
        let app = app(guard, hits);

        for ip in ["198.51.100.1", "198.51.100.2", "198.51.100.3", "198.51.100.4"] {
            let request = http::Request::builder()
                .method("POST")
                .uri("/chat")
                .header("x-forwarded-for", ip)
                .header("x-user-id", "user-42")
                .body(Body::empty())
                .unwrap();
            let response = app.clone().oneshot(request).await.unwrap();
            if ip.ends_with('4') {
                assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
            } else {
                assert_eq!(response.status(), StatusCode::OK);
            }
        }
    }
}
