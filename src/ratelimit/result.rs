//! Admission decisions.

use serde::Serialize;

use super::policy::Policy;

/// Reason attached to denials produced when no counter store is usable.
pub const UNAVAILABLE_REASON: &str = "rate limiting temporarily unavailable";

/// The outcome of one admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionResult {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Requests left in the current window
    pub remaining: u64,
    /// The policy's quota per window
    pub limit: u64,
    /// Epoch milliseconds at which the window resets
    pub reset_at_ms: u64,
    /// Set when the decision was not made from a counter
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
}

impl AdmissionResult {
    /// Decision derived from a counter value.
    pub fn from_count(policy: &Policy, count: u64, window_start_ms: u64) -> Self {
        Self {
            allowed: count <= policy.max_requests,
            remaining: policy.max_requests.saturating_sub(count),
            limit: policy.max_requests,
            reset_at_ms: window_start_ms.saturating_add(policy.window_millis()),
            error_reason: None,
        }
    }

    /// Decision for a bypassed identifier; the full quota stays available.
    pub fn bypassed(policy: &Policy, now_ms: u64) -> Self {
        Self {
            allowed: true,
            remaining: policy.max_requests,
            limit: policy.max_requests,
            reset_at_ms: now_ms.saturating_add(policy.window_millis()),
            error_reason: None,
        }
    }

    /// Denial used whenever the limiter cannot decide.
    pub fn unavailable(policy: &Policy, now_ms: u64) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            limit: policy.max_requests,
            reset_at_ms: now_ms.saturating_add(policy.window_millis()),
            error_reason: Some(UNAVAILABLE_REASON.to_string()),
        }
    }

    /// Whole seconds until the window resets, rounded up.
    pub fn retry_after_secs(&self, now_ms: u64) -> u64 {
        self.reset_at_ms.saturating_sub(now_ms).div_ceil(1000)
    }

    /// The reset time in epoch seconds, rounded up.
    pub fn reset_at_secs(&self) -> u64 {
        self.reset_at_ms.div_ceil(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn login() -> Policy {
        Policy::new("login", 5, 60, false).unwrap()
    }

    #[test]
    fn test_from_count_at_and_over_limit() {
        let at_limit = AdmissionResult::from_count(&login(), 5, 1_000);
        assert!(at_limit.allowed);
        assert_eq!(at_limit.remaining, 0);
        assert_eq!(at_limit.reset_at_ms, 61_000);

        let over = AdmissionResult::from_count(&login(), 6, 1_000);
        assert!(!over.allowed);
        assert_eq!(over.remaining, 0);
        assert!(over.error_reason.is_none());
    }

    #[test]
    fn test_unavailable_denial() {
        let result = AdmissionResult::unavailable(&login(), 10_000);
        assert!(!result.allowed);
        assert_eq!(result.remaining, 0);
        assert_eq!(result.reset_at_ms, 70_000);
        assert_eq!(result.error_reason.as_deref(), Some(UNAVAILABLE_REASON));
    }

    #[test]
    fn test_bypassed_keeps_full_quota() {
        let result = AdmissionResult::bypassed(&login(), 0);
        assert!(result.allowed);
        assert_eq!(result.remaining, 5);
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let result = AdmissionResult::from_count(&login(), 6, 0);
        assert_eq!(result.retry_after_secs(10_000), 50);
        assert_eq!(result.retry_after_secs(10_001), 50);
        assert_eq!(result.retry_after_secs(59_999), 1);
        assert_eq!(result.retry_after_secs(60_000), 0);
        assert_eq!(result.retry_after_secs(120_000), 0);
    }

    #[test]
    fn test_serializes_camel_case() {
        let json = serde_json::to_value(AdmissionResult::from_count(&login(), 1, 0)).unwrap();
        assert_eq!(json["resetAtMs"], 60_000);
        assert_eq!(json["remaining"], 4);
        assert!(json.get("errorReason").is_none());
    }
}
