//! Per-policy admission checks.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, error, trace, warn};

use super::bypass::BypassRegistry;
use super::clock::Clock;
use super::key::RateKey;
use super::policy::Policy;
use super::result::AdmissionResult;
use super::selector::{StoreOutcome, StoreSelector};
use super::store::CounterEntry;

/// The admission check for one policy.
///
/// Holds only the policy and shared handles; all counting happens in the
/// stores behind the selector. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct Limiter {
    policy: Arc<Policy>,
    selector: Arc<StoreSelector>,
    bypass: Arc<BypassRegistry>,
    clock: Arc<dyn Clock>,
}

impl Limiter {
    pub fn new(
        policy: Policy,
        selector: Arc<StoreSelector>,
        bypass: Arc<BypassRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            policy: Arc::new(policy),
            selector,
            bypass,
            clock,
        }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Count one request for `identifier` and decide whether it is admitted.
    ///
    /// Never fails: if no store can record the request, or anything on the
    /// way panics, the result is a denial carrying an error reason.
    pub async fn check(&self, identifier: &str) -> AdmissionResult {
        let now = self.clock.now_millis();

        if self.policy.allow_bypass && self.bypass.has_bypass(identifier) {
            trace!(policy = %self.policy.name, "Bypass identifier admitted");
            return AdmissionResult::bypassed(&self.policy, now);
        }

        let key = RateKey::new(&self.policy.name, identifier);
        let outcome = AssertUnwindSafe(self.selector.increment(&key, self.policy.window()))
            .catch_unwind()
            .await;

        match outcome {
            Ok(StoreOutcome::Counted { snapshot, backend }) => {
                let result = AdmissionResult::from_count(
                    &self.policy,
                    snapshot.count,
                    snapshot.window_start_ms,
                );
                if !result.allowed {
                    debug!(
                        key = %key,
                        count = snapshot.count,
                        limit = self.policy.max_requests,
                        backend = ?backend,
                        "Rate limit exceeded"
                    );
                }
                result
            }
            Ok(StoreOutcome::Unavailable) => {
                warn!(key = %key, "No counter store available, denying request");
                AdmissionResult::unavailable(&self.policy, now)
            }
            Err(_) => {
                error!(key = %key, "Rate limit check panicked, denying request");
                AdmissionResult::unavailable(&self.policy, now)
            }
        }
    }

    /// Seconds until `identifier` may retry, from a fresh check.
    ///
    /// The check counts against the quota like any other.
    pub async fn retry_after_secs(&self, identifier: &str) -> u64 {
        let result = self.check(identifier).await;
        result.retry_after_secs(self.clock.now_millis())
    }

    /// The live counter for `identifier`, without counting a request.
    pub async fn peek(&self, identifier: &str) -> Option<CounterEntry> {
        let key = RateKey::new(&self.policy.name, identifier);
        self.selector.peek(&key, self.policy.window()).await
    }
}
