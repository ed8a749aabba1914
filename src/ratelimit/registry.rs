//! The set of limiters registered at startup.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use super::bypass::BypassRegistry;
use super::clock::{Clock, SystemClock};
use super::limiter::Limiter;
use super::policy::PolicySet;
use super::result::{AdmissionResult, UNAVAILABLE_REASON};
use super::selector::StoreSelector;
use crate::config::TollgateConfig;
use crate::error::{Result, TollgateError};

/// A check result together with the retry hint for the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub result: AdmissionResult,
    /// Seconds until the window resets
    pub retry_after_secs: u64,
}

#[derive(Debug, Default)]
struct PolicyCounters {
    allowed: AtomicU64,
    denied: AtomicU64,
}

/// Admission totals for one policy since startup.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyStats {
    pub policy: String,
    pub allowed: u64,
    pub denied: u64,
    /// Share of denied checks in percent
    pub block_rate: f64,
}

/// Every limiter in the process, keyed by policy name.
#[derive(Debug)]
pub struct Limiters {
    limiters: HashMap<String, Limiter>,
    counters: HashMap<String, PolicyCounters>,
    selector: Arc<StoreSelector>,
    clock: Arc<dyn Clock>,
}

impl Limiters {
    /// Register one limiter per policy, all sharing one selector and bypass
    /// registry.
    pub fn new(
        policies: &PolicySet,
        selector: Arc<StoreSelector>,
        bypass: Arc<BypassRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut limiters = HashMap::with_capacity(policies.len());
        let mut counters = HashMap::with_capacity(policies.len());

        for policy in policies.iter() {
            info!(
                policy = %policy.name,
                max_requests = policy.max_requests,
                window_secs = policy.window_secs,
                allow_bypass = policy.allow_bypass,
                "Registered rate limit policy"
            );
            counters.insert(policy.name.clone(), PolicyCounters::default());
            limiters.insert(
                policy.name.clone(),
                Limiter::new(policy.clone(), selector.clone(), bypass.clone(), clock.clone()),
            );
        }

        Self {
            limiters,
            counters,
            selector,
            clock,
        }
    }

    /// Build everything from configuration using the system clock.
    pub fn from_config(config: &TollgateConfig) -> Result<Self> {
        Self::from_config_with_clock(config, Arc::new(SystemClock::new()))
    }

    pub fn from_config_with_clock(config: &TollgateConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let policies = config.policy_set()?;
        let selector = Arc::new(StoreSelector::from_config(&config.store, clock.clone())?);
        let bypass = Arc::new(BypassRegistry::new(&config.bypass.tokens));

        info!(
            policies = policies.len(),
            bypass_tokens = bypass.len(),
            remote = selector.has_remote(),
            remote_only = selector.remote_only(),
            "Admission control configured"
        );

        Ok(Self::new(&policies, selector, bypass, clock))
    }

    /// Check `identifier` against the named policy.
    pub async fn check(&self, policy: &str, identifier: &str) -> Result<Decision> {
        let limiter = self
            .limiters
            .get(policy)
            .ok_or_else(|| TollgateError::UnknownPolicy(policy.to_string()))?;

        let result = limiter.check(identifier).await;
        if let Some(counters) = self.counters.get(policy) {
            let counter = if result.allowed {
                &counters.allowed
            } else {
                &counters.denied
            };
            counter.fetch_add(1, Ordering::Relaxed);
        }

        let retry_after_secs = result.retry_after_secs(self.clock.now_millis());
        Ok(Decision {
            result,
            retry_after_secs,
        })
    }

    /// The denial to use when a check for `policy` could not be made.
    ///
    /// Known policies get their own limit and window; unknown ones report a
    /// zero limit resetting now.
    pub fn fail_closed(&self, policy: &str) -> Decision {
        let now = self.clock.now_millis();
        let result = match self.limiters.get(policy) {
            Some(limiter) => AdmissionResult::unavailable(limiter.policy(), now),
            None => AdmissionResult {
                allowed: false,
                remaining: 0,
                limit: 0,
                reset_at_ms: now,
                error_reason: Some(UNAVAILABLE_REASON.to_string()),
            },
        };
        let retry_after_secs = result.retry_after_secs(now);
        Decision {
            result,
            retry_after_secs,
        }
    }

    pub fn get(&self, policy: &str) -> Option<&Limiter> {
        self.limiters.get(policy)
    }

    pub fn contains(&self, policy: &str) -> bool {
        self.limiters.contains_key(policy)
    }

    pub fn selector(&self) -> &Arc<StoreSelector> {
        &self.selector
    }

    /// Admission totals per policy, sorted by policy name.
    pub fn stats(&self) -> Vec<PolicyStats> {
        let mut stats: Vec<PolicyStats> = self
            .counters
            .iter()
            .map(|(policy, counters)| {
                let allowed = counters.allowed.load(Ordering::Relaxed);
                let denied = counters.denied.load(Ordering::Relaxed);
                let total = (allowed + denied).max(1);
                PolicyStats {
                    policy: policy.clone(),
                    allowed,
                    denied,
                    block_rate: denied as f64 / total as f64 * 100.0,
                }
            })
            .collect();
        stats.sort_by(|a, b| a.policy.cmp(&b.policy));
        stats
    }
}
