//! Rate limit policies and their configuration format.
//!
//! Policies are read once at process start, either from the main
//! configuration or from a dedicated YAML file, and are immutable afterwards.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TollgateError};

/// Longest accepted window, one year.
pub const MAX_WINDOW_SECS: u64 = 365 * 24 * 3600;

/// An immutable, validated description of one named rate limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    /// Policy name, also the prefix of every rate key it counts
    pub name: String,
    /// Requests admitted per window
    pub max_requests: u64,
    /// Window length in seconds
    pub window_secs: u64,
    /// Whether identifiers in the bypass registry skip counting
    pub allow_bypass: bool,
}

impl Policy {
    /// Create a policy, rejecting zero quotas, empty names and windows outside
    /// one second to [`MAX_WINDOW_SECS`].
    pub fn new(
        name: impl Into<String>,
        max_requests: u64,
        window_secs: u64,
        allow_bypass: bool,
    ) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(TollgateError::Config("policy name must not be empty".into()));
        }
        if max_requests == 0 {
            return Err(TollgateError::Config(format!(
                "policy '{}': max_requests must be at least 1",
                name
            )));
        }
        if window_secs == 0 {
            return Err(TollgateError::Config(format!(
                "policy '{}': window must be at least 1 second",
                name
            )));
        }
        if window_secs > MAX_WINDOW_SECS {
            return Err(TollgateError::Config(format!(
                "policy '{}': window of {}s exceeds the maximum of {}s",
                name, window_secs, MAX_WINDOW_SECS
            )));
        }

        Ok(Self {
            name,
            max_requests,
            window_secs,
            allow_bypass,
        })
    }

    /// The window length.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// The window length in milliseconds.
    pub fn window_millis(&self) -> u64 {
        self.window_secs.saturating_mul(1000)
    }
}

/// Time unit shorthand for policy windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Length of one unit in seconds.
    pub fn as_secs(&self) -> u64 {
        match self {
            TimeUnit::Second => 1,
            TimeUnit::Minute => 60,
            TimeUnit::Hour => 3600,
            TimeUnit::Day => 86400,
        }
    }
}

/// A policy as written in configuration.
///
/// The window is given either as `window_secs` or as a `unit`, not both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub name: String,
    pub max_requests: u64,
    #[serde(default)]
    pub window_secs: Option<u64>,
    #[serde(default)]
    pub unit: Option<TimeUnit>,
    #[serde(default)]
    pub allow_bypass: bool,
}

impl PolicyRule {
    /// Shorthand used for the built-in defaults.
    pub fn new(name: &str, max_requests: u64, window_secs: u64, allow_bypass: bool) -> Self {
        Self {
            name: name.to_string(),
            max_requests,
            window_secs: Some(window_secs),
            unit: None,
            allow_bypass,
        }
    }

    /// Validate the rule into a [`Policy`].
    pub fn to_policy(&self) -> Result<Policy> {
        let window_secs = match (self.window_secs, self.unit) {
            (Some(secs), None) => secs,
            (None, Some(unit)) => unit.as_secs(),
            (Some(_), Some(_)) => {
                return Err(TollgateError::Config(format!(
                    "policy '{}': set either window_secs or unit, not both",
                    self.name
                )))
            }
            (None, None) => {
                return Err(TollgateError::Config(format!(
                    "policy '{}': missing window_secs or unit",
                    self.name
                )))
            }
        };

        Policy::new(self.name.clone(), self.max_requests, window_secs, self.allow_bypass)
    }
}

/// The complete set of policies registered at startup.
#[derive(Debug, Clone, Default)]
pub struct PolicySet {
    policies: Vec<Policy>,
}

#[derive(Debug, Deserialize)]
struct PolicyFile {
    policies: Vec<PolicyRule>,
}

impl PolicySet {
    /// Build a policy set, validating every rule and rejecting duplicate names.
    pub fn from_rules(rules: &[PolicyRule]) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut policies = Vec::with_capacity(rules.len());

        for rule in rules {
            let policy = rule.to_policy()?;
            if !seen.insert(policy.name.clone()) {
                return Err(TollgateError::Config(format!(
                    "policy '{}' is defined more than once",
                    policy.name
                )));
            }
            policies.push(policy);
        }

        Ok(Self { policies })
    }

    /// Load policies from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit policies");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load policies from a YAML string with a top-level `policies` list.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: PolicyFile = serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse policies: {}", e)))?;
        Self::from_rules(&file.policies)
    }

    /// The policies the application ships with.
    pub fn default_rules() -> Vec<PolicyRule> {
        vec![
            PolicyRule::new("login", 5, 300, false),
            PolicyRule::new("register", 3, 3600, false),
            PolicyRule::new("aiChat", 5, 60, true),
            PolicyRule::new("postCreate", 5, 60, true),
            PolicyRule::new("fileUpload", 10, 60, true),
        ]
    }

    /// Look up a policy by name.
    pub fn get(&self, name: &str) -> Option<&Policy> {
        self.policies.iter().find(|p| p.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Policy> {
        self.policies.iter()
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}
