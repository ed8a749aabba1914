//! Pre-authorized identifiers that skip counting.

use std::collections::HashSet;

/// A fixed set of bypass tokens loaded once at startup.
///
/// Membership only matters for policies that allow bypass. Rotating tokens
/// means redeploying with new configuration.
#[derive(Debug, Clone, Default)]
pub struct BypassRegistry {
    tokens: HashSet<String>,
}

impl BypassRegistry {
    /// Build a registry from individual tokens. Blank tokens are ignored.
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tokens = tokens
            .into_iter()
            .map(|t| t.as_ref().trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        Self { tokens }
    }

    /// Build a registry from a comma-separated list such as `"svc-a, svc-b"`.
    pub fn from_list(list: &str) -> Self {
        Self::new(list.split(','))
    }

    /// Whether the identifier is pre-authorized.
    pub fn has_bypass(&self, identifier: &str) -> bool {
        self.tokens.contains(identifier)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}
