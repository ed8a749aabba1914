//! Rate key generation.

/// The key a quota count is tracked against.
///
/// Composed of the policy name and the caller's identifier as
/// `"{policy}:{identifier}"`. The identifier is opaque: it is never parsed,
/// and an empty identifier is a key like any other.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateKey(String);

impl RateKey {
    /// Create the key for a policy and identifier.
    pub fn new(policy: &str, identifier: &str) -> Self {
        let mut key = String::with_capacity(policy.len() + 1 + identifier.len());
        key.push_str(policy);
        key.push(':');
        key.push_str(identifier);
        Self(key)
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_key_format() {
        let key = RateKey::new("login", "ip:1.2.3.4");
        assert_eq!(key.as_str(), "login:ip:1.2.3.4");
        assert_eq!(key.to_string(), "login:ip:1.2.3.4");
    }

    #[test]
    fn test_rate_key_equality() {
        assert_eq!(RateKey::new("aiChat", "user-7"), RateKey::new("aiChat", "user-7"));
        assert_ne!(RateKey::new("aiChat", "user-7"), RateKey::new("postCreate", "user-7"));
    }

    #[test]
    fn test_empty_identifier_is_still_a_key() {
        assert_eq!(RateKey::new("login", "").as_str(), "login:");
    }
}
