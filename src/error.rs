//! Error types for the Tollgate admission layer.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration-related errors (invalid policy, unreadable config file)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A check was requested for a policy that was never registered
    #[error("Unknown rate limit policy: {0}")]
    UnknownPolicy(String),

    /// The counter store cannot currently serve requests
    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(String),

    /// A counter store round trip exceeded its deadline
    #[error("Counter store operation timed out after {0:?}")]
    Timeout(Duration),

    /// Errors reported by the Redis client
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for TollgateError {
    fn from(err: config::ConfigError) -> Self {
        TollgateError::Config(err.to_string())
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
