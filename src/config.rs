//! Configuration management for Tollgate.
//!
//! Settings are layered: built-in defaults, then an optional YAML file, then
//! environment variables prefixed with `TOLLGATE_` using `__` between
//! sections, e.g.
//!
//! ```bash
//! export TOLLGATE_STORE__REMOTE_URL=redis://cache:6379/
//! export TOLLGATE_STORE__REMOTE_ONLY=true
//! export TOLLGATE_BYPASS__TOKENS=svc-indexer,svc-backup
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::Result;
use crate::ratelimit::{PolicyRule, PolicySet};

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Identifiers that skip counting on policies allowing bypass
    #[serde(default)]
    pub bypass: BypassConfig,

    /// Inline policy definitions
    #[serde(default = "PolicySet::default_rules")]
    pub policies: Vec<PolicyRule>,

    /// Optional YAML file with a `policies` list; replaces inline policies
    #[serde(default)]
    pub policies_path: Option<String>,
}

impl Default for TollgateConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            store: StoreConfig::default(),
            bypass: BypassConfig::default(),
            policies: PolicySet::default_rules(),
            policies_path: None,
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Connection URL of the shared store; unset means memory only
    #[serde(default)]
    pub remote_url: Option<String>,

    /// Deny instead of falling back to memory when the remote store fails
    #[serde(default)]
    pub remote_only: bool,

    /// Prefix for keys written to the remote store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// How long to stop trying the remote store after reconnects fail
    #[serde(default = "default_unavailable_cooldown_ms")]
    pub unavailable_cooldown_ms: u64,

    /// Memory store sweep interval
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Memory store entries older than this are swept
    #[serde(default = "default_max_entry_age_secs")]
    pub max_entry_age_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            remote_url: None,
            remote_only: false,
            key_prefix: default_key_prefix(),
            command_timeout_ms: default_command_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect_attempts: default_reconnect_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            unavailable_cooldown_ms: default_unavailable_cooldown_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_entry_age_secs: default_max_entry_age_secs(),
        }
    }
}

fn default_key_prefix() -> String {
    "tollgate:".to_string()
}

fn default_command_timeout_ms() -> u64 {
    2000
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

fn default_reconnect_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    50
}

fn default_backoff_max_ms() -> u64 {
    500
}

fn default_unavailable_cooldown_ms() -> u64 {
    5000
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_max_entry_age_secs() -> u64 {
    3600
}

/// Bypass configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BypassConfig {
    /// A list, or one comma-separated string as given in the environment
    #[serde(default, deserialize_with = "token_list")]
    pub tokens: Vec<String>,
}

/// Accepts `"a, b"`, `["a", "b"]` and bare scalars such as `12345`.
fn token_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_any(TokenVisitor)
}

struct Tokens(Vec<String>);

impl<'de> Deserialize<'de> for Tokens {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(TokenVisitor).map(Tokens)
    }
}

struct TokenVisitor;

impl<'de> Visitor<'de> for TokenVisitor {
    type Value = Vec<String>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a list of tokens or a comma-separated string")
    }

    fn visit_str<E: de::Error>(self, value: &str) -> std::result::Result<Self::Value, E> {
        Ok(value
            .split(',')
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn visit_i64<E: de::Error>(self, value: i64) -> std::result::Result<Self::Value, E> {
        Ok(vec![value.to_string()])
    }

    fn visit_u64<E: de::Error>(self, value: u64) -> std::result::Result<Self::Value, E> {
        Ok(vec![value.to_string()])
    }

    fn visit_bool<E: de::Error>(self, value: bool) -> std::result::Result<Self::Value, E> {
        Ok(vec![value.to_string()])
    }

    fn visit_unit<E: de::Error>(self) -> std::result::Result<Self::Value, E> {
        Ok(Vec::new())
    }

    fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut tokens = Vec::new();
        while let Some(Tokens(more)) = seq.next_element()? {
            tokens.extend(more);
        }
        Ok(tokens)
    }
}

/// `TOLLGATE_` variables with `__` between sections.
///
/// Values stay strings; scalar fields are converted on deserialization and
/// `bypass.tokens` is split by [`token_list`].
fn environment() -> Environment {
    Environment::with_prefix("TOLLGATE")
        .prefix_separator("_")
        .separator("__")
}

impl TollgateConfig {
    /// Load configuration from defaults, an optional file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, environment())
    }

    fn load_with_env(path: Option<&Path>, env: Environment) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml).required(true));
        }

        let config = builder.add_source(env).build()?;
        Ok(config.try_deserialize()?)
    }

    /// Load configuration from a YAML string, without environment overrides.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?;
        Ok(config.try_deserialize()?)
    }

    /// The validated policy set, from `policies_path` when set.
    pub fn policy_set(&self) -> Result<PolicySet> {
        match &self.policies_path {
            Some(path) => PolicySet::from_file(path),
            None => PolicySet::from_rules(&self.policies),
        }
    }
}
