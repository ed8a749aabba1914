//! Per-call choice of counter store.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{trace, warn};

use super::clock::Clock;
use super::key::RateKey;
use super::store::{
    CounterEntry, CounterSnapshot, CounterStore, MemoryStore, RedisConnector, RemoteStore,
    RemoteStoreConfig,
};
use crate::config::StoreConfig;
use crate::error::Result;

/// Which store answered a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Remote,
    Memory,
}

/// Result of routing an increment to a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// A store applied the increment.
    Counted {
        snapshot: CounterSnapshot,
        backend: Backend,
    },
    /// No store could be used; the caller must deny.
    Unavailable,
}

/// Routes counter operations to the remote store when it is usable and to
/// the in-process store otherwise, unless remote-only mode forbids it.
pub struct StoreSelector {
    remote: Option<Arc<dyn CounterStore>>,
    memory: Arc<MemoryStore>,
    remote_only: bool,
}

impl fmt::Debug for StoreSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreSelector")
            .field("remote_configured", &self.remote.is_some())
            .field("remote_only", &self.remote_only)
            .field("memory_entries", &self.memory.len())
            .finish()
    }
}

impl StoreSelector {
    pub fn new(
        remote: Option<Arc<dyn CounterStore>>,
        memory: Arc<MemoryStore>,
        remote_only: bool,
    ) -> Self {
        Self {
            remote,
            memory,
            remote_only,
        }
    }

    /// Build the selector described by the store configuration.
    ///
    /// An invalid remote URL is a configuration error; an unreachable remote
    /// is not detected here because connections are opened lazily.
    pub fn from_config(config: &StoreConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let memory = Arc::new(MemoryStore::with_max_entry_age(
            clock.clone(),
            Duration::from_secs(config.max_entry_age_secs),
        ));

        let remote = match config.remote_url.as_deref().filter(|url| !url.is_empty()) {
            Some(url) => {
                let connector = RedisConnector::open(url)?;
                let store = RemoteStore::new(connector, RemoteStoreConfig::from(config), clock);
                Some(Arc::new(store) as Arc<dyn CounterStore>)
            }
            None => None,
        };

        if remote.is_none() && config.remote_only {
            warn!("Remote-only mode is enabled without a remote store; every check will be denied");
        }

        Ok(Self::new(remote, memory, config.remote_only))
    }

    /// The in-process store, e.g. to start its sweeper.
    pub fn memory(&self) -> &Arc<MemoryStore> {
        &self.memory
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    pub fn remote_only(&self) -> bool {
        self.remote_only
    }

    /// Count one request against `key`.
    pub async fn increment(&self, key: &RateKey, window: Duration) -> StoreOutcome {
        if let Some(remote) = &self.remote {
            match remote.increment(key, window).await {
                Ok(snapshot) => {
                    return StoreOutcome::Counted {
                        snapshot,
                        backend: Backend::Remote,
                    }
                }
                Err(e) => warn!(
                    key = %key,
                    error = %e,
                    remote_only = self.remote_only,
                    "Remote counter store failed"
                ),
            }
        }

        if self.remote_only {
            return StoreOutcome::Unavailable;
        }

        match self.memory.increment(key, window).await {
            Ok(snapshot) => {
                trace!(key = %key, count = snapshot.count, "Counted in memory store");
                StoreOutcome::Counted {
                    snapshot,
                    backend: Backend::Memory,
                }
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Memory counter store failed");
                StoreOutcome::Unavailable
            }
        }
    }

    /// Read the live counter for `key` from whichever store would answer.
    pub async fn peek(&self, key: &RateKey, window: Duration) -> Option<CounterEntry> {
        if let Some(remote) = &self.remote {
            match remote.peek(key, window).await {
                Ok(entry) => return entry,
                Err(e) => warn!(key = %key, error = %e, "Remote counter store peek failed"),
            }
        }

        if self.remote_only {
            return None;
        }
        self.memory.peek(key, window).await.ok().flatten()
    }
}

impl From<&StoreConfig> for RemoteStoreConfig {
    fn from(config: &StoreConfig) -> Self {
        Self {
            key_prefix: config.key_prefix.clone(),
            command_timeout: Duration::from_millis(config.command_timeout_ms),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            reconnect_attempts: config.reconnect_attempts,
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
            unavailable_cooldown: Duration::from_millis(config.unavailable_cooldown_ms),
        }
    }
}
