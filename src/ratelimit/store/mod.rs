//! Counter stores.
//!
//! A counter store owns the per-key counts behind every admission decision.
//! [`MemoryStore`] keeps them in-process; [`RemoteStore`] keeps them in a
//! shared Redis-compatible service so every instance sees the same counts.

mod memory;
mod remote;

use std::time::Duration;

use async_trait::async_trait;

use super::key::RateKey;
use crate::error::Result;

pub use memory::MemoryStore;
pub use remote::{
    ConnectionStatus, RedisConnection, RedisConnector, RemoteConnection, RemoteConnector,
    RemoteStore, RemoteStoreConfig,
};

/// A window length in milliseconds, saturating at `u64::MAX`.
pub(crate) fn window_millis(window: Duration) -> u64 {
    u64::try_from(window.as_millis()).unwrap_or(u64::MAX)
}

/// One counter as held by a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterEntry {
    /// Increments applied in the current window
    pub count: u64,
    /// Epoch milliseconds at which the current window started
    pub window_start_ms: u64,
}

/// The state of a counter right after an increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// Count including the increment that produced this snapshot
    pub count: u64,
    /// Epoch milliseconds at which the current window started
    pub window_start_ms: u64,
    /// Milliseconds until the window expires
    pub ttl_remaining_ms: u64,
}

/// Atomic increment-with-expiry storage.
///
/// Implementations must apply concurrent increments on the same key exactly
/// once each.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Count one request against `key` and return the resulting counter.
    async fn increment(&self, key: &RateKey, window: Duration) -> Result<CounterSnapshot>;

    /// Read the live counter for `key` without modifying it.
    async fn peek(&self, key: &RateKey, window: Duration) -> Result<Option<CounterEntry>>;
}
