//! In-process counter store.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{window_millis, CounterEntry, CounterSnapshot, CounterStore};
use crate::error::Result;
use crate::ratelimit::clock::Clock;
use crate::ratelimit::key::RateKey;

/// Entries whose window started longer ago than this are swept.
pub const DEFAULT_MAX_ENTRY_AGE: Duration = Duration::from_secs(3600);

/// Fixed-window counters kept in a sharded concurrent map.
///
/// Each increment is a read-modify-write under the lock of the key's shard,
/// so unrelated keys never serialize on a single mutex.
#[derive(Debug)]
pub struct MemoryStore {
    entries: DashMap<String, CounterEntry>,
    clock: Arc<dyn Clock>,
    max_entry_age: Duration,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_max_entry_age(clock, DEFAULT_MAX_ENTRY_AGE)
    }

    /// Create an empty store with a custom sweep age.
    pub fn with_max_entry_age(clock: Arc<dyn Clock>, max_entry_age: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            max_entry_age,
        }
    }

    fn increment_at(&self, key: &RateKey, window_ms: u64, now: u64) -> CounterSnapshot {
        let entry = match self.entries.entry(key.as_str().to_owned()) {
            Entry::Occupied(mut occupied) => {
                let counter = occupied.get_mut();
                if now.saturating_sub(counter.window_start_ms) >= window_ms {
                    *counter = CounterEntry {
                        count: 1,
                        window_start_ms: now,
                    };
                } else {
                    counter.count += 1;
                }
                *counter
            }
            Entry::Vacant(vacant) => *vacant.insert(CounterEntry {
                count: 1,
                window_start_ms: now,
            }),
        };

        let window_end = entry.window_start_ms.saturating_add(window_ms);
        CounterSnapshot {
            count: entry.count,
            window_start_ms: entry.window_start_ms,
            ttl_remaining_ms: window_end.saturating_sub(now),
        }
    }

    /// Drop entries whose window started more than the max entry age ago.
    ///
    /// Returns the number of removed entries.
    pub fn sweep(&self) -> usize {
        let cutoff = self
            .clock
            .now_millis()
            .saturating_sub(self.max_entry_age.as_millis() as u64);
        let before = self.entries.len();

        self.entries.retain(|_, entry| entry.window_start_ms >= cutoff);

        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            info!(removed, remaining = self.entries.len(), "Swept stale rate limit counters");
        }
        removed
    }

    /// Run [`sweep`](Self::sweep) on a fixed interval in the background.
    ///
    /// The task ends on its own once the store has been dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.upgrade() {
                    Some(store) => {
                        store.sweep();
                    }
                    None => {
                        debug!("Memory store dropped, stopping sweeper");
                        break;
                    }
                }
            }
        })
    }

    /// Number of tracked counters, live or stale.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment(&self, key: &RateKey, window: Duration) -> Result<CounterSnapshot> {
        let now = self.clock.now_millis();
        Ok(self.increment_at(key, window_millis(window), now))
    }

    async fn peek(&self, key: &RateKey, window: Duration) -> Result<Option<CounterEntry>> {
        let now = self.clock.now_millis();
        let window_ms = window_millis(window);

        Ok(self
            .entries
            .get(key.as_str())
            .map(|entry| *entry)
            .filter(|entry| now.saturating_sub(entry.window_start_ms) < window_ms))
    }
}
