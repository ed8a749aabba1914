//! Shared counter store backed by a Redis-compatible service.
//!
//! The store talks to the service through the narrow [`RemoteConnector`] /
//! [`RemoteConnection`] pair so tests can swap in a fake without a network.
//!
//! ## Connection lifecycle
//!
//! The connection is acquired lazily on first use and cached. A single caller
//! performs each acquisition while concurrent callers wait for its outcome,
//! so a burst of requests after an outage opens one connection, not one per
//! request. Acquisition makes a bounded number of attempts with capped
//! backoff; when all of them fail the store reports itself unavailable until
//! a cooldown elapses, after which the next call tries again.
//!
//! Any command error or timeout discards the cached connection.
//!
//! ## Expiry semantics
//!
//! Every increment re-applies the expiry with the full window length, so the
//! window is anchored to the *last* increment rather than the first. Steady
//! traffic that never pauses for a full window keeps extending its own
//! window.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use redis::aio::MultiplexedConnection;
use tokio::sync::watch;
use tokio::time::error::Elapsed;
use tracing::{debug, info, warn};

use super::{window_millis, CounterEntry, CounterSnapshot, CounterStore};
use crate::error::{Result, TollgateError};
use crate::ratelimit::clock::Clock;
use crate::ratelimit::key::RateKey;

/// Opens connections to the remote counter service.
#[async_trait]
pub trait RemoteConnector: Send + Sync + 'static {
    type Connection: RemoteConnection;

    /// Open a new connection.
    async fn connect(&self) -> Result<Self::Connection>;
}

/// The operations the remote store needs from a connection.
///
/// Connections are cloned for every call and must support concurrent use.
#[async_trait]
pub trait RemoteConnection: Clone + Send + Sync + 'static {
    /// Increment `key` and set its expiry to `window` without an intervening
    /// round trip. Returns the new count and the remaining TTL in milliseconds.
    async fn increment_with_expiry(&self, key: &str, window: Duration) -> Result<(u64, i64)>;

    /// Read the count and remaining TTL of `key`, if it exists.
    async fn peek(&self, key: &str) -> Result<Option<(u64, i64)>>;
}

/// Redis client adapter.
#[derive(Debug, Clone)]
pub struct RedisConnector {
    client: redis::Client,
}

impl RedisConnector {
    /// Parse a connection URL such as `redis://127.0.0.1:6379/`.
    ///
    /// No network traffic happens until the first connection is requested.
    pub fn open(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| TollgateError::Config(format!("invalid remote store URL: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RemoteConnector for RedisConnector {
    type Connection = RedisConnection;

    async fn connect(&self) -> Result<RedisConnection> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        Ok(RedisConnection { conn })
    }
}

/// A multiplexed Redis connection; clones share one socket and pipeline
/// commands concurrently.
#[derive(Clone)]
pub struct RedisConnection {
    conn: MultiplexedConnection,
}

#[async_trait]
impl RemoteConnection for RedisConnection {
    async fn increment_with_expiry(&self, key: &str, window: Duration) -> Result<(u64, i64)> {
        let mut conn = self.conn.clone();
        let (count, ttl): (u64, i64) = redis::pipe()
            .atomic()
            .incr(key, 1u64)
            .pexpire(key, i64::try_from(window.as_millis()).unwrap_or(i64::MAX))
            .ignore()
            .pttl(key)
            .query_async(&mut conn)
            .await?;
        Ok((count, ttl))
    }

    async fn peek(&self, key: &str) -> Result<Option<(u64, i64)>> {
        let mut conn = self.conn.clone();
        let (count, ttl): (Option<u64>, i64) = redis::pipe()
            .get(key)
            .pttl(key)
            .query_async(&mut conn)
            .await?;
        Ok(count.map(|count| (count, ttl)))
    }
}

/// Timeouts and retry bounds for the remote store.
#[derive(Debug, Clone)]
pub struct RemoteStoreConfig {
    /// Prepended to every rate key
    pub key_prefix: String,
    /// Deadline for a single command round trip
    pub command_timeout: Duration,
    /// Deadline for a single connection attempt
    pub connect_timeout: Duration,
    /// Connection attempts per acquisition
    pub reconnect_attempts: u32,
    /// Backoff after the first failed attempt, doubled per attempt
    pub backoff_base: Duration,
    /// Upper bound on backoff between attempts
    pub backoff_max: Duration,
    /// How long the store stays unavailable after a failed acquisition
    pub unavailable_cooldown: Duration,
}

impl Default for RemoteStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "tollgate:".to_string(),
            command_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(2),
            reconnect_attempts: 3,
            backoff_base: Duration::from_millis(50),
            backoff_max: Duration::from_millis(500),
            unavailable_cooldown: Duration::from_secs(5),
        }
    }
}

/// Externally visible connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Unavailable,
}

enum ConnectionState<C> {
    Disconnected,
    /// An acquisition is in flight. Replacing this state drops the sender,
    /// which wakes every waiter.
    Connecting(watch::Sender<()>),
    Connected { conn: C, generation: u64 },
    Unavailable { retry_at: Instant },
}

enum Step<C> {
    Ready(C, u64),
    Wait(watch::Receiver<()>),
    Establish,
    Skip,
}

/// Counter store shared by every instance through a remote service.
pub struct RemoteStore<C: RemoteConnector> {
    connector: C,
    config: RemoteStoreConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<ConnectionState<C::Connection>>,
    generations: AtomicU64,
}

impl<C: RemoteConnector> std::fmt::Debug for RemoteStore<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStore")
            .field("config", &self.config)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl<C: RemoteConnector> RemoteStore<C> {
    /// Create a store; no connection is opened until first use.
    pub fn new(connector: C, config: RemoteStoreConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            connector,
            config,
            clock,
            state: Mutex::new(ConnectionState::Disconnected),
            generations: AtomicU64::new(0),
        }
    }

    /// Current connection state.
    pub fn status(&self) -> ConnectionStatus {
        match &*self.state.lock() {
            ConnectionState::Disconnected => ConnectionStatus::Disconnected,
            ConnectionState::Connecting(_) => ConnectionStatus::Connecting,
            ConnectionState::Connected { .. } => ConnectionStatus::Connected,
            ConnectionState::Unavailable { retry_at } if Instant::now() < *retry_at => {
                ConnectionStatus::Unavailable
            }
            ConnectionState::Unavailable { .. } => ConnectionStatus::Disconnected,
        }
    }

    fn remote_key(&self, key: &RateKey) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    /// Return the cached connection, acquiring one if needed.
    async fn acquire(&self) -> Option<(C::Connection, u64)> {
        loop {
            let step = {
                let mut state = self.state.lock();
                match &*state {
                    ConnectionState::Connected { conn, generation } => {
                        Step::Ready(conn.clone(), *generation)
                    }
                    ConnectionState::Connecting(tx) => Step::Wait(tx.subscribe()),
                    ConnectionState::Unavailable { retry_at } if Instant::now() < *retry_at => {
                        Step::Skip
                    }
                    ConnectionState::Disconnected | ConnectionState::Unavailable { .. } => {
                        let (tx, _) = watch::channel(());
                        *state = ConnectionState::Connecting(tx);
                        Step::Establish
                    }
                }
            };

            match step {
                Step::Ready(conn, generation) => return Some((conn, generation)),
                Step::Skip => return None,
                Step::Wait(mut rx) => {
                    // Only ever resolves by the sender being dropped.
                    let _ = rx.changed().await;
                }
                Step::Establish => return self.establish().await,
            }
        }
    }

    async fn establish(&self) -> Option<(C::Connection, u64)> {
        let mut guard = ConnectingGuard {
            state: &self.state,
            settled: false,
        };

        let attempts = self.config.reconnect_attempts.max(1);
        let mut backoff = self.config.backoff_base;
        let mut connected = None;

        for attempt in 1..=attempts {
            let attempt_result =
                tokio::time::timeout(self.config.connect_timeout, self.connector.connect()).await;
            match attempt_result {
                Ok(Ok(conn)) => {
                    connected = Some(conn);
                    break;
                }
                Ok(Err(e)) => {
                    warn!(attempt, attempts, error = %e, "Remote store connection attempt failed")
                }
                Err(_) => warn!(
                    attempt,
                    attempts,
                    timeout = ?self.config.connect_timeout,
                    "Remote store connection attempt timed out"
                ),
            }

            if attempt < attempts {
                tokio::time::sleep(with_jitter(backoff)).await;
                backoff = (backoff * 2).min(self.config.backoff_max);
            }
        }

        match connected {
            Some(conn) => {
                let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
                info!(generation, "Connected to remote counter store");
                guard.settle(ConnectionState::Connected {
                    conn: conn.clone(),
                    generation,
                });
                Some((conn, generation))
            }
            None => {
                warn!(
                    cooldown = ?self.config.unavailable_cooldown,
                    "Remote counter store unavailable"
                );
                guard.settle(ConnectionState::Unavailable {
                    retry_at: Instant::now() + self.config.unavailable_cooldown,
                });
                None
            }
        }
    }

    /// Discard the cached connection if it is still the one that failed.
    fn invalidate(&self, generation: u64) {
        let mut state = self.state.lock();
        if let ConnectionState::Connected { generation: current, .. } = &*state {
            if *current == generation {
                debug!(generation, "Discarding remote store connection");
                *state = ConnectionState::Disconnected;
            }
        }
    }

    async fn connection(&self) -> Result<(C::Connection, u64)> {
        self.acquire().await.ok_or_else(|| {
            TollgateError::StoreUnavailable("no connection to the remote counter store".into())
        })
    }

    /// Map a command outcome to a result, discarding the connection on failure.
    fn finish<T>(
        &self,
        outcome: std::result::Result<Result<T>, Elapsed>,
        generation: u64,
    ) -> Result<T> {
        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                self.invalidate(generation);
                Err(e)
            }
            Err(_) => {
                self.invalidate(generation);
                Err(TollgateError::Timeout(self.config.command_timeout))
            }
        }
    }
}

#[async_trait]
impl<C: RemoteConnector> CounterStore for RemoteStore<C> {
    async fn increment(&self, key: &RateKey, window: Duration) -> Result<CounterSnapshot> {
        let remote_key = self.remote_key(key);
        let (conn, generation) = self.connection().await?;
        let outcome = tokio::time::timeout(
            self.config.command_timeout,
            conn.increment_with_expiry(&remote_key, window),
        )
        .await;
        let (count, ttl) = self.finish(outcome, generation)?;

        let now = self.clock.now_millis();
        let window_ms = window_millis(window);
        let ttl_remaining_ms = effective_ttl(ttl, window_ms);

        Ok(CounterSnapshot {
            count,
            window_start_ms: now.saturating_add(ttl_remaining_ms).saturating_sub(window_ms),
            ttl_remaining_ms,
        })
    }

    async fn peek(&self, key: &RateKey, window: Duration) -> Result<Option<CounterEntry>> {
        let remote_key = self.remote_key(key);
        let (conn, generation) = self.connection().await?;
        let outcome =
            tokio::time::timeout(self.config.command_timeout, conn.peek(&remote_key)).await;
        let found = self.finish(outcome, generation)?;

        let now = self.clock.now_millis();
        let window_ms = window_millis(window);
        Ok(found.map(|(count, ttl)| CounterEntry {
            count,
            window_start_ms: now
                .saturating_add(effective_ttl(ttl, window_ms))
                .saturating_sub(window_ms),
        }))
    }
}

/// PTTL reports -1 for a key without expiry and -2 for a missing key.
fn effective_ttl(ttl: i64, window_ms: u64) -> u64 {
    if ttl < 0 {
        window_ms
    } else {
        (ttl as u64).min(window_ms)
    }
}

fn with_jitter(backoff: Duration) -> Duration {
    let spread = (backoff.as_millis() as u64 / 4).max(1);
    backoff + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

/// Leaves the connection state consistent if an acquisition is abandoned
/// midway, e.g. because the caller's request was cancelled.
struct ConnectingGuard<'a, C> {
    state: &'a Mutex<ConnectionState<C>>,
    settled: bool,
}

impl<C> ConnectingGuard<'_, C> {
    fn settle(&mut self, next: ConnectionState<C>) {
        *self.state.lock() = next;
        self.settled = true;
    }
}

impl<C> Drop for ConnectingGuard<'_, C> {
    fn drop(&mut self) {
        if !self.settled {
            *self.state.lock() = ConnectionState::Disconnected;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::MockClock;
    use dashmap::DashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    /// In-memory stand-in for a Redis server that can be switched off.
    #[derive(Clone, Default)]
    struct FakeServer {
        counters: Arc<DashMap<String, (u64, i64)>>,
        down: Arc<AtomicBool>,
        connects: Arc<AtomicUsize>,
        hang: Arc<AtomicBool>,
    }

    #[async_trait]
    impl RemoteConnector for FakeServer {
        type Connection = FakeServer;

        async fn connect(&self) -> Result<FakeServer> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            if self.down.load(Ordering::SeqCst) {
                return Err(TollgateError::StoreUnavailable("connection refused".into()));
            }
            Ok(self.clone())
        }
    }

    #[async_trait]
    impl RemoteConnection for FakeServer {
        async fn increment_with_expiry(&self, key: &str, window: Duration) -> Result<(u64, i64)> {
            if self.hang.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.down.load(Ordering::SeqCst) {
                return Err(TollgateError::StoreUnavailable("broken pipe".into()));
            }
            let ttl = window.as_millis() as i64;
            let mut entry = self.counters.entry(key.to_string()).or_insert((0, ttl));
            entry.0 += 1;
            entry.1 = ttl;
            Ok(*entry)
        }

        async fn peek(&self, key: &str) -> Result<Option<(u64, i64)>> {
            if self.down.load(Ordering::SeqCst) {
                return Err(TollgateError::StoreUnavailable("broken pipe".into()));
            }
            Ok(self.counters.get(key).map(|e| *e))
        }
    }

    fn fast_config() -> RemoteStoreConfig {
        RemoteStoreConfig {
            key_prefix: "test:".to_string(),
            command_timeout: Duration::from_millis(100),
            connect_timeout: Duration::from_millis(100),
            reconnect_attempts: 3,
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(4),
            unavailable_cooldown: Duration::from_millis(50),
        }
    }

    fn store(server: &FakeServer) -> Arc<RemoteStore<FakeServer>> {
        Arc::new(RemoteStore::new(
            server.clone(),
            fast_config(),
            Arc::new(MockClock::new(1_000_000)),
        ))
    }

    const MINUTE: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_connection_is_lazy_and_cached() {
        let server = FakeServer::default();
        let store = store(&server);
        assert_eq!(store.status(), ConnectionStatus::Disconnected);
        assert_eq!(server.connects.load(Ordering::SeqCst), 0);

        let key = RateKey::new("login", "alice");
        store.increment(&key, MINUTE).await.unwrap();
        store.increment(&key, MINUTE).await.unwrap();

        assert_eq!(store.status(), ConnectionStatus::Connected);
        assert_eq!(server.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_increment_uses_prefix_and_window_ttl() {
        let server = FakeServer::default();
        let store = store(&server);

        let snapshot = store
            .increment(&RateKey::new("login", "alice"), MINUTE)
            .await
            .unwrap();

        assert_eq!(snapshot.count, 1);
        assert_eq!(snapshot.ttl_remaining_ms, 60_000);
        assert_eq!(snapshot.window_start_ms, 1_000_000);
        assert!(server.counters.contains_key("test:login:alice"));
    }

    #[tokio::test]
    async fn test_concurrent_callers_open_one_connection() {
        let server = FakeServer::default();
        let store = store(&server);
        let key = RateKey::new("aiChat", "bob");

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let store = store.clone();
                let key = key.clone();
                tokio::spawn(async move { store.increment(&key, MINUTE).await.unwrap().count })
            })
            .collect();
        futures::future::join_all(tasks).await;

        assert_eq!(server.connects.load(Ordering::SeqCst), 1);
        assert_eq!(server.counters.get("test:aiChat:bob").unwrap().0, 50);
    }

    #[tokio::test]
    async fn test_command_error_invalidates_connection() {
        let server = FakeServer::default();
        let store = store(&server);
        let key = RateKey::new("login", "alice");

        store.increment(&key, MINUTE).await.unwrap();
        server.down.store(true, Ordering::SeqCst);

        assert!(store.increment(&key, MINUTE).await.is_err());
        assert_eq!(store.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_bounded_reconnect_then_cooldown() {
        let server = FakeServer::default();
        server.down.store(true, Ordering::SeqCst);
        let store = store(&server);
        let key = RateKey::new("login", "alice");

        let err = store.increment(&key, MINUTE).await.unwrap_err();
        assert!(matches!(err, TollgateError::StoreUnavailable(_)));
        assert_eq!(server.connects.load(Ordering::SeqCst), 3);
        assert_eq!(store.status(), ConnectionStatus::Unavailable);

        // Within the cooldown no further attempts are made.
        assert!(store.increment(&key, MINUTE).await.is_err());
        assert_eq!(server.connects.load(Ordering::SeqCst), 3);

        // After the cooldown a fresh lazy acquisition succeeds.
        server.down.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.increment(&key, MINUTE).await.unwrap().count, 1);
        assert_eq!(store.status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_command_timeout_is_an_error() {
        let server = FakeServer::default();
        let store = store(&server);
        let key = RateKey::new("login", "alice");
        store.increment(&key, MINUTE).await.unwrap();

        server.hang.store(true, Ordering::SeqCst);
        let err = store.increment(&key, MINUTE).await.unwrap_err();
        assert!(matches!(err, TollgateError::Timeout(_)));
        assert_eq!(store.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_cancelled_acquisition_resets_state() {
        let server = FakeServer::default();
        let store = store(&server);
        let key = RateKey::new("login", "alice");

        // Connecting takes 5ms; cancel before it finishes.
        let _ = tokio::time::timeout(Duration::from_millis(1), store.increment(&key, MINUTE)).await;
        assert_eq!(store.status(), ConnectionStatus::Disconnected);

        assert_eq!(store.increment(&key, MINUTE).await.unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_peek_reads_without_incrementing() {
        let server = FakeServer::default();
        let store = store(&server);
        let key = RateKey::new("login", "alice");

        assert_eq!(store.peek(&key, MINUTE).await.unwrap(), None);
        store.increment(&key, MINUTE).await.unwrap();

        let entry = store.peek(&key, MINUTE).await.unwrap().unwrap();
        assert_eq!(entry.count, 1);
        assert_eq!(server.counters.get("test:login:alice").unwrap().0, 1);
    }

    #[test]
    fn test_effective_ttl() {
        assert_eq!(effective_ttl(-1, 60_000), 60_000);
        assert_eq!(effective_ttl(-2, 60_000), 60_000);
        assert_eq!(effective_ttl(30_000, 60_000), 30_000);
        assert_eq!(effective_ttl(90_000, 60_000), 60_000);
    }

    #[test]
    fn test_redis_connector_rejects_bad_url() {
        assert!(RedisConnector::open("not a url").is_err());
        assert!(RedisConnector::open("redis://127.0.0.1:6379/").is_ok());
    }
}
