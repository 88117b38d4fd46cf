//! Expiring key-value store seam.
//!
//! The agent only increments counters and refreshes their expiry; the
//! reconcile side only lists and reads. Both go through [`ExpiringStore`].

use crate::config::StoreConfig;
use async_trait::async_trait;
use log::{info, trace};
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

pub const MEMORY_SCHEME: &str = "memory://";

/// Minimum time between sweeps of expired in-memory entries.
const PURGE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store error: {0}")]
    Backend(#[from] redis::RedisError),

    #[error("Timed out after {0:?} connecting to the store")]
    Timeout(Duration),

    #[error("Value at '{key}' is not a counter: '{value}'")]
    NotCounter { key: String, value: String },

    #[error("Unsupported store address '{0}'")]
    UnsupportedAddress(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait ExpiringStore: Send + Sync {
    /// Increments the counter at `key` and (re)sets its expiry, as one unit.
    async fn incr_expire(&self, key: &str, ttl: Duration) -> StoreResult<i64>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Live keys starting with `prefix`, in no particular order.
    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>>;
}

/// Opens the backend named by `config.address`.
pub async fn open_store(config: &StoreConfig) -> StoreResult<Arc<dyn ExpiringStore>> {
    if config.address.starts_with(MEMORY_SCHEME) {
        info!("store.event=open backend=memory");
        return Ok(Arc::new(MemoryStore::new()));
    }
    if ["redis://", "rediss://", "redis+unix://", "unix://"].iter().any(|scheme| config.address.starts_with(scheme)) {
        let store = RedisStore::connect(&config.address, config.connect_timeout()).await?;
        info!("store.event=open backend=redis address={}", config.address);
        return Ok(Arc::new(store));
    }
    Err(StoreError::UnsupportedAddress(config.address.clone()))
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    expires_at: Instant,
}

/// In-process store with per-key expiry. Reads skip expired keys; writes
/// sweep them out at most once per [`PURGE_INTERVAL`].
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug)]
struct MemoryInner {
    entries: HashMap<String, MemoryEntry>,
    last_purge: Instant,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self { inner: Mutex::new(MemoryInner { entries: HashMap::new(), last_purge: Instant::now() }) }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` as is, e.g. to preload list records for a replay.
    pub fn insert(&self, key: &str, value: &str, ttl: Duration) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.maybe_purge(now);
        inner.entries.insert(key.to_string(), MemoryEntry { value: value.to_string(), expires_at: now + ttl });
    }

    fn incr_at(&self, key: &str, ttl: Duration, now: Instant) -> StoreResult<i64> {
        let mut inner = self.inner.lock();
        inner.maybe_purge(now);
        let current = match inner.entries.get(key) {
            Some(entry) if entry.expires_at > now => entry
                .value
                .parse::<i64>()
                .map_err(|_| StoreError::NotCounter { key: key.to_string(), value: entry.value.clone() })?,
            _ => 0,
        };
        let next = current.saturating_add(1);
        inner.entries.insert(key.to_string(), MemoryEntry { value: next.to_string(), expires_at: now + ttl });
        Ok(next)
    }
}

impl MemoryInner {
    fn maybe_purge(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_purge) < PURGE_INTERVAL {
            return;
        }
        self.last_purge = now;
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        let purged = before - self.entries.len();
        if purged > 0 {
            trace!("store.event=purged backend=memory expired={} live={}", purged, self.entries.len());
        }
    }
}

#[async_trait]
impl ExpiringStore for MemoryStore {
    async fn incr_expire(&self, key: &str, ttl: Duration) -> StoreResult<i64> {
        self.incr_at(key, ttl, Instant::now())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = Instant::now();
        Ok(self.inner.lock().entries.get(key).filter(|entry| entry.expires_at > now).map(|entry| entry.value.clone()))
    }

    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let now = Instant::now();
        Ok(self
            .inner
            .lock()
            .entries
            .iter()
            .filter(|(key, entry)| entry.expires_at > now && key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }
}

/// Redis backend over one multiplexed connection shared by all callers.
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(address: &str, timeout: Duration) -> StoreResult<Self> {
        let client = redis::Client::open(address)?;
        let conn = tokio::time::timeout(timeout, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| StoreError::Timeout(timeout))??;
        Ok(Self { conn })
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl ExpiringStore for RedisStore {
    async fn incr_expire(&self, key: &str, ttl: Duration) -> StoreResult<i64> {
        let mut conn = self.conn.clone();
        let (count,): (i64,) =
            redis::pipe().atomic().incr(key, 1).expire(key, ttl_secs(ttl) as i64).ignore().query_async(&mut conn).await?;
        Ok(count)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.keys(format!("{prefix}*")).await?)
    }
}
