//! Key-value cache store used for producer results.

use async_trait::async_trait;
use fieldwork_core::MaxAge;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::RwLock;

/// When a cache record stops being valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expire {
    /// Valid until invalidated by tag.
    Permanent,
    /// Valid until the given unix time, in seconds.
    At(u64),
}

impl Expire {
    /// Maps a max-age to an expiry relative to the request time.
    pub fn from_max_age(max_age: MaxAge, request_time: u64) -> Self {
        match max_age {
            MaxAge::Permanent => Expire::Permanent,
            MaxAge::Seconds(secs) => Expire::At(request_time.saturating_add(secs)),
        }
    }

    /// Returns true if the record is no longer valid at `now`.
    pub fn is_expired(&self, now: u64) -> bool {
        match self {
            Expire::Permanent => false,
            Expire::At(at) => *at <= now,
        }
    }
}

/// A stored cache record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    /// The cached payload.
    pub data: Value,
    /// Expiry.
    pub expire: Expire,
    /// Invalidation tags.
    pub tags: BTreeSet<String>,
}

/// Cache backend failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The store could not be reached.
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    /// A record could not be decoded.
    #[error("corrupt cache record '{key}': {message}")]
    Corrupt { key: String, message: String },
}

/// A shared key-value store.
///
/// Writers do not coordinate: two requests computing the same key may both
/// write it, and the last write wins.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Reads a record; expired records read as absent.
    async fn get(&self, key: &str) -> Result<Option<CacheRecord>, CacheError>;

    /// Writes several records at once.
    async fn set_multiple(&self, records: Vec<(String, CacheRecord)>) -> Result<(), CacheError>;

    /// Drops every record carrying any of the tags.
    async fn invalidate_tags(&self, tags: &[String]) -> Result<(), CacheError>;
}

/// Source of the current unix time, in seconds.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> u64;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Creates a clock reading `now`.
    pub fn new(now: u64) -> Self {
        Self {
            now: AtomicU64::new(now),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, secs: u64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }

    /// Sets the clock.
    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// In-process cache backend.
#[derive(Debug)]
pub struct MemoryCacheBackend {
    entries: RwLock<FxHashMap<String, CacheRecord>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryCacheBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCacheBackend {
    /// Creates an empty backend on the wall clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates an empty backend on the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
            clock,
        }
    }

    /// Number of stored records, expired ones not yet evicted included.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Returns true if nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Returns the stored keys, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Removes everything.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<CacheRecord>, CacheError> {
        let now = self.clock.now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                None => return Ok(None),
                Some(record) if !record.expire.is_expired(now) => return Ok(Some(record.clone())),
                Some(_) => {}
            }
        }

        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|record| record.expire.is_expired(now)) {
            entries.remove(key);
        }
        Ok(None)
    }

    /// Writes the records and evicts every expired one.
    async fn set_multiple(&self, records: Vec<(String, CacheRecord)>) -> Result<(), CacheError> {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        entries.retain(|_, record| !record.expire.is_expired(now));
        for (key, record) in records {
            entries.insert(key, record);
        }
        Ok(())
    }

    async fn invalidate_tags(&self, tags: &[String]) -> Result<(), CacheError> {
        let mut entries = self.entries.write().await;
        entries.retain(|_, record| !tags.iter().any(|tag| record.tags.contains(tag)));
        Ok(())
    }
}
