//! Key/value cache with TTL, plus the key scheme the service reads and writes.
//!
//! Three key families are in use: object reads (`obj:`), transform results
//! (`xform:`) and list pages (`list:`). List keys embed the owner's generation
//! from the [`VersionLedger`](crate::services::version_ledger::VersionLedger),
//! so stale pages are orphaned rather than deleted.

use crate::errors::{MediaError, MediaResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc, time::Duration};
use uuid::Uuid;

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> MediaResult<Option<String>>;

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> MediaResult<()>;

    /// Store only when the key is absent (or expired). Returns whether it was stored.
    async fn set_if_absent(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> MediaResult<bool>;

    async fn delete(&self, key: &str) -> MediaResult<()>;

    /// Atomic single round-trip increment. A missing key counts from zero.
    async fn increment(&self, key: &str) -> MediaResult<i64>;
}

/// Time source for expiry decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// In-process cache. Expired entries are dropped lazily on access and in bulk
/// by [`MemoryCache::purge_expired`].
pub struct MemoryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn expiry(&self, now: DateTime<Utc>, ttl: Option<Duration>) -> MediaResult<Option<DateTime<Utc>>> {
        ttl.map(|ttl| {
            chrono::Duration::from_std(ttl)
                .map(|ttl| now + ttl)
                .map_err(|err| MediaError::Backend(format!("ttl out of range: {err}")))
        })
        .transpose()
    }

    /// Remove every expired entry; returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> MediaResult<Option<String>> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> MediaResult<()> {
        let now = self.clock.now();
        let expires_at = self.expiry(now, ttl)?;
        self.entries
            .lock()
            .insert(key.to_string(), CacheEntry { value, expires_at });
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> MediaResult<bool> {
        let now = self.clock.now();
        let expires_at = self.expiry(now, ttl)?;
        let mut entries = self.entries.lock();
        if entries.get(key).is_some_and(|entry| entry.is_live(now)) {
            return Ok(false);
        }
        entries.insert(key.to_string(), CacheEntry { value, expires_at });
        Ok(true)
    }

    async fn delete(&self, key: &str) -> MediaResult<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn increment(&self, key: &str) -> MediaResult<i64> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let (current, expires_at) = match entries.get(key) {
            Some(entry) if entry.is_live(now) => {
                let parsed = entry.value.parse::<i64>().map_err(|_| {
                    MediaError::Backend(format!("cache value at `{key}` is not an integer"))
                })?;
                (parsed, entry.expires_at)
            }
            _ => (0, None),
        };
        let next = current + 1;
        entries.insert(
            key.to_string(),
            CacheEntry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }
}

/// Builders for every cache key the service uses.
pub mod keys {
    use super::Uuid;

    pub fn object(owner_id: Uuid, object_id: Uuid) -> String {
        format!("obj:{owner_id}:{object_id}")
    }

    pub fn transform(source_id: Uuid, fingerprint: &str) -> String {
        format!("xform:{source_id}:{fingerprint}")
    }

    pub fn list(owner_id: Uuid, generation: i64, page: u32, limit: u32) -> String {
        format!("list:{owner_id}:v{generation}:page{page}:limit{limit}")
    }

    pub fn children(owner_id: Uuid, generation: i64, parent_id: Uuid, page: u32, limit: u32) -> String {
        format!("list:{owner_id}:v{generation}:parent{parent_id}:page{page}:limit{limit}")
    }

    pub fn version(owner_id: Uuid) -> String {
        format!("ver:{owner_id}")
    }

    pub fn lease(source_id: Uuid, fingerprint: &str) -> String {
        format!("lease:{source_id}:{fingerprint}")
    }
}
