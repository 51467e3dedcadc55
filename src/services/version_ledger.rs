//! Per-owner generation counters used to invalidate list caches without
//! scanning or deleting entries.

use crate::{
    errors::{MediaError, MediaResult},
    services::cache::{Cache, keys},
};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Monotonic counter per owner, backed by the cache's atomic increment.
#[derive(Clone)]
pub struct VersionLedger {
    cache: Arc<dyn Cache>,
}

impl VersionLedger {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self { cache }
    }

    /// Advance the owner's generation. Single round trip, never read-then-write.
    pub async fn bump(&self, owner_id: Uuid) -> MediaResult<i64> {
        let version = self.cache.increment(&keys::version(owner_id)).await?;
        debug!("owner {} list generation bumped to {}", owner_id, version);
        Ok(version)
    }

    /// Current generation; initialised to 1 when absent.
    pub async fn current(&self, owner_id: Uuid) -> MediaResult<i64> {
        let key = keys::version(owner_id);
        if let Some(raw) = self.cache.get(&key).await? {
            return parse_version(&key, &raw);
        }
        // A concurrent bump may land between the read and this write;
        // set_if_absent leaves it intact and the re-read picks it up.
        self.cache.set_if_absent(&key, "1".into(), None).await?;
        match self.cache.get(&key).await? {
            Some(raw) => parse_version(&key, &raw),
            None => Ok(1),
        }
    }
}

fn parse_version(key: &str, raw: &str) -> MediaResult<i64> {
    raw.parse::<i64>()
        .map_err(|_| MediaError::Backend(format!("version at `{key}` is not an integer")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::cache::MemoryCache;

    fn ledger() -> VersionLedger {
        VersionLedger::new(Arc::new(MemoryCache::new()))
    }

    #[tokio::test]
    async fn current_starts_at_one() {
        let ledger = ledger();
        let owner = Uuid::new_v4();
        assert_eq!(ledger.current(owner).await.unwrap(), 1);
        assert_eq!(ledger.current(owner).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn bumps_are_strictly_increasing() {
        let ledger = ledger();
        let owner = Uuid::new_v4();
        let start = ledger.current(owner).await.unwrap();
        let mut seen = vec![start];
        for _ in 0..10 {
            seen.push(ledger.bump(owner).await.unwrap());
        }
        assert!(seen.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(ledger.current(owner).await.unwrap(), *seen.last().unwrap());
    }

    #[tokio::test]
    async fn owners_are_independent() {
        let ledger = ledger();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        ledger.bump(a).await.unwrap();
        ledger.bump(a).await.unwrap();
        assert_eq!(ledger.current(a).await.unwrap(), 2);
        assert_eq!(ledger.current(b).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn concurrent_bumps_do_not_lose_updates() {
        let ledger = ledger();
        let owner = Uuid::new_v4();
        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.bump(owner).await.unwrap() })
            })
            .collect();
        let mut values = Vec::new();
        for task in tasks {
            values.push(task.await.unwrap());
        }
        values.sort_unstable();
        values.dedup();
        assert_eq!(values.len(), 50);
        assert_eq!(ledger.current(owner).await.unwrap(), 50);
    }
}
