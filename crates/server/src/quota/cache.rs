use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use shared::PlanType;
use uuid::Uuid;

use crate::error::CacheError;

/// Cached view of a user's active subscription and plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub subscription_id: Uuid,
    pub plan_id: Uuid,
    pub plan_type: PlanType,
    pub limit: Option<u64>,
    pub used: u64,
    pub device_limit: u32,
    pub end_date: Option<DateTime<Utc>>,
}

pub fn cache_key(owner_id: &str) -> String {
    format!("sub:{}", owner_id)
}

/// Hash-style cache for quota snapshots
#[async_trait]
pub trait QuotaCache: Send + Sync {
    async fn get(&self, owner_id: &str) -> Result<Option<QuotaSnapshot>, CacheError>;

    /// Store a snapshot unless a live one is already cached; it expires at
    /// `expire_at`. Returns whether the snapshot was stored.
    async fn put(
        &self,
        owner_id: &str,
        snapshot: QuotaSnapshot,
        expire_at: Option<DateTime<Utc>>,
    ) -> Result<bool, CacheError>;

    /// Atomically add to the cached counter. `None` when nothing is cached.
    async fn incr_used(&self, owner_id: &str, by: u64) -> Result<Option<u64>, CacheError>;

    async fn invalidate(&self, owner_id: &str) -> Result<(), CacheError>;
}

#[derive(Debug, Clone)]
struct CacheEntry {
    snapshot: QuotaSnapshot,
    expire_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expire_at.map_or(true, |at| now < at)
    }
}

/// In-process cache. Each key is mutated under its shard lock, which makes
/// `incr_used` a true atomic increment.
#[derive(Default)]
pub struct MemoryQuotaCache {
    entries: DashMap<String, CacheEntry>,
}

impl MemoryQuotaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl QuotaCache for MemoryQuotaCache {
    async fn get(&self, owner_id: &str) -> Result<Option<QuotaSnapshot>, CacheError> {
        let key = cache_key(owner_id);
        let now = Utc::now();

        if let Some(entry) = self.entries.get(&key) {
            if entry.is_live(now) {
                return Ok(Some(entry.snapshot.clone()));
            }
        }
        self.entries.remove_if(&key, |_, entry| !entry.is_live(now));
        Ok(None)
    }

    async fn put(
        &self,
        owner_id: &str,
        snapshot: QuotaSnapshot,
        expire_at: Option<DateTime<Utc>>,
    ) -> Result<bool, CacheError> {
        let now = Utc::now();
        let fresh = CacheEntry { snapshot, expire_at };

        match self.entries.entry(cache_key(owner_id)) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    return Ok(false);
                }
                occupied.insert(fresh);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
            }
        }
        Ok(true)
    }

    async fn incr_used(&self, owner_id: &str, by: u64) -> Result<Option<u64>, CacheError> {
        let now = Utc::now();
        match self.entries.get_mut(&cache_key(owner_id)) {
            Some(mut entry) if entry.is_live(now) => {
                entry.snapshot.used = entry.snapshot.used.saturating_add(by);
                Ok(Some(entry.snapshot.used))
            }
            _ => Ok(None),
        }
    }

    async fn invalidate(&self, owner_id: &str) -> Result<(), CacheError> {
        self.entries.remove(&cache_key(owner_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn snapshot(used: u64) -> QuotaSnapshot {
        QuotaSnapshot {
            subscription_id: Uuid::new_v4(),
            plan_id: Uuid::new_v4(),
            plan_type: PlanType::Limited,
            limit: Some(100),
            used,
            device_limit: 1,
            end_date: None,
        }
    }

    #[tokio::test]
    async fn test_put_does_not_clobber_live_entry() {
        let cache = MemoryQuotaCache::new();
        assert!(cache.put("u1", snapshot(0), None).await.unwrap());
        cache.incr_used("u1", 1).await.unwrap();

        // A second loader racing with the first must not reset the counter
        assert!(!cache.put("u1", snapshot(0), None).await.unwrap());
        assert_eq!(cache.get("u1").await.unwrap().unwrap().used, 1);
    }

    #[tokio::test]
    async fn test_expired_entries_disappear() {
        let cache = MemoryQuotaCache::new();
        let past = Utc::now() - chrono::Duration::seconds(1);
        cache.put("u1", snapshot(3), Some(past)).await.unwrap();

        assert!(cache.get("u1").await.unwrap().is_none());
        assert_eq!(cache.incr_used("u1", 1).await.unwrap(), None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_incr_on_missing_key_is_none() {
        let cache = MemoryQuotaCache::new();
        assert_eq!(cache.incr_used("nobody", 1).await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_not_lost() {
        let cache = Arc::new(MemoryQuotaCache::new());
        cache.put("u1", snapshot(0), None).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..50 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..20 {
                    cache.incr_used("u1", 1).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(cache.get("u1").await.unwrap().unwrap().used, 1000);
    }
}
