use crate::domain::{CacheKey, ErasedEntry};
use crate::ports::{CacheStore, Clock};
use async_trait::async_trait;
use moka::future::Cache;
use moka::ops::compute::{CompResult, Op};
use moka::policy::EvictionPolicy;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Moka-based entry store with LRU eviction
/// Expiry is judged against the injected clock using each entry's own deadline;
/// moka's time_to_live only acts as a real-time backstop
pub struct MokaEntryStore {
    cache: Cache<CacheKey, Arc<dyn ErasedEntry>>,
    clock: Arc<dyn Clock>,
}

impl MokaEntryStore {
    /// Create a bounded store holding at most `max_items` entries
    pub fn new(name: &str, max_items: u64, default_ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        let cache = Cache::builder()
            .name(name)
            .max_capacity(max_items)
            .eviction_policy(EvictionPolicy::lru())
            .time_to_live(default_ttl)
            .build();

        Self { cache, clock }
    }

    /// Remove `stale` only if it is still the entry stored under `key`.
    /// A concurrent `set` may already have replaced it with a fresh one.
    async fn purge_if_current(&self, key: &CacheKey, stale: &Arc<dyn ErasedEntry>) {
        let result = self
            .cache
            .entry(key.clone())
            .and_compute_with(|current| {
                let op = match current {
                    Some(current) if Arc::ptr_eq(current.value(), stale) => Op::Remove,
                    _ => Op::Nop,
                };
                std::future::ready(op)
            })
            .await;

        if let CompResult::Removed(_) = result {
            debug!("Purged expired entry for {}", key);
        }
    }
}

#[async_trait]
impl CacheStore for MokaEntryStore {
    async fn get(&self, key: &CacheKey) -> Option<Arc<dyn ErasedEntry>> {
        let entry = self.cache.get(key).await?;

        if self.clock.now() > entry.expires_at() {
            self.purge_if_current(key, &entry).await;
            return None;
        }

        Some(entry)
    }

    async fn set(&self, key: CacheKey, entry: Arc<dyn ErasedEntry>) {
        self.cache.insert(key, entry).await;
        // Moka defers eviction to its maintenance pass; without this flush entry_count
        // can sit above max_items until the next read or write
        self.cache.run_pending_tasks().await;
    }

    async fn dispose(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
    }

    fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

impl Debug for MokaEntryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MokaEntryStore")
            .field("name", &self.cache.name())
            .field("entry_count", &self.cache.entry_count())
            .field("weighted_size", &self.cache.weighted_size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::domain::{downcast_entry, CacheEntry};
    use chrono::TimeDelta;

    fn store_with_clock(max_items: u64) -> (MokaEntryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = MokaEntryStore::new("test", max_items, Duration::from_secs(3600), clock.clone());
        (store, clock)
    }

    fn entry<T: crate::domain::FlagValue>(value: T, clock: &ManualClock, ttl_secs: i64) -> Arc<dyn ErasedEntry> {
        Arc::new(CacheEntry::retrieved(value, clock.now() + TimeDelta::seconds(ttl_secs)))
    }

    #[tokio::test]
    async fn test_moka_store_set_and_get() {
        let (store, clock) = store_with_clock(10);
        let key = CacheKey::of::<bool>("dark-mode");

        store.set(key.clone(), entry(true, &clock, 30)).await;

        let found = store.get(&key).await.unwrap();
        let typed = downcast_entry::<bool>(found).unwrap();
        assert!(*typed.value());
    }

    #[tokio::test]
    async fn test_moka_store_get_nonexistent() {
        let (store, _clock) = store_with_clock(10);
        assert!(store.get(&CacheKey::of::<bool>("missing")).await.is_none());
    }

    #[tokio::test]
    async fn test_moka_store_overwrite() {
        let (store, clock) = store_with_clock(10);
        let key = CacheKey::of::<String>("banner");

        store.set(key.clone(), entry("value1".to_string(), &clock, 30)).await;
        store.set(key.clone(), entry("value2".to_string(), &clock, 30)).await;

        let typed = downcast_entry::<String>(store.get(&key).await.unwrap()).unwrap();
        assert_eq!(typed.value(), "value2");
    }

    #[tokio::test]
    async fn test_moka_store_expired_entry_is_a_miss() {
        let (store, clock) = store_with_clock(10);
        let key = CacheKey::of::<i64>("limit");

        store.set(key.clone(), entry(5_i64, &clock, 30)).await;
        clock.advance(Duration::from_secs(30));
        assert!(store.get(&key).await.is_some(), "entry is still valid at its deadline");

        clock.advance(Duration::from_secs(1));
        assert!(store.get(&key).await.is_none());

        store.cache.run_pending_tasks().await;
        assert_eq!(store.entry_count(), 0, "expired entry should be purged on read");
    }

    #[tokio::test]
    async fn test_moka_store_purge_keeps_entry_written_after_expired_read() {
        let (store, clock) = store_with_clock(10);
        let key = CacheKey::of::<i64>("limit");

        store.set(key.clone(), entry(1_i64, &clock, 30)).await;
        clock.advance(Duration::from_secs(31));

        // A reader has loaded the expired entry, then a refresh lands before it purges
        let stale = store.cache.get(&key).await.unwrap();
        store.set(key.clone(), entry(2_i64, &clock, 30)).await;
        store.purge_if_current(&key, &stale).await;

        let fresh = downcast_entry::<i64>(store.get(&key).await.unwrap()).unwrap();
        assert_eq!(*fresh.value(), 2);
    }

    #[tokio::test]
    async fn test_moka_store_purge_removes_unchanged_expired_entry() {
        let (store, clock) = store_with_clock(10);
        let key = CacheKey::of::<i64>("limit");

        store.set(key.clone(), entry(1_i64, &clock, 30)).await;
        clock.advance(Duration::from_secs(31));

        let stale = store.cache.get(&key).await.unwrap();
        store.purge_if_current(&key, &stale).await;

        assert!(store.cache.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_moka_store_same_flag_different_types() {
        let (store, clock) = store_with_clock(10);
        store.set(CacheKey::of::<bool>("flag"), entry(true, &clock, 30)).await;
        store.set(CacheKey::of::<i64>("flag"), entry(9_i64, &clock, 30)).await;

        let as_bool = downcast_entry::<bool>(store.get(&CacheKey::of::<bool>("flag")).await.unwrap());
        let as_int = downcast_entry::<i64>(store.get(&CacheKey::of::<i64>("flag")).await.unwrap());
        assert!(*as_bool.unwrap().value());
        assert_eq!(*as_int.unwrap().value(), 9);
    }

    #[tokio::test]
    async fn test_moka_store_bounded_evicts_least_recent() {
        let (store, clock) = store_with_clock(1);
        let first = CacheKey::of::<bool>("first");
        let second = CacheKey::of::<bool>("second");

        store.set(first.clone(), entry(true, &clock, 30)).await;
        store.set(second.clone(), entry(false, &clock, 30)).await;

        assert!(store.entry_count() <= 1, "store should hold at most 1 entry");
        assert!(store.get(&first).await.is_none());
        assert!(store.get(&second).await.is_some());
    }

    #[tokio::test]
    async fn test_moka_store_dispose_is_idempotent() {
        let (store, clock) = store_with_clock(10);
        let key = CacheKey::of::<bool>("flag");
        store.set(key.clone(), entry(true, &clock, 30)).await;

        store.dispose().await;
        store.dispose().await;

        assert!(store.get(&key).await.is_none());
    }
}
