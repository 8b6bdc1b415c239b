use crate::domain::{downcast_entry, CacheEntry, CacheKey, FlagValue};
use crate::ports::{CacheStore, Clock, FetchFn};
use crate::tracker::RefreshTracker;
use async_trait::async_trait;
use chrono::TimeDelta;
use dashmap::DashMap;
use shared::{Error, Result};
use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Something the background refresher can re-run for a tracked key
#[async_trait]
pub(crate) trait RefreshJob: Send + Sync {
    async fn run(&self, ctx: &CacheContext) -> anyhow::Result<()>;
}

/// Re-invokes the fetch function that last populated a key
pub(crate) struct FetchJob<T: FlagValue> {
    key: CacheKey,
    fetch: FetchFn<T>,
}

#[async_trait]
impl<T: FlagValue> RefreshJob for FetchJob<T> {
    async fn run(&self, ctx: &CacheContext) -> anyhow::Result<()> {
        let value = (self.fetch)(self.key.flag_key().to_string()).await?;
        ctx.store_value(&self.key, value).await;
        Ok(())
    }
}

/// State shared by the resolution path and the background refresher
pub struct CacheContext {
    store: Arc<dyn CacheStore>,
    tracker: RefreshTracker,
    jobs: DashMap<CacheKey, Arc<dyn RefreshJob>>,
    clock: Arc<dyn Clock>,
    default_ttl: TimeDelta,
}

impl CacheContext {
    pub fn new(store: Arc<dyn CacheStore>, clock: Arc<dyn Clock>, default_ttl: Duration) -> Result<Self> {
        if default_ttl.is_zero() {
            return Err(Error::InvalidConfiguration(
                "default_ttl must be greater than zero".to_string(),
            ));
        }
        let default_ttl = TimeDelta::from_std(default_ttl).map_err(|_| {
            Error::InvalidConfiguration(format!("default_ttl {default_ttl:?} is out of range"))
        })?;

        Ok(Self {
            store,
            tracker: RefreshTracker::new(clock.clone()),
            jobs: DashMap::new(),
            clock,
            default_ttl,
        })
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub fn tracker(&self) -> &RefreshTracker {
        &self.tracker
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn default_ttl(&self) -> TimeDelta {
        self.default_ttl
    }

    /// Typed read through the erased store
    pub async fn lookup<T: FlagValue>(&self, key: &CacheKey) -> Option<Arc<CacheEntry<T>>> {
        let erased = self.store.get(key).await?;
        let typed = downcast_entry::<T>(erased);
        if typed.is_none() {
            warn!("Entry for {} holds an unexpected value type", key);
        }
        typed
    }

    /// Write a freshly fetched value and mark its flag as refreshed
    pub async fn store_value<T: FlagValue>(&self, key: &CacheKey, value: T) -> Arc<CacheEntry<T>> {
        let expires_at = self.clock.now() + self.default_ttl;
        let entry = Arc::new(CacheEntry::retrieved(value, expires_at));
        self.store.set(key.clone(), entry.clone()).await;
        self.tracker.touch(key.flag_key());
        entry
    }

    /// Remember how to re-fetch `key`. The most recent fetch function wins.
    pub(crate) fn register_refresh<T: FlagValue>(&self, key: &CacheKey, fetch: FetchFn<T>) {
        let job = FetchJob {
            key: key.clone(),
            fetch,
        };
        self.jobs.insert(key.clone(), Arc::new(job));
    }

    /// Jobs whose flag identifier is in `flags`, across every registered value type
    pub(crate) fn jobs_for(&self, flags: &HashSet<String>) -> Vec<(CacheKey, Arc<dyn RefreshJob>)> {
        self.jobs
            .iter()
            .filter(|job| flags.contains(job.key().flag_key()))
            .map(|job| (job.key().clone(), job.value().clone()))
            .collect()
    }
}

impl Debug for CacheContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheContext")
            .field("entries", &self.store.entry_count())
            .field("tracked", &self.tracker.len())
            .field("refresh_jobs", &self.jobs.len())
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}
