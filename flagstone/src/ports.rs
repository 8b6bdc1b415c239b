#![deny(clippy::all)]

use crate::domain::{CacheKey, ErasedEntry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;

// Ports are the pluggable seams around the resolution engine

/// Port for the bounded entry store shared by resolution calls and the background refresher
#[async_trait]
pub trait CacheStore: Send + Sync + 'static {
    /// Returns the entry only if it is present and not expired
    async fn get(&self, key: &CacheKey) -> Option<Arc<dyn ErasedEntry>>;

    /// Insert or replace an entry, evicting as needed to stay within capacity
    async fn set(&self, key: CacheKey, entry: Arc<dyn ErasedEntry>);

    /// Release every held entry. Safe to call more than once
    async fn dispose(&self);

    fn entry_count(&self) -> u64;
}

/// Port for wall-clock time so TTL and refresh lead time can be driven by tests
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// Caller-supplied function that reaches the remote configuration source
pub type FetchFn<T> = Arc<dyn Fn(String) -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync>;

/// Erase a caller's async fetch closure into a `FetchFn`
pub fn fetch_fn<T, F, Fut, E>(fetch: F) -> FetchFn<T>
where
    T: Send + 'static,
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
    E: Into<anyhow::Error> + Send + 'static,
{
    Arc::new(move |flag_key: String| -> BoxFuture<'static, anyhow::Result<T>> {
        let pending = fetch(flag_key);
        async move { pending.await.map_err(|err| -> anyhow::Error { err.into() }) }.boxed()
    })
}
