use crate::context::CacheContext;
use crate::domain::{CacheEntry, CacheKey, ErrorKind, FlagValue, Resolution, ResolutionError};
use crate::ports::FetchFn;
use dashmap::DashMap;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use shared::{Error, Result};
use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

type FetchOutcome<T> = std::result::Result<Arc<CacheEntry<T>>, Arc<anyhow::Error>>;

/// A fetch in progress that any number of callers can await
type PendingFetch<T> = Shared<BoxFuture<'static, FetchOutcome<T>>>;

type InFlight = DashMap<CacheKey, Box<dyn Any + Send + Sync>>;

/// Decides between cache hit and remote fetch for every resolution call.
///
/// Concurrent misses on the same key share a single fetch. The fetch runs on its
/// own task, so a caller that stops waiting does not stop the cache from being filled.
#[derive(Clone)]
pub struct ResolutionService {
    ctx: Arc<CacheContext>,
    in_flight: Arc<InFlight>,
}

impl ResolutionService {
    pub fn new(ctx: Arc<CacheContext>) -> Self {
        Self {
            ctx,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// Resolve `flag_key` as a `T`.
    ///
    /// Only an empty flag key is reported as `Err`. Every other failure comes back as
    /// a `Resolution` holding `default_value` with reason `ERROR`.
    pub async fn resolve<T: FlagValue>(
        &self,
        flag_key: &str,
        default_value: T,
        fetch: FetchFn<T>,
        cancel: &CancellationToken,
    ) -> Result<Resolution<T>> {
        if flag_key.is_empty() {
            return Err(Error::InvalidArgument("flag key must not be empty".to_string()));
        }

        let key = CacheKey::of::<T>(flag_key);

        if let Some(entry) = self.ctx.lookup::<T>(&key).await {
            debug!("Cache hit for {}", key);
            return Ok(Resolution::cached(&entry));
        }

        debug!("Cache miss for {}", key);
        let pending = self.pending_fetch(&key, fetch);

        let outcome = tokio::select! {
            biased;
            outcome = pending => outcome,
            _ = cancel.cancelled() => {
                debug!("Resolution of {} cancelled while waiting on fetch", key);
                return Ok(Resolution::fallback(
                    default_value,
                    ResolutionError::new(ErrorKind::Cancelled, "resolution cancelled before fetch completed"),
                ));
            }
        };

        match outcome {
            Ok(entry) => Ok(Resolution::retrieved(&entry)),
            Err(err) => {
                let failure = Error::FetchFailure {
                    flag_key: flag_key.to_string(),
                    message: format!("{err:#}"),
                };
                error!("{}", failure);
                Ok(Resolution::fallback(
                    default_value,
                    ResolutionError::new(ErrorKind::General, failure.to_string()),
                ))
            }
        }
    }

    /// Join the fetch already running for `key`, or start one.
    ///
    /// `CacheKey` carries the value's `TypeId`, so a slot always holds a `PendingFetch<T>`.
    fn pending_fetch<T: FlagValue>(&self, key: &CacheKey, fetch: FetchFn<T>) -> PendingFetch<T> {
        let mut started = false;
        let slot = self
            .in_flight
            .entry(key.clone())
            .or_insert_with(|| -> Box<dyn Any + Send + Sync> {
                started = true;
                Box::new(self.spawn_fetch(key.clone(), fetch))
            });
        if !started {
            debug!("Joining in-flight fetch for {}", key);
        }

        match slot.downcast_ref::<PendingFetch<T>>() {
            Some(pending) => pending.clone(),
            None => futures::future::ready::<FetchOutcome<T>>(Err(Arc::new(anyhow::anyhow!(
                "in-flight fetch for {key} holds a different value type"
            ))))
            .boxed()
            .shared(),
        }
    }

    fn spawn_fetch<T: FlagValue>(&self, key: CacheKey, fetch: FetchFn<T>) -> PendingFetch<T> {
        let ctx = Arc::clone(&self.ctx);
        let in_flight = Arc::clone(&self.in_flight);

        let task = tokio::spawn(async move {
            let outcome = match fetch(key.flag_key().to_string()).await {
                Ok(value) => {
                    let entry = ctx.store_value(&key, value).await;
                    ctx.register_refresh(&key, fetch);
                    Ok(entry)
                }
                Err(err) => Err(Arc::new(err)),
            };
            in_flight.remove(&key);
            outcome
        });

        async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(join_err) => Err(Arc::new(anyhow::Error::new(join_err).context("fetch task failed"))),
            }
        }
        .boxed()
        .shared()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }
}

impl Debug for ResolutionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolutionService")
            .field("ctx", &self.ctx)
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}
