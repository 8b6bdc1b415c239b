use crate::clock::SystemClock;
use crate::context::CacheContext;
use crate::domain::{ErrorKind, FlagValue, Resolution, ResolutionError};
use crate::moka_store::MokaEntryStore;
use crate::planes::control::refresher::{BackgroundRefresher, RefreshReport, RefreshScanner, RefresherState};
use crate::planes::data::resolution::ResolutionService;
use crate::ports::{fetch_fn, CacheStore, Clock};
use crate::tracker::RefreshTracker;
use shared::config::Config;
use shared::Result;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Caching flag resolver.
///
/// Owns the entry store, the refresh tracker and, when enabled, the background
/// refresher. Dropping or disposing it stops the refresher.
pub struct FlagCache {
    config: Config,
    ctx: Arc<CacheContext>,
    resolver: ResolutionService,
    refresher: Option<BackgroundRefresher>,
    disposed: AtomicBool,
}

impl FlagCache {
    /// Build with the system clock and a moka store sized from `config`.
    ///
    /// With background refresh enabled this must run inside a tokio runtime,
    /// otherwise it fails with `InvalidConfiguration`.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: Config, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(MokaEntryStore::new(
            &config.name,
            config.max_items,
            config.default_ttl,
            clock.clone(),
        ));
        Self::assemble(config, store, clock)
    }

    /// Build around a caller-provided store
    pub fn with_store(config: Config, store: Arc<dyn CacheStore>, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        Self::assemble(config, store, clock)
    }

    /// Wire the planes together. `config` must already be validated.
    fn assemble(config: Config, store: Arc<dyn CacheStore>, clock: Arc<dyn Clock>) -> Result<Self> {
        let ctx = Arc::new(CacheContext::new(store, clock, config.default_ttl)?);
        let resolver = ResolutionService::new(ctx.clone());

        let refresher = if config.enable_background_refresh {
            Some(BackgroundRefresher::spawn(
                RefreshScanner::new(ctx.clone()),
                config.background_refresh_interval,
            )?)
        } else {
            None
        };

        info!(
            "Flag cache '{}' ready (ttl {:?}, max {} items, background refresh {})",
            config.name,
            config.default_ttl,
            config.max_items,
            if refresher.is_some() { "on" } else { "off" }
        );

        Ok(Self {
            config,
            ctx,
            resolver,
            refresher,
            disposed: AtomicBool::new(false),
        })
    }

    pub async fn resolve<T, F, Fut, E>(&self, flag_key: &str, default_value: T, fetch: F) -> Result<Resolution<T>>
    where
        T: FlagValue,
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        self.resolve_with_cancel(flag_key, default_value, fetch, &CancellationToken::new())
            .await
    }

    /// Like `resolve`, but stops waiting once `cancel` fires. A fetch that was
    /// already started keeps running and still fills the cache.
    pub async fn resolve_with_cancel<T, F, Fut, E>(
        &self,
        flag_key: &str,
        default_value: T,
        fetch: F,
        cancel: &CancellationToken,
    ) -> Result<Resolution<T>>
    where
        T: FlagValue,
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        if self.is_disposed() {
            debug!("Resolve of '{}' after dispose, returning default", flag_key);
            return Ok(Resolution::fallback(
                default_value,
                ResolutionError::new(ErrorKind::Disposed, "flag cache has been disposed"),
            ));
        }

        self.resolver
            .resolve(flag_key, default_value, fetch_fn(fetch), cancel)
            .await
    }

    pub async fn resolve_bool<F, Fut, E>(&self, flag_key: &str, default_value: bool, fetch: F) -> Result<Resolution<bool>>
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<bool, E>> + Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        self.resolve(flag_key, default_value, fetch).await
    }

    pub async fn resolve_string<F, Fut, E>(
        &self,
        flag_key: &str,
        default_value: impl Into<String>,
        fetch: F,
    ) -> Result<Resolution<String>>
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<String, E>> + Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        self.resolve(flag_key, default_value.into(), fetch).await
    }

    pub async fn resolve_int<F, Fut, E>(&self, flag_key: &str, default_value: i64, fetch: F) -> Result<Resolution<i64>>
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<i64, E>> + Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        self.resolve(flag_key, default_value, fetch).await
    }

    pub async fn resolve_float<F, Fut, E>(&self, flag_key: &str, default_value: f64, fetch: F) -> Result<Resolution<f64>>
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<f64, E>> + Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        self.resolve(flag_key, default_value, fetch).await
    }

    pub async fn resolve_object<F, Fut, E>(
        &self,
        flag_key: &str,
        default_value: serde_json::Value,
        fetch: F,
    ) -> Result<Resolution<serde_json::Value>>
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<serde_json::Value, E>> + Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        self.resolve(flag_key, default_value, fetch).await
    }

    /// Run one refresh scan now, outside the timer
    pub async fn refresh_now(&self) -> RefreshReport {
        if self.is_disposed() {
            return RefreshReport::default();
        }
        RefreshScanner::new(self.ctx.clone())
            .scan(&CancellationToken::new())
            .await
    }

    pub fn tracker(&self) -> &RefreshTracker {
        self.ctx.tracker()
    }

    pub fn entry_count(&self) -> u64 {
        self.ctx.store().entry_count()
    }

    /// `None` when background refresh is disabled
    pub fn refresher_state(&self) -> Option<RefresherState> {
        self.refresher.as_ref().map(BackgroundRefresher::state)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Stop the background refresher and release every cached entry. Idempotent.
    /// Resolutions already in flight are left to finish.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(refresher) = &self.refresher {
            refresher.shutdown().await;
        }
        self.ctx.store().dispose().await;
        info!("Flag cache '{}' disposed", self.config.name);
    }
}

impl Debug for FlagCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlagCache")
            .field("name", &self.config.name)
            .field("ctx", &self.ctx)
            .field("refresher", &self.refresher)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
