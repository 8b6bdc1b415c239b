use crate::context::CacheContext;
use crate::domain::CacheKey;
use chrono::TimeDelta;
use parking_lot::Mutex;
use shared::{Error, Result};
use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long before expiry a tracked flag becomes due for a proactive refresh
pub const REFRESH_LEAD_TIME: Duration = Duration::from_secs(60);

/// What a single scan did
#[derive(Debug, Default)]
pub struct RefreshReport {
    pub refreshed: Vec<CacheKey>,
    pub failed: Vec<Error>,
}

impl RefreshReport {
    pub fn is_empty(&self) -> bool {
        self.refreshed.is_empty() && self.failed.is_empty()
    }
}

/// One pass over the tracked flags, re-fetching those close to expiry
#[derive(Clone, Debug)]
pub struct RefreshScanner {
    ctx: Arc<CacheContext>,
}

impl RefreshScanner {
    pub fn new(ctx: Arc<CacheContext>) -> Self {
        Self { ctx }
    }

    /// A flag is due once more than `default_ttl - REFRESH_LEAD_TIME` has passed since its last refresh.
    pub fn is_due(&self, flag_key: &str) -> bool {
        let Some(last) = self.ctx.tracker().last_refresh(flag_key) else {
            return false;
        };
        let age = self.ctx.clock().now() - last;
        let lead = TimeDelta::seconds(REFRESH_LEAD_TIME.as_secs() as i64);
        age > self.ctx.default_ttl() - lead
    }

    /// Scan once. Stops early if `shutdown` fires; a failing key never aborts the scan.
    pub async fn scan(&self, shutdown: &CancellationToken) -> RefreshReport {
        let due: HashSet<String> = self
            .ctx
            .tracker()
            .snapshot()
            .into_iter()
            .filter(|flag_key| self.is_due(flag_key))
            .collect();

        let mut report = RefreshReport::default();
        if due.is_empty() {
            return report;
        }

        for (key, job) in self.ctx.jobs_for(&due) {
            if shutdown.is_cancelled() {
                debug!("Refresh scan interrupted by shutdown");
                break;
            }

            match job.run(&self.ctx).await {
                Ok(()) => {
                    debug!("Proactively refreshed {}", key);
                    report.refreshed.push(key);
                }
                Err(err) => {
                    let failure = Error::BackgroundRefreshFailure {
                        flag_key: key.flag_key().to_string(),
                        message: format!("{err:#}"),
                    };
                    warn!("{}", failure);
                    report.failed.push(failure);
                }
            }
        }

        report
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RefresherState {
    Idle = 0,
    Scanning = 1,
}

impl From<u8> for RefresherState {
    fn from(value: u8) -> Self {
        match value {
            1 => RefresherState::Scanning,
            _ => RefresherState::Idle,
        }
    }
}

/// Owned periodic task driving `RefreshScanner`.
///
/// Starts idle and ticks every `interval` until `shutdown` is called.
pub struct BackgroundRefresher {
    state: Arc<AtomicU8>,
    shutdown: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
    interval: Duration,
}

impl BackgroundRefresher {
    /// Spawn the refresh loop on the current tokio runtime.
    ///
    /// Fails with `InvalidConfiguration` when called outside a runtime.
    pub fn spawn(scanner: RefreshScanner, interval: Duration) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|err| {
            Error::InvalidConfiguration(format!("background refresh needs a tokio runtime: {err}"))
        })?;

        let state = Arc::new(AtomicU8::new(RefresherState::Idle as u8));
        let shutdown = CancellationToken::new();

        let handle = runtime.spawn(run_loop(scanner, interval, state.clone(), shutdown.clone()));
        info!("Background refresh started with interval {:?}", interval);

        Ok(Self {
            state,
            shutdown,
            handle: Mutex::new(Some(handle)),
            interval,
        })
    }

    pub fn state(&self) -> RefresherState {
        RefresherState::from(self.state.load(Ordering::Acquire))
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Cancel the timer and wait for an in-progress scan to stop. Idempotent.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!("Background refresh task ended abnormally: {}", err);
            }
            info!("Background refresh stopped");
        }
    }
}

impl Drop for BackgroundRefresher {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl Debug for BackgroundRefresher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundRefresher")
            .field("state", &self.state())
            .field("interval", &self.interval)
            .field("running", &self.is_running())
            .finish()
    }
}

async fn run_loop(
    scanner: RefreshScanner,
    interval: Duration,
    state: Arc<AtomicU8>,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        state.store(RefresherState::Scanning as u8, Ordering::Release);
        let report = scanner.scan(&shutdown).await;
        state.store(RefresherState::Idle as u8, Ordering::Release);

        if !report.is_empty() {
            debug!(
                "Refresh tick finished: {} refreshed, {} failed",
                report.refreshed.len(),
                report.failed.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::moka_store::MokaEntryStore;
    use crate::ports::{fetch_fn, Clock};
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    const TTL: Duration = Duration::from_secs(300);

    fn context() -> (Arc<CacheContext>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(MokaEntryStore::new("test", 100, Duration::from_secs(3600), clock.clone()));
        let ctx = CacheContext::new(store, clock.clone(), TTL).unwrap();
        (Arc::new(ctx), clock)
    }

    async fn seed(ctx: &CacheContext, flag_key: &str, calls: &Arc<AtomicUsize>, fail: Arc<AtomicBool>) -> CacheKey {
        let key = CacheKey::of::<i64>(flag_key);
        let calls = calls.clone();
        let fetch = fetch_fn(move |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst) as i64;
            let fail = fail.load(Ordering::SeqCst);
            async move {
                if fail {
                    Err(anyhow!("remote source unavailable"))
                } else {
                    Ok(n)
                }
            }
        });
        ctx.store_value(&key, -1_i64).await;
        ctx.register_refresh(&key, fetch);
        key
    }

    #[tokio::test]
    async fn test_fresh_keys_are_not_due() {
        let (ctx, clock) = context();
        let calls = Arc::new(AtomicUsize::new(0));
        seed(&ctx, "fresh", &calls, Arc::new(AtomicBool::new(false))).await;
        let scanner = RefreshScanner::new(ctx);

        clock.advance(Duration::from_secs(240));
        assert!(!scanner.is_due("fresh"), "exactly ttl - lead time is not yet due");

        let report = scanner.scan(&CancellationToken::new()).await;
        assert!(report.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_key_near_expiry_is_refreshed() {
        let (ctx, clock) = context();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = seed(&ctx, "hot", &calls, Arc::new(AtomicBool::new(false))).await;
        let scanner = RefreshScanner::new(ctx.clone());

        clock.advance(Duration::from_secs(241));
        assert!(scanner.is_due("hot"));

        let report = scanner.scan(&CancellationToken::new()).await;
        assert_eq!(report.refreshed, vec![key.clone()]);
        assert!(report.failed.is_empty());

        let entry = ctx.lookup::<i64>(&key).await.unwrap();
        assert_eq!(*entry.value(), 0);
        assert_eq!(entry.expires_at(), clock.now() + ctx.default_ttl());
        assert_eq!(ctx.tracker().last_refresh("hot"), Some(clock.now()));
        assert!(!scanner.is_due("hot"));
    }

    #[tokio::test]
    async fn test_failures_keep_key_tracked_and_do_not_abort_scan() {
        let (ctx, clock) = context();
        let broken_calls = Arc::new(AtomicUsize::new(0));
        let healthy_calls = Arc::new(AtomicUsize::new(0));
        seed(&ctx, "broken", &broken_calls, Arc::new(AtomicBool::new(true))).await;
        let healthy = seed(&ctx, "healthy", &healthy_calls, Arc::new(AtomicBool::new(false))).await;
        let scanner = RefreshScanner::new(ctx.clone());

        clock.advance(Duration::from_secs(250));
        let before = ctx.tracker().last_refresh("broken");

        for _ in 0..3 {
            let report = scanner.scan(&CancellationToken::new()).await;
            assert_eq!(report.failed.len(), 1);
            assert!(matches!(
                &report.failed[0],
                Error::BackgroundRefreshFailure { flag_key, .. } if flag_key == "broken"
            ));
            clock.advance(Duration::from_secs(250));
        }

        assert_eq!(broken_calls.load(Ordering::SeqCst), 3);
        assert!(ctx.tracker().snapshot().contains(&"broken".to_string()));
        assert_eq!(ctx.tracker().last_refresh("broken"), before);
        assert!(healthy_calls.load(Ordering::SeqCst) >= 1);
        assert!(ctx.lookup::<i64>(&healthy).await.is_some());
    }

    #[tokio::test]
    async fn test_short_ttl_is_always_due() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(MokaEntryStore::new("test", 10, Duration::from_secs(3600), clock.clone()));
        let ctx = Arc::new(CacheContext::new(store, clock, Duration::from_secs(30)).unwrap());
        let calls = Arc::new(AtomicUsize::new(0));
        seed(&ctx, "short", &calls, Arc::new(AtomicBool::new(false))).await;

        let scanner = RefreshScanner::new(ctx);
        assert!(scanner.is_due("short"));
    }

    #[tokio::test]
    async fn test_cancelled_scan_refreshes_nothing() {
        let (ctx, clock) = context();
        let calls = Arc::new(AtomicUsize::new(0));
        seed(&ctx, "hot", &calls, Arc::new(AtomicBool::new(false))).await;
        clock.advance(Duration::from_secs(299));

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let report = RefreshScanner::new(ctx).scan(&shutdown).await;

        assert!(report.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_background_refresher_ticks_and_stops_on_shutdown() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(MokaEntryStore::new("test", 10, Duration::from_secs(3600), clock.clone()));
        // Lead time exceeds the ttl, so every tracked key is due on every tick
        let ctx = Arc::new(CacheContext::new(store, clock, Duration::from_secs(30)).unwrap());
        let calls = Arc::new(AtomicUsize::new(0));
        seed(&ctx, "ticking", &calls, Arc::new(AtomicBool::new(false))).await;

        let refresher = BackgroundRefresher::spawn(RefreshScanner::new(ctx), Duration::from_millis(10)).unwrap();
        assert!(refresher.is_running());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(calls.load(Ordering::SeqCst) >= 1, "refresher should have ticked");

        refresher.shutdown().await;
        assert!(!refresher.is_running());
        assert_eq!(refresher.state(), RefresherState::Idle);

        let after_shutdown = calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), after_shutdown);

        refresher.shutdown().await;
    }

    #[test]
    fn test_spawn_outside_runtime_is_invalid_configuration() {
        let (ctx, _clock) = context();
        let result = BackgroundRefresher::spawn(RefreshScanner::new(ctx), Duration::from_secs(5));
        assert!(matches!(result, Err(Error::InvalidConfiguration(msg)) if msg.contains("runtime")));
    }

    #[test]
    fn test_refresher_state_from_u8() {
        assert_eq!(RefresherState::from(0), RefresherState::Idle);
        assert_eq!(RefresherState::from(1), RefresherState::Scanning);
    }
}
