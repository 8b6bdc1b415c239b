//! Cache-and-refresh engine for feature flag resolution.
//!
//! Flags are served from a bounded local store while fresh and fetched through a
//! caller-supplied function on a miss. Fetch failures never escape `resolve`; the
//! caller's default comes back with reason `ERROR` instead. An optional background
//! task re-fetches tracked flags shortly before they expire.

pub mod clock;
pub mod context;
pub mod domain;
pub mod moka_store;
pub mod planes;
pub mod ports;
pub mod provider;
pub mod tracker;

pub use clock::{ManualClock, SystemClock};
pub use domain::{CacheEntry, CacheKey, ErrorKind, FlagValue, Reason, Resolution, ResolutionError};
pub use moka_store::MokaEntryStore;
pub use planes::control::refresher::{
    BackgroundRefresher, REFRESH_LEAD_TIME, RefreshReport, RefreshScanner, RefresherState,
};
pub use planes::data::resolution::ResolutionService;
pub use ports::{CacheStore, Clock, FetchFn, fetch_fn};
pub use provider::FlagCache;
pub use tracker::RefreshTracker;

pub use shared::config::Config;
pub use shared::{Error, Result};
