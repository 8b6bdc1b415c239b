use crate::{Error, Result};
use std::time::Duration;
use tracing::{info, warn};

/// Runtime settings for a flag cache instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub name: String,
    pub default_ttl: Duration,
    pub max_items: u64,
    pub enable_background_refresh: bool,
    pub background_refresh_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: Self::DEFAULT_NAME.to_string(),
            default_ttl: Duration::from_secs(Self::DEFAULT_TTL_SECS),
            max_items: Self::DEFAULT_MAX_ITEMS,
            enable_background_refresh: false,
            background_refresh_interval: Duration::from_secs(Self::DEFAULT_REFRESH_INTERVAL_SECS),
        }
    }
}

impl Config {
    const DEFAULT_NAME: &str = "flagstone";
    const DEFAULT_TTL_SECS: u64 = 300;
    const DEFAULT_MAX_ITEMS: u64 = 1000;
    const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 60;

    /// Longest duration the entry store accepts for a time-to-live (1000 years)
    pub const MAX_DURATION: Duration = Duration::from_secs(1000 * 365 * 24 * 3600);

    pub const ENV_NAME: &str = "FLAGSTONE_CACHE_NAME";
    pub const ENV_DEFAULT_TTL_SECS: &str = "FLAGSTONE_DEFAULT_TTL_SECS";
    pub const ENV_MAX_ITEMS: &str = "FLAGSTONE_MAX_ITEMS";
    pub const ENV_BACKGROUND_REFRESH: &str = "FLAGSTONE_BACKGROUND_REFRESH";
    pub const ENV_REFRESH_INTERVAL_SECS: &str = "FLAGSTONE_BACKGROUND_REFRESH_INTERVAL_SECS";

    /// Load a `.env` file if one exists, then read the process environment.
    pub fn load() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => info!("Loaded environment variables from {}", path.display()),
            Err(_) => info!("No .env file found, using system environment variables"),
        }
        Self::from_env()
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a config from an arbitrary variable source. Missing variables fall back
    /// to defaults; present but malformed ones are rejected.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let name = lookup(Self::ENV_NAME).unwrap_or(defaults.name);

        let default_ttl = match lookup(Self::ENV_DEFAULT_TTL_SECS) {
            Some(raw) => Duration::from_secs(parse_u64(Self::ENV_DEFAULT_TTL_SECS, &raw)?),
            None => defaults.default_ttl,
        };

        let max_items = match lookup(Self::ENV_MAX_ITEMS) {
            Some(raw) => parse_u64(Self::ENV_MAX_ITEMS, &raw)?,
            None => defaults.max_items,
        };

        let enable_background_refresh = match lookup(Self::ENV_BACKGROUND_REFRESH) {
            Some(raw) => parse_bool(Self::ENV_BACKGROUND_REFRESH, &raw)?,
            None => defaults.enable_background_refresh,
        };

        let background_refresh_interval = match lookup(Self::ENV_REFRESH_INTERVAL_SECS) {
            Some(raw) => Duration::from_secs(parse_u64(Self::ENV_REFRESH_INTERVAL_SECS, &raw)?),
            None => defaults.background_refresh_interval,
        };

        let config = Self {
            name,
            default_ttl,
            max_items,
            enable_background_refresh,
            background_refresh_interval,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_max_items(mut self, max_items: u64) -> Self {
        self.max_items = max_items;
        self
    }

    pub fn with_background_refresh(mut self, interval: Duration) -> Self {
        self.enable_background_refresh = true;
        self.background_refresh_interval = interval;
        self
    }

    /// Both durations must be positive and no longer than `MAX_DURATION`, whether or
    /// not background refresh is enabled.
    pub fn validate(&self) -> Result<()> {
        check_duration("default_ttl", self.default_ttl)?;
        check_duration("background_refresh_interval", self.background_refresh_interval)?;
        if self.name.trim().is_empty() {
            return Err(Error::InvalidConfiguration("name must not be empty".to_string()));
        }
        if self.max_items == 0 {
            warn!("max_items is 0, every cached flag will be evicted immediately");
        }
        Ok(())
    }
}

fn check_duration(name: &str, value: Duration) -> Result<()> {
    if value.is_zero() {
        return Err(Error::InvalidConfiguration(format!("{name} must be greater than zero")));
    }
    if value > Config::MAX_DURATION {
        return Err(Error::InvalidConfiguration(format!(
            "{name} of {}s exceeds the maximum of {}s",
            value.as_secs(),
            Config::MAX_DURATION.as_secs()
        )));
    }
    Ok(())
}

fn parse_u64(name: &str, raw: &str) -> Result<u64> {
    let value = raw.trim().parse::<i64>().map_err(|_| {
        Error::InvalidConfiguration(format!("{name} must be an integer, got '{raw}'"))
    })?;
    u64::try_from(value)
        .map_err(|_| Error::InvalidConfiguration(format!("{name} must not be negative, got {value}")))
}

fn parse_bool(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::InvalidConfiguration(format!(
            "{name} must be a boolean, got '{raw}'"
        ))),
    }
}
