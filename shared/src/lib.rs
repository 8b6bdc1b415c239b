// shared/src/lib.rs

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("fetch failed for flag '{flag_key}': {message}")]
    FetchFailure { flag_key: String, message: String },
    #[error("background refresh failed for flag '{flag_key}': {message}")]
    BackgroundRefreshFailure { flag_key: String, message: String },
}

pub type Result<T> = std::result::Result<T, Error>;

pub mod config;
