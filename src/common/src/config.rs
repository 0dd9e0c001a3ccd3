//! Layered configuration for the reaper daemon.
//!
//! Values are merged from defaults, an optional `reaperd.toml` file and
//! `REAPERD__`-prefixed environment variables (double underscore as the
//! section separator, e.g. `REAPERD__REAPER__CHUNK_SIZE`).

use std::path::Path;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Data source name for the catalog database (PostgreSQL or SQLite DSN)
    pub dsn: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dsn: String::from("sqlite://.data/catalog.db"),
        }
    }
}

impl DatabaseConfig {
    /// Create an in-memory database configuration for tests
    pub fn in_memory() -> Self {
        Self {
            dsn: String::from("sqlite::memory:"),
        }
    }
}

/// Reaper fleet configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReaperConfig {
    /// Enable the reaper fleet.
    ///
    /// Env: REAPERD__REAPER__ENABLED
    #[serde(default)]
    pub enabled: bool,

    /// Sleep between reap cycles for each worker loop.
    ///
    /// Env: REAPERD__REAPER__SLEEP_TIME
    #[serde(with = "humantime_serde")]
    pub sleep_time: Duration,

    /// Maximum number of entries submitted to the deletion gateway per batch.
    ///
    /// Env: REAPERD__REAPER__CHUNK_SIZE
    pub chunk_size: usize,

    /// Number of independent worker loops hosted by this process.
    ///
    /// Env: REAPERD__REAPER__TOTAL_WORKERS
    pub total_workers: usize,

    /// Maximum number of expired candidates fetched per cycle.
    ///
    /// Env: REAPERD__REAPER__CANDIDATE_LIMIT
    pub candidate_limit: usize,

    /// Lower bound of the randomized quarantine window after a lock conflict.
    ///
    /// Env: REAPERD__REAPER__MIN_BACKOFF
    #[serde(with = "humantime_serde")]
    pub min_backoff: Duration,

    /// Upper bound of the randomized quarantine window after a lock conflict.
    ///
    /// Env: REAPERD__REAPER__MAX_BACKOFF
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            enabled: false, // Disabled by default for safety
            sleep_time: Duration::from_secs(60),
            chunk_size: 10,
            total_workers: 1,
            candidate_limit: 10_000,
            min_backoff: Duration::from_secs(600),  // 10 minutes
            max_backoff: Duration::from_secs(2400), // 40 minutes
        }
    }
}

impl ReaperConfig {
    /// Validate the reaper configuration.
    ///
    /// Checks:
    /// - chunk size, worker count and candidate limit are non-zero
    /// - sleep time is positive
    /// - the backoff window is well formed (min <= max, min positive)
    pub fn validate(&self) -> Result<(), ReaperConfigError> {
        if self.chunk_size == 0 {
            return Err(ReaperConfigError::ZeroChunkSize);
        }
        if self.total_workers == 0 {
            return Err(ReaperConfigError::ZeroTotalWorkers);
        }
        if self.candidate_limit == 0 {
            return Err(ReaperConfigError::ZeroCandidateLimit);
        }
        if self.sleep_time.is_zero() {
            return Err(ReaperConfigError::ZeroSleepTime);
        }
        if self.min_backoff.is_zero() || self.min_backoff > self.max_backoff {
            return Err(ReaperConfigError::InvalidBackoffWindow {
                min: self.min_backoff,
                max: self.max_backoff,
            });
        }
        Ok(())
    }
}

/// Errors that can occur during reaper configuration validation.
#[derive(Error, Debug)]
pub enum ReaperConfigError {
    #[error("chunk_size must be positive")]
    ZeroChunkSize,

    #[error("total_workers must be positive")]
    ZeroTotalWorkers,

    #[error("candidate_limit must be positive")]
    ZeroCandidateLimit,

    #[error("sleep_time must be positive")]
    ZeroSleepTime,

    #[error("invalid backoff window: min {min:?} must be positive and <= max {max:?}")]
    InvalidBackoffWindow { min: Duration, max: Duration },
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Configuration {
    /// Catalog database configuration
    pub database: DatabaseConfig,
    /// Reaper fleet configuration
    pub reaper: ReaperConfig,
}

impl Configuration {
    pub fn load() -> Result<Self, Box<figment::Error>> {
        let config = Figment::from(Serialized::defaults(Configuration::default()))
            .merge(Toml::file("reaperd.toml"))
            .merge(Env::prefixed("REAPERD__").split("__"))
            .extract()
            .map_err(Box::new)?;
        Ok(config)
    }

    pub fn load_from_path(path: &Path) -> Result<Self, Box<figment::Error>> {
        let config = Figment::from(Serialized::defaults(Configuration::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("REAPERD__").split("__"))
            .extract()
            .map_err(Box::new)?;
        Ok(config)
    }
}
