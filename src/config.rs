//! Configuration for every Convoy subsystem.
//!
//! Loaded from a YAML file (`convoy.yml` in the working directory or
//! `~/.config/convoy/convoy.yml`) or built from defaults. Every field has a
//! default so a partial file works.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConvoyError, Result};

/// Top-level configuration for Convoy.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ConvoyConfig {
    /// Resource monitor settings.
    pub monitor: MonitorConfig,

    /// Backpressure gate settings.
    pub backpressure: BackpressureConfig,

    /// Per-caller rate limiter settings.
    pub rate_limiter: RateLimiterConfig,

    /// Connection pool settings.
    pub pool: PoolConfig,

    /// Scheduler settings.
    pub scheduler: SchedulerConfig,
}

impl ConvoyConfig {
    /// Load configuration with fallback chain.
    ///
    /// Search order:
    /// 1. Explicit path if provided
    /// 2. convoy.yml in current directory
    /// 3. ~/.config/convoy/convoy.yml
    /// 4. Defaults
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path);
        }

        let project_config = PathBuf::from("convoy.yml");
        if project_config.exists() {
            match Self::load_from_file(&project_config) {
                Ok(config) => {
                    tracing::info!("loaded config from convoy.yml");
                    return Ok(config);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to load convoy.yml");
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("convoy").join("convoy.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => {
                        tracing::info!(path = %user_config.display(), "loaded user config");
                        return Ok(config);
                    }
                    Err(e) => {
                        tracing::warn!(path = %user_config.display(), error = %e, "failed to load user config");
                    }
                }
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&content)
            .map_err(|e| ConvoyError::Config(format!("{}: {}", path.display(), e)))
    }
}

/// Resource monitor configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Ring buffer capacity (number of retained samples).
    pub sample_capacity: usize,
    /// Background sampling interval in seconds.
    pub sample_interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_capacity: 120,
            sample_interval_secs: 5,
        }
    }
}

/// Backpressure gate configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackpressureConfig {
    /// Maximum queue depth (concurrent admission slots).
    pub max_depth: usize,
    /// Fraction of max depth at which the gate reports pressure, in (0, 1].
    pub pressure_threshold: f64,
    /// Default acquisition timeout in milliseconds.
    pub default_timeout_ms: u64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            max_depth: 64,
            pressure_threshold: 0.8,
            default_timeout_ms: 30_000,
        }
    }
}

impl BackpressureConfig {
    /// Default acquisition timeout as a `Duration`.
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

/// Per-caller rate limiter configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Sustained admissions per window.
    pub rate_per_window: u64,
    /// Extra admissions allowed on top of the sustained rate.
    pub burst: u64,
    /// Sliding window length in seconds.
    pub window_secs: u64,
    /// Retry ceiling for `acquire` before giving up.
    pub max_retries: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            rate_per_window: 60,
            burst: 10,
            window_secs: 60,
            max_retries: 3,
        }
    }
}

/// Connection pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of connections, fixed at construction.
    pub pool_size: usize,
    /// Acquisition timeout in milliseconds.
    pub acquire_timeout_ms: u64,
    /// Minimum interval between health probes per connection, in seconds.
    pub health_check_interval_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            acquire_timeout_ms: 5_000,
            health_check_interval_secs: 30,
        }
    }
}

impl PoolConfig {
    /// Acquisition timeout as a `Duration`.
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Health probe interval as a `Duration`.
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Timeout for a backpressure slot per member, in milliseconds.
    pub admission_timeout_ms: u64,
    /// How often the concurrency limit is re-evaluated mid-flight, in seconds.
    pub retune_interval_secs: u64,
    /// Whether member outcomes are flushed into the work-item store.
    pub persist_results: bool,
    /// Optimistic-lock retry ceiling for persistence flushes.
    pub flush_retries: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            admission_timeout_ms: 30_000,
            retune_interval_secs: 5,
            persist_results: true,
            flush_retries: 3,
        }
    }
}

impl SchedulerConfig {
    /// Admission timeout as a `Duration`.
    pub fn admission_timeout(&self) -> Duration {
        Duration::from_millis(self.admission_timeout_ms)
    }

    /// Retune interval as a `Duration`.
    pub fn retune_interval(&self) -> Duration {
        Duration::from_secs(self.retune_interval_secs)
    }
}
