//! Bounded-queue backpressure gate.
//!
//! A fixed number of admission slots guards downstream capacity. Acquisition
//! is scoped: the returned guard releases its slot exactly once on drop, on
//! every exit path. Depth can never exceed the configured maximum or go
//! negative; the semaphore enforces both.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::BackpressureConfig;
use crate::error::{ConvoyError, Result};

/// Monotonic gate counters.
#[derive(Debug, Default)]
struct GateCounters {
    acquired: AtomicU64,
    released: AtomicU64,
    rejected: AtomicU64,
    peak_depth: AtomicUsize,
}

/// Snapshot of gate statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackpressureStats {
    pub acquired: u64,
    pub released: u64,
    pub rejected: u64,
    pub peak_depth: usize,
    pub current_depth: usize,
    pub max_depth: usize,
}

/// Bounded-queue admission gate.
pub struct Backpressure {
    config: BackpressureConfig,
    semaphore: Arc<Semaphore>,
    counters: Arc<GateCounters>,
}

impl Backpressure {
    /// Create a gate with the given configuration.
    pub fn new(config: BackpressureConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_depth));
        Self {
            config,
            semaphore,
            counters: Arc::new(GateCounters::default()),
        }
    }

    /// Current number of held slots.
    pub fn depth(&self) -> usize {
        self.config
            .max_depth
            .saturating_sub(self.semaphore.available_permits())
    }

    /// Configured maximum depth.
    pub fn max_depth(&self) -> usize {
        self.config.max_depth
    }

    /// Acquire a slot, waiting up to `timeout` (the configured default when
    /// `None`).
    ///
    /// Timeout yields `ConvoyError::Backpressure` carrying the current depth,
    /// the maximum, and the elapsed wait.
    pub async fn acquire(&self, timeout: Option<Duration>) -> Result<BackpressureGuard> {
        let timeout = timeout.unwrap_or_else(|| self.config.default_timeout());
        let started = Instant::now();

        let acquired = tokio::time::timeout(timeout, self.semaphore.clone().acquire_owned()).await;
        match acquired {
            Ok(Ok(permit)) => {
                self.counters.acquired.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .peak_depth
                    .fetch_max(self.depth(), Ordering::Relaxed);
                Ok(BackpressureGuard {
                    _permit: permit,
                    counters: Arc::clone(&self.counters),
                })
            }
            // The semaphore is never closed; treat it like a timeout anyway.
            Ok(Err(_)) | Err(_) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                let err = ConvoyError::Backpressure {
                    current: self.depth(),
                    max: self.config.max_depth,
                    waited_ms: started.elapsed().as_millis() as u64,
                };
                tracing::warn!(depth = self.depth(), max = self.config.max_depth, "admission slot timed out");
                Err(err)
            }
        }
    }

    /// True when depth has reached the pressure threshold.
    pub fn is_under_pressure(&self) -> bool {
        let threshold = (self.config.pressure_threshold * self.config.max_depth as f64).ceil();
        self.depth() as f64 >= threshold
    }

    /// Snapshot of gate statistics.
    pub fn stats(&self) -> BackpressureStats {
        BackpressureStats {
            acquired: self.counters.acquired.load(Ordering::Relaxed),
            released: self.counters.released.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            peak_depth: self.counters.peak_depth.load(Ordering::Relaxed),
            current_depth: self.depth(),
            max_depth: self.config.max_depth,
        }
    }

    /// Reset the counters. Testing hook; held slots are unaffected.
    pub fn reset_stats(&self) {
        self.counters.acquired.store(0, Ordering::Relaxed);
        self.counters.released.store(0, Ordering::Relaxed);
        self.counters.rejected.store(0, Ordering::Relaxed);
        self.counters.peak_depth.store(0, Ordering::Relaxed);
    }
}

impl Default for Backpressure {
    fn default() -> Self {
        Self::new(BackpressureConfig::default())
    }
}

/// Held admission slot; dropping it releases the slot exactly once.
pub struct BackpressureGuard {
    _permit: OwnedSemaphorePermit,
    counters: Arc<GateCounters>,
}

impl Drop for BackpressureGuard {
    fn drop(&mut self) {
        self.counters.released.fetch_add(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for BackpressureGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackpressureGuard").finish_non_exhaustive()
    }
}
