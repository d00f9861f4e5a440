//! Per-caller token bucket over a sliding window.
//!
//! Each caller gets an independent quota: `rate + burst` admissions per
//! window. One caller exhausting its bucket never affects another's.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::RateLimiterConfig;
use crate::error::{ConvoyError, Result};

/// Minimum sleep between retry attempts in `acquire`.
const RETRY_FLOOR: Duration = Duration::from_millis(10);

/// Sliding-window rate limiter keyed by caller id.
pub struct RateLimiter {
    config: RateLimiterConfig,
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    /// Create a limiter with the given configuration.
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.config.window_secs)
    }

    fn limit(&self) -> usize {
        (self.config.rate_per_window + self.config.burst) as usize
    }

    /// Try to admit one call for `caller`; records a timestamp on admission.
    pub fn allow(&self, caller: &str) -> bool {
        let now = Instant::now();
        let window = self.window();
        let mut windows = self.windows.lock().unwrap_or_else(|p| p.into_inner());
        let timestamps = windows.entry(caller.to_string()).or_default();

        prune(timestamps, now, window);

        if timestamps.len() < self.limit() {
            timestamps.push_back(now);
            true
        } else {
            false
        }
    }

    /// Time until the oldest in-window admission expires; zero when the
    /// caller is under its limit.
    pub fn wait_time(&self, caller: &str) -> Duration {
        let now = Instant::now();
        let window = self.window();
        let mut windows = self.windows.lock().unwrap_or_else(|p| p.into_inner());
        let Some(timestamps) = windows.get_mut(caller) else {
            return Duration::ZERO;
        };

        prune(timestamps, now, window);

        if timestamps.len() < self.limit() {
            return Duration::ZERO;
        }
        match timestamps.front() {
            Some(oldest) => (*oldest + window).saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }

    /// Acquire a token, sleeping and retrying up to the configured ceiling.
    ///
    /// Exhausting the retries yields `ConvoyError::RateLimited` with the
    /// caller id, the last computed wait, and the configured rate, so the
    /// caller knows how long until the window opens again.
    pub async fn acquire(&self, caller: &str) -> Result<()> {
        let mut wait = Duration::ZERO;

        for attempt in 0..=self.config.max_retries {
            if self.allow(caller) {
                return Ok(());
            }
            wait = self.wait_time(caller).max(RETRY_FLOOR);
            if attempt == self.config.max_retries {
                break;
            }
            tracing::debug!(
                caller = caller,
                attempt = attempt + 1,
                wait_ms = wait.as_millis() as u64,
                "rate limited, backing off"
            );
            tokio::time::sleep(wait).await;
        }

        Err(ConvoyError::RateLimited {
            caller: caller.to_string(),
            wait_ms: wait.as_millis() as u64,
            rate: self.config.rate_per_window,
        })
    }

    /// Number of callers with tracked windows.
    pub fn tracked_callers(&self) -> usize {
        self.windows.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Drop all tracked windows. Testing hook.
    pub fn reset(&self) {
        self.windows
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default())
    }
}

fn prune(timestamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(front) = timestamps.front() {
        if now.duration_since(*front) >= window {
            timestamps.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(rate: u64, burst: u64, window_secs: u64) -> RateLimiter {
        RateLimiter::new(RateLimiterConfig {
            rate_per_window: rate,
            burst,
            window_secs,
            max_retries: 2,
        })
    }

    #[test]
    fn test_allows_up_to_limit() {
        let limiter = limiter(5, 0, 60);
        for _ in 0..5 {
            assert!(limiter.allow("a"));
        }
        assert!(!limiter.allow("a"));
    }

    #[test]
    fn test_burst_extends_limit() {
        let limiter = limiter(2, 3, 60);
        for _ in 0..5 {
            assert!(limiter.allow("a"));
        }
        assert!(!limiter.allow("a"));
    }

    #[test]
    fn test_window_refills() {
        let limiter = limiter(5, 0, 1);
        for _ in 0..5 {
            assert!(limiter.allow("a"));
        }
        assert!(!limiter.allow("a"));

        std::thread::sleep(Duration::from_millis(1100));
        assert!(limiter.allow("a"));
    }

    #[test]
    fn test_callers_are_independent() {
        let limiter = limiter(2, 0, 60);
        assert!(limiter.allow("a"));
        assert!(limiter.allow("a"));
        assert!(!limiter.allow("a"));

        // Caller "b" has a full quota of its own
        assert!(limiter.allow("b"));
        assert!(limiter.allow("b"));
        assert_eq!(limiter.tracked_callers(), 2);
    }

    #[test]
    fn test_wait_time_zero_under_limit() {
        let limiter = limiter(5, 0, 60);
        assert_eq!(limiter.wait_time("a"), Duration::ZERO);
        limiter.allow("a");
        assert_eq!(limiter.wait_time("a"), Duration::ZERO);
    }

    #[test]
    fn test_wait_time_positive_at_limit() {
        let limiter = limiter(1, 0, 60);
        assert!(limiter.allow("a"));
        let wait = limiter.wait_time("a");
        assert!(wait > Duration::from_secs(50));
        assert!(wait <= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_acquire_succeeds_under_limit() {
        let limiter = limiter(5, 0, 60);
        assert!(limiter.acquire("a").await.is_ok());
    }

    #[tokio::test]
    async fn test_acquire_retries_then_succeeds() {
        let limiter = limiter(1, 0, 1);
        assert!(limiter.allow("a"));
        // Bucket refills within the retry budget (window is 1s, 2 retries)
        assert!(limiter.acquire("a").await.is_ok());
    }

    #[tokio::test]
    async fn test_acquire_exhausts_retries() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            rate_per_window: 1,
            burst: 0,
            window_secs: 60,
            max_retries: 0,
        });
        assert!(limiter.allow("a"));

        let err = limiter.acquire("a").await.unwrap_err();
        match err {
            ConvoyError::RateLimited { caller, rate, .. } => {
                assert_eq!(caller, "a");
                assert_eq!(rate, 1);
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_acquire_error_carries_remaining_window_wait() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            rate_per_window: 1,
            burst: 0,
            window_secs: 60,
            max_retries: 0,
        });
        assert!(limiter.allow("a"));

        let err = limiter.acquire("a").await.unwrap_err();
        match err {
            ConvoyError::RateLimited { wait_ms, .. } => {
                // The wait is the time until the window admits again, not an
                // accumulated sleep total (nothing was slept here)
                assert!(wait_ms > 50_000);
                assert!(wait_ms <= 60_000);
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }
    }

    #[test]
    fn test_reset_clears_windows() {
        let limiter = limiter(1, 0, 60);
        assert!(limiter.allow("a"));
        assert!(!limiter.allow("a"));

        limiter.reset();
        assert!(limiter.allow("a"));
    }
}
