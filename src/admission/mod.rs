//! Admission control: the gates work passes before consuming capacity.
//!
//! Two independent gates composed by callers: `Backpressure` bounds the
//! number of in-flight admissions, `RateLimiter` bounds per-caller admission
//! rate over a sliding window. Both are counters/clocks only; neither knows
//! about the pool or the monitor.

mod backpressure;
mod rate_limit;

pub use backpressure::{Backpressure, BackpressureGuard, BackpressureStats};
pub use rate_limit::RateLimiter;
