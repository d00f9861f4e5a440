//! Convoy - a resource-adaptive concurrent scheduling engine
//!
//! Convoy executes batches of work items ("convoys") through an admission
//! layer (bounded backpressure gate + per-caller rate limiter) at a
//! concurrency level tuned to live CPU/memory availability, with work-item
//! state persisted under optimistic locking in an embedded SQLite store.

pub mod admission;
pub mod config;
pub mod domain;
pub mod error;
pub mod id;
pub mod monitor;
pub mod pool;
pub mod scheduler;
pub mod store;

pub use error::{ConvoyError, Result};
