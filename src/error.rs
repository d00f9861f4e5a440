//! Error types for Convoy
//!
//! Centralized error handling using thiserror. Admission and pool errors
//! carry enough context (depth, wait, expected/actual version) for callers
//! to retry without guessing.

use thiserror::Error;

/// All error types that can occur in Convoy
#[derive(Debug, Error)]
pub enum ConvoyError {
    /// Admission queue full; transient, retry with backoff
    #[error("backpressure: queue depth {current}/{max} after waiting {waited_ms}ms")]
    Backpressure {
        current: usize,
        max: usize,
        waited_ms: u64,
    },

    /// Caller exceeded its rate-limit quota; transient, retry after `wait_ms`
    #[error("rate limited: caller '{caller}' over {rate}/window, retry in {wait_ms}ms")]
    RateLimited {
        caller: String,
        wait_ms: u64,
        rate: u64,
    },

    /// Optimistic-lock version mismatch; re-read and retry
    #[error("concurrent update on '{id}': expected version {expected}, found {actual}")]
    ConcurrentUpdate {
        id: String,
        expected: i64,
        actual: i64,
    },

    /// No connection became available within the timeout; transient
    #[error("connection pool exhausted: {pool_size} connections busy after {waited_ms}ms")]
    PoolExhausted { waited_ms: u64, pool_size: usize },

    /// A connection failed its health probe and could not be replaced
    #[error("connection health check failed: {0}")]
    ConnectionHealth(String),

    /// Work item not found in the store
    #[error("work item not found: {0}")]
    ItemNotFound(String),

    /// Attempted to create a work item with an id that already exists
    #[error("work item already exists: {0}")]
    DuplicateItem(String),

    /// Convoy not found in the scheduler
    #[error("convoy not found: {0}")]
    ConvoyNotFound(String),

    /// No handler registered under the given identifier
    #[error("unknown handler: {0}")]
    UnknownHandler(String),

    /// Invalid state transition or operation
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Handler execution error, recorded on the member that raised it
    #[error("handler error: {0}")]
    Handler(String),

    /// Configuration error
    #[error("config error: {0}")]
    Config(String),

    /// SQLite error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for Convoy operations
pub type Result<T> = std::result::Result<T, ConvoyError>;
