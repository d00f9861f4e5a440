//! Fixed-size SQLite connection pool with health checking.
//!
//! All `pool_size` connections are opened eagerly at construction, each in
//! WAL mode with a bounded busy wait and an enlarged cache. Acquisition is
//! scoped: the guard returns its connection to the pool exactly once on
//! drop, rolling back any transaction left open. A connection idle past the
//! health-check interval is probed on acquire and transparently replaced
//! when the probe fails.

use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use rusqlite::Connection;

use crate::config::PoolConfig;
use crate::error::{ConvoyError, Result};

/// One pooled connection with its probe bookkeeping.
struct PooledConn {
    conn: Connection,
    last_probe: Instant,
}

#[derive(Default)]
struct PoolCounters {
    acquires: AtomicU64,
    releases: AtomicU64,
    rejections: AtomicU64,
    health_check_failures: AtomicU64,
    reconnects: AtomicU64,
    active: AtomicUsize,
    total: AtomicUsize,
}

/// Snapshot of pool statistics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolStats {
    pub total_connections: usize,
    pub active_connections: usize,
    pub idle_connections: usize,
    pub acquires: u64,
    pub releases: u64,
    pub rejections: u64,
    pub health_check_failures: u64,
    pub reconnects: u64,
    pub utilization_percent: f64,
}

/// Fixed-size pool of SQLite connections.
pub struct ConnectionPool {
    config: PoolConfig,
    path: PathBuf,
    idle: Mutex<Vec<PooledConn>>,
    available: Condvar,
    counters: PoolCounters,
    closed: AtomicBool,
}

impl ConnectionPool {
    /// Open `pool_size` connections against `path`.
    ///
    /// Fails atomically: if any connection cannot be created, none survive.
    pub fn new(path: &Path, config: PoolConfig) -> Result<Self> {
        if config.pool_size == 0 {
            return Err(ConvoyError::Config("pool_size must be at least 1".into()));
        }

        let mut connections = Vec::with_capacity(config.pool_size);
        for _ in 0..config.pool_size {
            connections.push(PooledConn {
                conn: Self::open_connection(path)?,
                last_probe: Instant::now(),
            });
        }

        tracing::info!(
            path = %path.display(),
            pool_size = config.pool_size,
            "connection pool initialized"
        );

        let counters = PoolCounters::default();
        counters.total.store(config.pool_size, Ordering::Relaxed);

        Ok(Self {
            config,
            path: path.to_path_buf(),
            idle: Mutex::new(connections),
            available: Condvar::new(),
            counters,
            closed: AtomicBool::new(false),
        })
    }

    fn open_connection(path: &Path) -> Result<Connection> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             PRAGMA busy_timeout=5000;\
             PRAGMA cache_size=-8000;\
             PRAGMA foreign_keys=ON;",
        )?;
        Ok(conn)
    }

    /// Acquire a connection, waiting up to `timeout` (the configured default
    /// when `None`).
    pub fn acquire(&self, timeout: Option<Duration>) -> Result<PooledConnection<'_>> {
        let timeout = timeout.unwrap_or_else(|| self.config.acquire_timeout());
        let started = Instant::now();
        let deadline = started + timeout;

        let mut idle = self.idle.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(ConvoyError::InvalidState("connection pool is closed".into()));
            }

            if let Some(pooled) = idle.pop() {
                drop(idle);
                let pooled = self.ensure_healthy(pooled)?;
                self.counters.acquires.fetch_add(1, Ordering::Relaxed);
                self.counters.active.fetch_add(1, Ordering::Relaxed);
                return Ok(PooledConnection {
                    pool: self,
                    pooled: Some(pooled),
                });
            }

            let now = Instant::now();
            if now >= deadline {
                self.counters.rejections.fetch_add(1, Ordering::Relaxed);
                return Err(ConvoyError::PoolExhausted {
                    waited_ms: started.elapsed().as_millis() as u64,
                    pool_size: self.config.pool_size,
                });
            }

            let (guard, _timed_out) = self
                .available
                .wait_timeout(idle, deadline - now)
                .unwrap_or_else(|p| p.into_inner());
            idle = guard;
        }
    }

    /// Scoped acquisition: run `f` with a connection and return it to the
    /// pool on every exit path.
    pub fn with_connection<T, F>(&self, timeout: Option<Duration>, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut guard = self.acquire(timeout)?;
        f(&mut guard)
    }

    /// Probe a connection that is due its health check; replace it when the
    /// probe fails.
    fn ensure_healthy(&self, mut pooled: PooledConn) -> Result<PooledConn> {
        if pooled.last_probe.elapsed() < self.config.health_check_interval() {
            return Ok(pooled);
        }

        let probe: std::result::Result<i64, rusqlite::Error> =
            pooled.conn.query_row("SELECT 1", [], |row| row.get(0));
        match probe {
            Ok(_) => {
                pooled.last_probe = Instant::now();
                Ok(pooled)
            }
            Err(e) => {
                self.counters
                    .health_check_failures
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, "connection failed health probe, reconnecting");
                drop(pooled);
                match Self::open_connection(&self.path) {
                    Ok(conn) => {
                        self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
                        Ok(PooledConn {
                            conn,
                            last_probe: Instant::now(),
                        })
                    }
                    Err(reconnect_err) => {
                        // The slot is lost; surface the escalated failure.
                        self.counters.total.fetch_sub(1, Ordering::Relaxed);
                        Err(ConvoyError::ConnectionHealth(format!(
                            "probe failed ({}) and reconnect failed ({})",
                            e, reconnect_err
                        )))
                    }
                }
            }
        }
    }

    /// Return a connection to the pool. Called from guard drop only.
    fn release(&self, mut pooled: PooledConn) {
        // A transaction left open on return is always an abandoned one.
        if !pooled.conn.is_autocommit() {
            if let Err(e) = pooled.conn.execute_batch("ROLLBACK") {
                tracing::warn!(error = %e, "failed to roll back abandoned transaction");
            }
        }

        self.counters.releases.fetch_add(1, Ordering::Relaxed);
        self.counters.active.fetch_sub(1, Ordering::Relaxed);

        if self.closed.load(Ordering::SeqCst) {
            // Late return after shutdown: close instead of re-pooling.
            drop(pooled);
            self.counters.total.fetch_sub(1, Ordering::Relaxed);
            return;
        }

        let mut idle = self.idle.lock().unwrap_or_else(|p| p.into_inner());
        idle.push(pooled);
        drop(idle);
        self.available.notify_one();
    }

    /// Snapshot of pool statistics.
    pub fn stats(&self) -> PoolStats {
        let idle = self.idle.lock().unwrap_or_else(|p| p.into_inner()).len();
        let active = self.counters.active.load(Ordering::Relaxed);
        let total = self.counters.total.load(Ordering::Relaxed);
        PoolStats {
            total_connections: total,
            active_connections: active,
            idle_connections: idle,
            acquires: self.counters.acquires.load(Ordering::Relaxed),
            releases: self.counters.releases.load(Ordering::Relaxed),
            rejections: self.counters.rejections.load(Ordering::Relaxed),
            health_check_failures: self.counters.health_check_failures.load(Ordering::Relaxed),
            reconnects: self.counters.reconnects.load(Ordering::Relaxed),
            utilization_percent: if total == 0 {
                0.0
            } else {
                active as f64 / total as f64 * 100.0
            },
        }
    }

    /// Close the pool: drop every idle connection and wake all waiters.
    /// Idempotent; checked-out connections are closed as their guards drop.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut idle = self.idle.lock().unwrap_or_else(|p| p.into_inner());
        let drained = idle.len();
        self.counters.total.fetch_sub(drained, Ordering::Relaxed);
        idle.clear();
        drop(idle);
        self.available.notify_all();
        tracing::info!(drained = drained, "connection pool closed");
    }

    /// Whether the pool has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Configured pool size.
    pub fn pool_size(&self) -> usize {
        self.config.pool_size
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.close();
    }
}

/// Checked-out connection; returns itself to the pool on drop.
pub struct PooledConnection<'a> {
    pool: &'a ConnectionPool,
    pooled: Option<PooledConn>,
}

impl std::fmt::Debug for PooledConnection<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection").finish_non_exhaustive()
    }
}

impl Deref for PooledConnection<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.pooled.as_ref().expect("connection present until drop").conn
    }
}

impl DerefMut for PooledConnection<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.pooled.as_mut().expect("connection present until drop").conn
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(pooled) = self.pooled.take() {
            self.pool.release(pooled);
        }
    }
}
