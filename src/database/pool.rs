//! # Connection Pool
//!
//! Async connection pooling over raw SQLite connections with explicit
//! min/max sizing, acquire timeouts, release-time validation, idle
//! eviction, and health checks. A connection is owned by exactly one
//! caller between acquire and release; the returned guard hands it back
//! (or closes it when marked invalid) on drop.

use crate::database::{DatabaseConfig, DatabaseError, Result};
use parking_lot::Mutex;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
use sqlx::{Connection, SqliteConnection};
use std::ops::{Deref, DerefMut};
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting in the pool
    Idle,
    /// Owned by a caller
    InUse,
    /// Failed validation; will be closed on release
    Invalid,
}

/// Per-connection statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionStats {
    /// Queries executed on this connection
    pub total_queries: u64,

    /// Cumulative execution time in microseconds
    pub total_time_us: u64,

    /// Queries over the slow threshold
    pub slow_queries: u64,

    /// Driver errors observed
    pub errors: u64,
}

/// One pooled SQLite connection
#[derive(Debug)]
pub struct PooledConnection {
    /// Pool-unique id
    pub id: u64,

    /// Lifecycle state
    pub state: ConnectionState,

    /// Creation time
    pub created_at: Instant,

    /// Last acquire or release
    pub last_used_at: Instant,

    /// Usage statistics
    pub stats: ConnectionStats,

    /// The underlying driver connection
    conn: SqliteConnection,
}

impl PooledConnection {
    /// Mutable access to the driver connection
    pub fn connection(&mut self) -> &mut SqliteConnection {
        &mut self.conn
    }

    /// Record one executed query
    pub fn record_query(&mut self, duration: Duration, slow: bool) {
        self.stats.total_queries += 1;
        self.stats.total_time_us += duration.as_micros() as u64;
        if slow {
            self.stats.slow_queries += 1;
        }
    }

    /// Record a driver error
    pub fn record_error(&mut self) {
        self.stats.errors += 1;
    }
}

/// Pool-level statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    /// Open connections (idle + in use)
    pub current_size: u32,

    /// Idle connections
    pub idle: usize,

    /// Connections created since startup
    pub created: u64,

    /// Connections closed since startup
    pub closed: u64,

    /// Successful acquires
    pub acquired: u64,

    /// Acquire timeouts
    pub acquire_timeouts: u64,

    /// Idle-timeout evictions
    pub idle_evictions: u64,

    /// Whether the last health check passed
    pub healthy: bool,
}

#[derive(Debug)]
struct PoolInner {
    config: DatabaseConfig,
    connect_options: SqliteConnectOptions,
    idle: Mutex<Vec<PooledConnection>>,
    permits: Arc<Semaphore>,
    size: AtomicU32,
    next_id: AtomicU64,
    created: AtomicU64,
    closed: AtomicU64,
    acquired: AtomicU64,
    acquire_timeouts: AtomicU64,
    idle_evictions: AtomicU64,
    healthy: std::sync::atomic::AtomicBool,
}

impl PoolInner {
    fn close_connection(&self, connection: PooledConnection) {
        drop(connection);
        self.size.fetch_sub(1, Ordering::Relaxed);
        self.closed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Connection pool with health monitoring
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
    maintenance: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ConnectionPool {
    /// Create a pool and pre-fill it to `min_connections`
    pub async fn new(config: DatabaseConfig) -> Result<Self> {
        let connect_options = Self::connect_options(&config)?;

        let inner = Arc::new(PoolInner {
            permits: Arc::new(Semaphore::new(config.max_connections as usize)),
            idle: Mutex::new(Vec::new()),
            connect_options,
            size: AtomicU32::new(0),
            next_id: AtomicU64::new(1),
            created: AtomicU64::new(0),
            closed: AtomicU64::new(0),
            acquired: AtomicU64::new(0),
            acquire_timeouts: AtomicU64::new(0),
            idle_evictions: AtomicU64::new(0),
            healthy: std::sync::atomic::AtomicBool::new(true),
            config,
        });

        let pool = Self {
            inner,
            maintenance: Arc::new(Mutex::new(None)),
        };

        for _ in 0..pool.inner.config.min_connections {
            let connection = pool.create_connection().await?;
            pool.inner.idle.lock().push(connection);
        }

        pool.start_maintenance();
        log::info!(
            "connection pool ready: min={} max={}",
            pool.inner.config.min_connections,
            pool.inner.config.max_connections
        );
        Ok(pool)
    }

    fn connect_options(config: &DatabaseConfig) -> Result<SqliteConnectOptions> {
        let options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|e| DatabaseError::ConnectionPool(format!("bad database url: {}", e)))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms));
        Ok(if config.enable_wal {
            options.journal_mode(SqliteJournalMode::Wal)
        } else {
            options
        })
    }

    async fn create_connection(&self) -> Result<PooledConnection> {
        let conn = SqliteConnection::connect_with(&self.inner.connect_options)
            .await
            .map_err(|e| DatabaseError::ConnectionPool(format!("connect failed: {}", e)))?;

        self.inner.size.fetch_add(1, Ordering::Relaxed);
        self.inner.created.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        Ok(PooledConnection {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            state: ConnectionState::Idle,
            created_at: now,
            last_used_at: now,
            stats: ConnectionStats::default(),
            conn,
        })
    }

    /// Acquire a connection, waiting up to the configured timeout
    ///
    /// Timeouts surface as `PoolTimeout` carrying the pool statistics.
    pub async fn acquire(&self) -> Result<PoolGuard> {
        let acquire_timeout = self.inner.config.acquire_timeout;
        let permit = match timeout(
            acquire_timeout,
            self.inner.permits.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(DatabaseError::ConnectionPool("pool is closed".into()));
            }
            Err(_) => {
                self.inner.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
                let stats = self.stats();
                return Err(DatabaseError::PoolTimeout {
                    waited: acquire_timeout,
                    size: stats.current_size,
                    idle: stats.idle,
                });
            }
        };

        // Holding a permit guarantees room for one owned connection
        loop {
            let candidate = self.inner.idle.lock().pop();
            match candidate {
                Some(mut connection) => {
                    if self.validate(&mut connection).await {
                        connection.state = ConnectionState::InUse;
                        connection.last_used_at = Instant::now();
                        self.inner.acquired.fetch_add(1, Ordering::Relaxed);
                        return Ok(PoolGuard {
                            connection: Some(connection),
                            inner: self.inner.clone(),
                            _permit: permit,
                        });
                    }
                    self.inner.close_connection(connection);
                }
                None => {
                    let mut connection = self.create_connection().await?;
                    connection.state = ConnectionState::InUse;
                    self.inner.acquired.fetch_add(1, Ordering::Relaxed);
                    return Ok(PoolGuard {
                        connection: Some(connection),
                        inner: self.inner.clone(),
                        _permit: permit,
                    });
                }
            }
        }
    }

    /// Fast-path validation: recently used connections are trusted,
    /// stale ones get a full `SELECT 1` probe
    async fn validate(&self, connection: &mut PooledConnection) -> bool {
        let fresh_window = Duration::from_secs(30);
        if connection.last_used_at.elapsed() < fresh_window {
            return true;
        }
        sqlx::query("SELECT 1")
            .execute(connection.connection())
            .await
            .is_ok()
    }

    /// Full health check through a pooled connection
    pub async fn health_check(&self) -> Result<HealthCheckResult> {
        let start = Instant::now();
        let result = async {
            let mut guard = self.acquire().await?;
            sqlx::query("SELECT 1")
                .execute(guard.connection())
                .await
                .map_err(|e| DatabaseError::QueryExecution(e.to_string()))?;
            Ok::<_, DatabaseError>(())
        }
        .await;

        let healthy = result.is_ok();
        self.inner.healthy.store(healthy, Ordering::Relaxed);
        let stats = self.stats();
        Ok(HealthCheckResult {
            healthy,
            latency: start.elapsed(),
            pool_size: stats.current_size,
            idle: stats.idle,
            error: result.err().map(|e| e.to_string()),
        })
    }

    /// Pool statistics
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            current_size: self.inner.size.load(Ordering::Relaxed),
            idle: self.inner.idle.lock().len(),
            created: self.inner.created.load(Ordering::Relaxed),
            closed: self.inner.closed.load(Ordering::Relaxed),
            acquired: self.inner.acquired.load(Ordering::Relaxed),
            acquire_timeouts: self.inner.acquire_timeouts.load(Ordering::Relaxed),
            idle_evictions: self.inner.idle_evictions.load(Ordering::Relaxed),
            healthy: self.inner.healthy.load(Ordering::Relaxed),
        }
    }

    /// Current open connections
    pub fn size(&self) -> u32 {
        self.inner.size.load(Ordering::Relaxed)
    }

    /// Evict idle connections past the idle timeout, never below min
    fn start_maintenance(&self) {
        let inner = self.inner.clone();
        let interval = inner.config.health_check_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;

                let idle_timeout = inner.config.idle_timeout;
                let min = inner.config.min_connections;
                let mut to_close = Vec::new();
                {
                    let mut idle = inner.idle.lock();
                    let mut kept = Vec::with_capacity(idle.len());
                    for connection in idle.drain(..) {
                        let total = inner.size.load(Ordering::Relaxed);
                        if connection.last_used_at.elapsed() > idle_timeout && total > min {
                            // Decrement before kept-count checks on the
                            // next iteration see the stale size
                            inner.size.fetch_sub(1, Ordering::Relaxed);
                            inner.closed.fetch_add(1, Ordering::Relaxed);
                            inner.idle_evictions.fetch_add(1, Ordering::Relaxed);
                            to_close.push(connection);
                        } else {
                            kept.push(connection);
                        }
                    }
                    *idle = kept;
                }
                if !to_close.is_empty() {
                    log::debug!("evicted {} idle connections", to_close.len());
                }
                drop(to_close);
            }
        });

        *self.maintenance.lock() = Some(handle);
    }

    /// Stop maintenance and close idle connections
    pub async fn close(&self) {
        if let Some(handle) = self.maintenance.lock().take() {
            handle.abort();
        }
        let idle: Vec<PooledConnection> = self.inner.idle.lock().drain(..).collect();
        for connection in idle {
            self.inner.close_connection(connection);
        }
    }
}

/// Health check result
#[derive(Debug, Clone)]
pub struct HealthCheckResult {
    /// Whether the probe query succeeded
    pub healthy: bool,

    /// Probe latency
    pub latency: Duration,

    /// Current pool size
    pub pool_size: u32,

    /// Idle connections
    pub idle: usize,

    /// Error message when unhealthy
    pub error: Option<String>,
}

/// Exclusive ownership of one pooled connection
///
/// Dropping the guard returns the connection to the idle set, or closes
/// it when it was marked invalid.
#[derive(Debug)]
pub struct PoolGuard {
    connection: Option<PooledConnection>,
    inner: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl PoolGuard {
    /// Mutable access to the driver connection
    pub fn connection(&mut self) -> &mut SqliteConnection {
        self.connection
            .as_mut()
            .expect("guard holds a connection until drop")
            .connection()
    }

    /// Mark the connection invalid; it will be closed instead of pooled
    pub fn invalidate(&mut self) {
        if let Some(connection) = self.connection.as_mut() {
            connection.state = ConnectionState::Invalid;
        }
    }

    /// Connection id
    pub fn id(&self) -> u64 {
        self.connection.as_ref().map(|c| c.id).unwrap_or(0)
    }
}

impl Deref for PoolGuard {
    type Target = PooledConnection;
    fn deref(&self) -> &Self::Target {
        self.connection.as_ref().expect("guard holds a connection")
    }
}

impl DerefMut for PoolGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.connection.as_mut().expect("guard holds a connection")
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            if connection.state == ConnectionState::Invalid {
                self.inner.close_connection(connection);
            } else {
                connection.state = ConnectionState::Idle;
                connection.last_used_at = Instant::now();
                self.inner.idle.lock().push(connection);
            }
        }
        // The permit drops with the guard, waking one waiter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(min: u32, max: u32, acquire_ms: u64) -> DatabaseConfig {
        DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            min_connections: min,
            max_connections: max,
            acquire_timeout: Duration::from_millis(acquire_ms),
            enable_wal: false,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_pool_prefills_to_min() {
        let pool = ConnectionPool::new(test_config(2, 5, 200)).await.unwrap();
        let stats = pool.stats();
        assert_eq!(stats.current_size, 2);
        assert_eq!(stats.idle, 2);
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let pool = ConnectionPool::new(test_config(1, 5, 200)).await.unwrap();

        {
            let mut guard = pool.acquire().await.unwrap();
            assert_eq!(guard.state, ConnectionState::InUse);
            sqlx::query("SELECT 1").execute(guard.connection()).await.unwrap();
        }

        // Released back to idle
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn test_capacity_bound_and_timeout() {
        let pool = ConnectionPool::new(test_config(2, 5, 200)).await.unwrap();

        let mut guards = Vec::new();
        for _ in 0..5 {
            guards.push(pool.acquire().await.unwrap());
        }
        assert_eq!(pool.size(), 5);

        // Sixth acquire times out after the configured 200 ms
        let start = Instant::now();
        let err = pool.acquire().await.unwrap_err();
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert!(matches!(err, DatabaseError::PoolTimeout { .. }));
        assert_eq!(pool.stats().acquire_timeouts, 1);

        // Releasing one connection unblocks a waiter quickly
        let waiter_pool = pool.clone();
        let waiter = tokio::spawn(async move { waiter_pool.acquire().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(guards.pop());
        let start = Instant::now();
        let guard = waiter.await.unwrap().unwrap();
        assert!(start.elapsed() < Duration::from_millis(100));
        drop(guard);
    }

    #[tokio::test]
    async fn test_invalidated_connection_closed() {
        let pool = ConnectionPool::new(test_config(1, 2, 200)).await.unwrap();
        let created_before = pool.stats().created;

        {
            let mut guard = pool.acquire().await.unwrap();
            guard.invalidate();
        }

        let stats = pool.stats();
        assert_eq!(stats.closed, 1);
        assert_eq!(stats.idle, 0);

        // Next acquire creates a fresh connection
        let _guard = pool.acquire().await.unwrap();
        assert_eq!(pool.stats().created, created_before + 1);
    }

    #[tokio::test]
    async fn test_health_check() {
        let pool = ConnectionPool::new(test_config(1, 2, 200)).await.unwrap();
        let result = pool.health_check().await.unwrap();
        assert!(result.healthy);
        assert!(result.error.is_none());
        assert!(pool.stats().healthy);
    }

    #[tokio::test]
    async fn test_connection_stats_recorded() {
        let pool = ConnectionPool::new(test_config(1, 1, 200)).await.unwrap();
        {
            let mut guard = pool.acquire().await.unwrap();
            guard.record_query(Duration::from_millis(5), false);
            guard.record_query(Duration::from_millis(500), true);
        }
        let mut guard = pool.acquire().await.unwrap();
        assert_eq!(guard.stats.total_queries, 2);
        assert_eq!(guard.stats.slow_queries, 1);
        let _ = guard.connection();
    }
}
