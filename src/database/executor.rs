//! # Query Executor
//!
//! Executes SQL through the connection pool with:
//! - Metadata capture (duration, row counts, fingerprints) per query
//! - A TTL read cache keyed by `(fingerprint, params)`, invalidated on
//!   mutations against referenced tables
//! - Prepared-statement reuse through a bounded LRU keyed by fingerprint
//! - Transactions with savepoint nesting and automatic rollback
//! - Slow-query logging above a configurable threshold
//!
//! Driver failures are classified for the retry coordinator: lock/busy
//! and connection errors are transient, constraint and syntax errors are
//! permanent.

use crate::database::optimizer::{self, QueryOptimizer};
use crate::database::pool::{ConnectionPool, PoolGuard};
use crate::database::{DatabaseConfig, DatabaseError, Result};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use lru::LruCache;
use parking_lot::Mutex;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Arguments, Column, Row as SqlxRow, TypeInfo, ValueRef};
use std::collections::{HashMap, HashSet, VecDeque};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A bound SQL parameter
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// SQL NULL
    Null,
    /// INTEGER
    Integer(i64),
    /// REAL
    Real(f64),
    /// TEXT
    Text(String),
    /// BLOB
    Blob(Vec<u8>),
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}
impl From<u64> for SqlValue {
    fn from(v: u64) -> Self {
        SqlValue::Integer(v as i64)
    }
}
impl From<usize> for SqlValue {
    fn from(v: usize) -> Self {
        SqlValue::Integer(v as i64)
    }
}
impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}
impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}
impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl SqlValue {
    /// The contained integer, when this is an INTEGER
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// The contained text, when this is TEXT
    pub fn as_text(&self) -> Option<&str> {
        match self {
            SqlValue::Text(v) => Some(v),
            _ => None,
        }
    }

    /// The contained real, when this is REAL
    pub fn as_real(&self) -> Option<f64> {
        match self {
            SqlValue::Real(v) => Some(*v),
            _ => None,
        }
    }
}

/// One decoded result row
pub type Row = HashMap<String, SqlValue>;

/// Result of one execution
#[derive(Debug, Clone)]
pub struct QueryResult {
    /// Decoded rows (empty for mutations)
    pub rows: Vec<Row>,

    /// Rows returned, or rows affected for mutations
    pub row_count: usize,

    /// Execution time; zero when served from the read cache
    pub duration_ms: u64,

    /// Whether the read cache served this result
    pub cached: bool,

    /// Fingerprint of the normalized statement
    pub query_hash: String,
}

/// Handle to a prepared statement
#[derive(Debug, Clone)]
pub struct PreparedHandle {
    /// Statement fingerprint (the LRU key)
    pub fingerprint: String,
}

/// One slow-query record
#[derive(Debug, Clone)]
pub struct SlowQuery {
    /// Offending statement
    pub sql: String,

    /// Observed duration
    pub duration_ms: u64,

    /// When it ran
    pub at: DateTime<Utc>,

    /// Connection that ran it
    pub connection_id: u64,
}

/// Executor statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutorStats {
    /// Statements executed
    pub queries: u64,

    /// Driver errors
    pub errors: u64,

    /// Read-cache hits
    pub cache_hits: u64,

    /// Slow queries recorded
    pub slow_queries: u64,

    /// Transactions committed
    pub transactions: u64,

    /// Transactions rolled back
    pub rollbacks: u64,
}

struct CachedQuery {
    rows: Vec<Row>,
    tables: HashSet<String>,
    cached_at: Instant,
}

/// Pooled query executor
pub struct QueryExecutor {
    /// Connection pool
    pool: ConnectionPool,

    /// Pattern analyzer fed by every execution
    optimizer: Arc<QueryOptimizer>,

    /// Prepared statements by fingerprint
    prepared: Mutex<LruCache<String, String>>,

    /// Read cache
    read_cache: Mutex<HashMap<String, CachedQuery>>,

    /// Recent slow queries
    slow_log: Mutex<VecDeque<SlowQuery>>,

    /// Slow threshold
    slow_threshold: Duration,

    /// Read-cache TTL; zero disables caching
    cache_ttl: Duration,

    queries: AtomicU64,
    errors: AtomicU64,
    cache_hits: AtomicU64,
    slow_queries: AtomicU64,
    transactions: AtomicU64,
    rollbacks: AtomicU64,
}

impl QueryExecutor {
    /// Create an executor over a pool
    pub fn new(pool: ConnectionPool, config: &DatabaseConfig) -> Self {
        Self {
            pool,
            optimizer: Arc::new(QueryOptimizer::new(
                256,
                Duration::from_secs(10),
                config.n_plus_one_threshold,
            )),
            prepared: Mutex::new(LruCache::new(
                NonZeroUsize::new(config.statement_cache_capacity.max(1))
                    .expect("capacity is nonzero"),
            )),
            read_cache: Mutex::new(HashMap::new()),
            slow_log: Mutex::new(VecDeque::with_capacity(128)),
            slow_threshold: config.slow_query_threshold,
            cache_ttl: config.query_cache_ttl,
            queries: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            slow_queries: AtomicU64::new(0),
            transactions: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
        }
    }

    /// The underlying pool
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// The pattern analyzer
    pub fn optimizer(&self) -> Arc<QueryOptimizer> {
        self.optimizer.clone()
    }

    /// Execute one statement
    pub async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<QueryResult> {
        let fingerprint = optimizer::fingerprint(sql);
        let is_select = !optimizer::is_mutation(sql);

        if is_select && !self.cache_ttl.is_zero() {
            let cache_key = Self::cache_key(&fingerprint, params);
            if let Some(rows) = self.cached_rows(&cache_key) {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(QueryResult {
                    row_count: rows.len(),
                    rows,
                    duration_ms: 0,
                    cached: true,
                    query_hash: fingerprint,
                });
            }
        }

        let mut guard = self.pool.acquire().await?;
        let result = self
            .execute_on(&mut guard, sql, params, &fingerprint)
            .await?;

        if is_select && !self.cache_ttl.is_zero() {
            let cache_key = Self::cache_key(&fingerprint, params);
            self.read_cache.lock().insert(
                cache_key,
                CachedQuery {
                    rows: result.rows.clone(),
                    tables: optimizer::referenced_tables(sql),
                    cached_at: Instant::now(),
                },
            );
        } else if !is_select {
            self.invalidate_tables(&optimizer::referenced_tables(sql));
        }

        Ok(result)
    }

    /// Execute one statement repeatedly over a parameter batch
    ///
    /// Uses a single connection; the driver's per-connection statement
    /// cache makes the repeated executions prepared-statement reuse.
    pub async fn execute_many(
        &self,
        sql: &str,
        params_list: &[Vec<SqlValue>],
    ) -> Result<Vec<QueryResult>> {
        let fingerprint = optimizer::fingerprint(sql);
        let mut guard = self.pool.acquire().await?;

        let mut results = Vec::with_capacity(params_list.len());
        for params in params_list {
            let result = self
                .execute_on(&mut guard, sql, params, &fingerprint)
                .await?;
            results.push(result);
        }

        if optimizer::is_mutation(sql) {
            self.invalidate_tables(&optimizer::referenced_tables(sql));
        }
        Ok(results)
    }

    async fn execute_on(
        &self,
        guard: &mut PoolGuard,
        sql: &str,
        params: &[SqlValue],
        fingerprint: &str,
    ) -> Result<QueryResult> {
        let start = Instant::now();
        let is_select = !optimizer::is_mutation(sql);
        self.optimizer.observe(sql);

        let outcome = if is_select {
            run_fetch(guard, sql, params).await
        } else {
            run_execute(guard, sql, params).await
        };

        let duration = start.elapsed();
        self.queries.fetch_add(1, Ordering::Relaxed);

        match outcome {
            Ok((rows, row_count)) => {
                let slow = duration > self.slow_threshold;
                guard.record_query(duration, slow);
                if slow {
                    self.record_slow(sql, duration, guard.id());
                }
                Ok(QueryResult {
                    rows,
                    row_count,
                    duration_ms: duration.as_millis() as u64,
                    cached: false,
                    query_hash: fingerprint.to_string(),
                })
            }
            Err(error) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                guard.record_error();
                let classified = classify_sqlx_error(error);
                if matches!(classified, DatabaseError::ConnectionPool(_)) {
                    guard.invalidate();
                }
                Err(classified)
            }
        }
    }

    /// Register (or refresh) a prepared statement and return its handle
    pub fn prepared(&self, sql: &str) -> PreparedHandle {
        let fingerprint = optimizer::fingerprint(sql);
        self.prepared
            .lock()
            .put(fingerprint.clone(), sql.to_string());
        PreparedHandle { fingerprint }
    }

    /// Execute a previously prepared statement
    pub async fn execute_prepared(
        &self,
        handle: &PreparedHandle,
        params: &[SqlValue],
    ) -> Result<QueryResult> {
        let sql = self
            .prepared
            .lock()
            .get(&handle.fingerprint)
            .cloned()
            .ok_or_else(|| {
                DatabaseError::QueryExecution(format!(
                    "prepared statement {} evicted",
                    handle.fingerprint
                ))
            })?;
        self.execute(&sql, params).await
    }

    /// Run `block` inside a transaction
    ///
    /// COMMIT on success, ROLLBACK on error. The read cache is cleared
    /// after a commit since the block may have touched any table.
    pub async fn transaction<T, F>(&self, block: F) -> Result<T>
    where
        F: for<'t> FnOnce(&'t mut TransactionScope) -> BoxFuture<'t, Result<T>>,
    {
        let mut tx = self.begin().await?;
        match block(&mut tx).await {
            Ok(value) => {
                tx.commit().await?;
                self.transactions.fetch_add(1, Ordering::Relaxed);
                self.read_cache.lock().clear();
                Ok(value)
            }
            Err(error) => {
                if let Err(rollback_error) = tx.rollback().await {
                    log::error!("rollback failed: {}", rollback_error);
                }
                self.rollbacks.fetch_add(1, Ordering::Relaxed);
                Err(error)
            }
        }
    }

    /// Open an explicit transaction scope
    pub async fn begin(&self) -> Result<TransactionScope> {
        let mut guard = self.pool.acquire().await?;
        sqlx::query("BEGIN")
            .execute(guard.connection())
            .await
            .map_err(|e| DatabaseError::Transaction(format!("BEGIN failed: {}", e)))?;
        Ok(TransactionScope {
            guard,
            savepoint_counter: 0,
            finished: false,
        })
    }

    /// Recent slow queries, newest last
    pub fn slow_queries(&self) -> Vec<SlowQuery> {
        self.slow_log.lock().iter().cloned().collect()
    }

    /// Executor statistics
    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            queries: self.queries.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            slow_queries: self.slow_queries.load(Ordering::Relaxed),
            transactions: self.transactions.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
        }
    }

    fn cache_key(fingerprint: &str, params: &[SqlValue]) -> String {
        format!("{}|{:?}", fingerprint, params)
    }

    fn cached_rows(&self, cache_key: &str) -> Option<Vec<Row>> {
        let mut cache = self.read_cache.lock();
        match cache.get(cache_key) {
            Some(entry) if entry.cached_at.elapsed() < self.cache_ttl => {
                Some(entry.rows.clone())
            }
            Some(_) => {
                cache.remove(cache_key);
                None
            }
            None => None,
        }
    }

    /// Drop cached results referencing any of `tables`
    fn invalidate_tables(&self, tables: &HashSet<String>) {
        if tables.is_empty() {
            return;
        }
        self.read_cache
            .lock()
            .retain(|_, cached| cached.tables.is_disjoint(tables));
    }

    fn record_slow(&self, sql: &str, duration: Duration, connection_id: u64) {
        self.slow_queries.fetch_add(1, Ordering::Relaxed);
        log::warn!(
            "slow query ({} ms): {}",
            duration.as_millis(),
            sql.chars().take(200).collect::<String>()
        );
        let mut slow_log = self.slow_log.lock();
        if slow_log.len() >= 128 {
            slow_log.pop_front();
        }
        slow_log.push_back(SlowQuery {
            sql: sql.to_string(),
            duration_ms: duration.as_millis() as u64,
            at: Utc::now(),
            connection_id,
        });
    }
}

// ============================================================================
// Transactions
// ============================================================================

/// An open transaction on a dedicated connection
///
/// Dropping the scope without commit or rollback invalidates the
/// connection; closing it discards the uncommitted work.
pub struct TransactionScope {
    guard: PoolGuard,
    savepoint_counter: u32,
    finished: bool,
}

impl TransactionScope {
    /// Execute a statement inside the transaction (bypasses the read cache)
    pub async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<QueryResult> {
        let fingerprint = optimizer::fingerprint(sql);
        let start = Instant::now();
        let is_select = !optimizer::is_mutation(sql);

        let outcome = if is_select {
            run_fetch(&mut self.guard, sql, params).await
        } else {
            run_execute(&mut self.guard, sql, params).await
        };

        match outcome {
            Ok((rows, row_count)) => Ok(QueryResult {
                rows,
                row_count,
                duration_ms: start.elapsed().as_millis() as u64,
                cached: false,
                query_hash: fingerprint,
            }),
            Err(error) => {
                self.guard.record_error();
                Err(classify_sqlx_error(error))
            }
        }
    }

    /// Create a savepoint with a scope-unique name
    pub async fn savepoint(&mut self) -> Result<String> {
        self.savepoint_counter += 1;
        let name = format!("sp_{}", self.savepoint_counter);
        sqlx::query(&format!("SAVEPOINT {}", name))
            .execute(self.guard.connection())
            .await
            .map_err(|e| DatabaseError::Transaction(format!("SAVEPOINT failed: {}", e)))?;
        Ok(name)
    }

    /// Release a savepoint, keeping its effects
    pub async fn release(&mut self, name: &str) -> Result<()> {
        sqlx::query(&format!("RELEASE {}", name))
            .execute(self.guard.connection())
            .await
            .map_err(|e| DatabaseError::Transaction(format!("RELEASE failed: {}", e)))?;
        Ok(())
    }

    /// Roll back to a savepoint, discarding effects since it
    pub async fn rollback_to(&mut self, name: &str) -> Result<()> {
        sqlx::query(&format!("ROLLBACK TO {}", name))
            .execute(self.guard.connection())
            .await
            .map_err(|e| DatabaseError::Transaction(format!("ROLLBACK TO failed: {}", e)))?;
        Ok(())
    }

    /// Run `block` inside a savepoint: RELEASE on success, ROLLBACK TO on
    /// error
    pub async fn nested<T, F>(&mut self, block: F) -> Result<T>
    where
        F: for<'t> FnOnce(&'t mut TransactionScope) -> BoxFuture<'t, Result<T>>,
    {
        let name = self.savepoint().await?;
        match block(self).await {
            Ok(value) => {
                self.release(&name).await?;
                Ok(value)
            }
            Err(error) => {
                self.rollback_to(&name).await?;
                Err(error)
            }
        }
    }

    /// Commit the transaction
    pub async fn commit(mut self) -> Result<()> {
        sqlx::query("COMMIT")
            .execute(self.guard.connection())
            .await
            .map_err(|e| DatabaseError::Transaction(format!("COMMIT failed: {}", e)))?;
        self.finished = true;
        Ok(())
    }

    /// Roll back the transaction
    pub async fn rollback(mut self) -> Result<()> {
        sqlx::query("ROLLBACK")
            .execute(self.guard.connection())
            .await
            .map_err(|e| DatabaseError::Transaction(format!("ROLLBACK failed: {}", e)))?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for TransactionScope {
    fn drop(&mut self) {
        if !self.finished {
            // Closing the connection discards the open transaction
            self.guard.invalidate();
            log::warn!("transaction scope dropped without commit; discarding connection");
        }
    }
}

// ============================================================================
// Driver plumbing
// ============================================================================

fn bind_arguments<'q>(params: &'q [SqlValue]) -> SqliteArguments<'q> {
    let mut arguments = SqliteArguments::default();
    for param in params {
        match param {
            SqlValue::Null => arguments.add(Option::<i64>::None),
            SqlValue::Integer(v) => arguments.add(*v),
            SqlValue::Real(v) => arguments.add(*v),
            SqlValue::Text(v) => arguments.add(v.as_str()),
            SqlValue::Blob(v) => arguments.add(v.as_slice()),
        }
    }
    arguments
}

async fn run_fetch(
    guard: &mut PoolGuard,
    sql: &str,
    params: &[SqlValue],
) -> std::result::Result<(Vec<Row>, usize), sqlx::Error> {
    let rows = sqlx::query_with(sql, bind_arguments(params))
        .fetch_all(guard.connection())
        .await?;
    let decoded: Vec<Row> = rows.iter().map(decode_row).collect();
    let count = decoded.len();
    Ok((decoded, count))
}

async fn run_execute(
    guard: &mut PoolGuard,
    sql: &str,
    params: &[SqlValue],
) -> std::result::Result<(Vec<Row>, usize), sqlx::Error> {
    let outcome = sqlx::query_with(sql, bind_arguments(params))
        .execute(guard.connection())
        .await?;
    Ok((Vec::new(), outcome.rows_affected() as usize))
}

fn decode_row(row: &SqliteRow) -> Row {
    let mut decoded = HashMap::with_capacity(row.columns().len());
    for column in row.columns() {
        let idx = column.ordinal();
        let value = match row.try_get_raw(idx) {
            Ok(raw) if raw.is_null() => SqlValue::Null,
            Ok(raw) => match raw.type_info().name() {
                "INTEGER" | "BOOLEAN" => row
                    .try_get::<i64, _>(idx)
                    .map(SqlValue::Integer)
                    .unwrap_or(SqlValue::Null),
                "REAL" => row
                    .try_get::<f64, _>(idx)
                    .map(SqlValue::Real)
                    .unwrap_or(SqlValue::Null),
                "BLOB" => row
                    .try_get::<Vec<u8>, _>(idx)
                    .map(SqlValue::Blob)
                    .unwrap_or(SqlValue::Null),
                _ => row
                    .try_get::<String, _>(idx)
                    .map(SqlValue::Text)
                    .unwrap_or(SqlValue::Null),
            },
            Err(_) => SqlValue::Null,
        };
        decoded.insert(column.name().to_string(), value);
    }
    decoded
}

/// Classify a driver error for the retry coordinator
fn classify_sqlx_error(error: sqlx::Error) -> DatabaseError {
    match &error {
        sqlx::Error::Database(db_error) => {
            let message = db_error.message().to_string();
            let lowered = message.to_lowercase();
            if lowered.contains("constraint") {
                let constraint = message
                    .rsplit(':')
                    .next()
                    .map(|s| s.trim().to_string())
                    .unwrap_or_default();
                DatabaseError::Constraint { constraint, message }
            } else if lowered.contains("locked") || lowered.contains("busy") {
                DatabaseError::Busy(message)
            } else {
                DatabaseError::QueryExecution(message)
            }
        }
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            DatabaseError::ConnectionPool(error.to_string())
        }
        _ => DatabaseError::QueryExecution(error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    async fn executor() -> QueryExecutor {
        let config = DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            min_connections: 1,
            max_connections: 1,
            enable_wal: false,
            query_cache_ttl: Duration::from_secs(5),
            slow_query_threshold: Duration::from_millis(250),
            ..Default::default()
        };
        let pool = ConnectionPool::new(config.clone()).await.unwrap();
        let executor = QueryExecutor::new(pool, &config);
        executor
            .execute(
                "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL UNIQUE)",
                &[],
            )
            .await
            .unwrap();
        executor
    }

    #[tokio::test]
    async fn test_execute_and_fetch() {
        let executor = executor().await;
        let insert = executor
            .execute(
                "INSERT INTO items (id, name) VALUES (?, ?)",
                &[1i64.into(), "apple".into()],
            )
            .await
            .unwrap();
        assert_eq!(insert.row_count, 1);

        let select = executor
            .execute("SELECT id, name FROM items WHERE id = ?", &[1i64.into()])
            .await
            .unwrap();
        assert_eq!(select.row_count, 1);
        assert_eq!(select.rows[0]["name"].as_text(), Some("apple"));
        assert_eq!(select.rows[0]["id"].as_integer(), Some(1));
        assert!(!select.cached);
    }

    #[tokio::test]
    async fn test_read_cache_hit_and_invalidation() {
        let executor = executor().await;
        executor
            .execute(
                "INSERT INTO items (id, name) VALUES (?, ?)",
                &[1i64.into(), "apple".into()],
            )
            .await
            .unwrap();

        let first = executor
            .execute("SELECT * FROM items", &[])
            .await
            .unwrap();
        assert!(!first.cached);

        let second = executor.execute("SELECT * FROM items", &[]).await.unwrap();
        assert!(second.cached);
        assert_eq!(second.duration_ms, 0);
        assert_eq!(second.row_count, 1);

        // A mutation on the table invalidates the cached result
        executor
            .execute(
                "INSERT INTO items (id, name) VALUES (?, ?)",
                &[2i64.into(), "pear".into()],
            )
            .await
            .unwrap();
        let third = executor.execute("SELECT * FROM items", &[]).await.unwrap();
        assert!(!third.cached);
        assert_eq!(third.row_count, 2);
    }

    #[tokio::test]
    async fn test_execute_many_batch() {
        let executor = executor().await;
        let params: Vec<Vec<SqlValue>> = (1..=5)
            .map(|i| vec![SqlValue::Integer(i), format!("item-{}", i).into()])
            .collect();

        let results = executor
            .execute_many("INSERT INTO items (id, name) VALUES (?, ?)", &params)
            .await
            .unwrap();
        assert_eq!(results.len(), 5);

        let count = executor
            .execute("SELECT COUNT(*) AS n FROM items", &[])
            .await
            .unwrap();
        assert_eq!(count.rows[0]["n"].as_integer(), Some(5));
    }

    #[tokio::test]
    async fn test_transaction_commit_and_rollback() {
        let executor = executor().await;

        // Committed block is visible
        executor
            .transaction(|tx: &mut TransactionScope| {
                async move {
                    tx.execute(
                        "INSERT INTO items (id, name) VALUES (?, ?)",
                        &[1i64.into(), "kept".into()],
                    )
                    .await?;
                    Ok(())
                }
                .boxed()
            })
            .await
            .unwrap();

        // Failing block leaves no trace
        let err = executor
            .transaction(|tx: &mut TransactionScope| {
                async move {
                    tx.execute(
                        "INSERT INTO items (id, name) VALUES (?, ?)",
                        &[2i64.into(), "discarded".into()],
                    )
                    .await?;
                    Err::<(), _>(DatabaseError::QueryExecution("forced failure".into()))
                }
                .boxed()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::QueryExecution(_)));

        let rows = executor.execute("SELECT * FROM items", &[]).await.unwrap();
        assert_eq!(rows.row_count, 1);
        assert_eq!(rows.rows[0]["name"].as_text(), Some("kept"));
        assert_eq!(executor.stats().rollbacks, 1);
    }

    #[tokio::test]
    async fn test_savepoint_nesting() {
        let executor = executor().await;

        executor
            .transaction(|tx: &mut TransactionScope| {
                async move {
                    tx.execute(
                        "INSERT INTO items (id, name) VALUES (?, ?)",
                        &[1i64.into(), "outer".into()],
                    )
                    .await?;

                    // Inner scope fails and rolls back to its savepoint
                    let inner = tx
                        .nested(|tx: &mut TransactionScope| {
                            async move {
                                tx.execute(
                                    "INSERT INTO items (id, name) VALUES (?, ?)",
                                    &[2i64.into(), "inner".into()],
                                )
                                .await?;
                                Err::<(), _>(DatabaseError::QueryExecution("inner fails".into()))
                            }
                            .boxed()
                        })
                        .await;
                    assert!(inner.is_err());
                    Ok(())
                }
                .boxed()
            })
            .await
            .unwrap();

        let rows = executor.execute("SELECT * FROM items", &[]).await.unwrap();
        assert_eq!(rows.row_count, 1);
        assert_eq!(rows.rows[0]["name"].as_text(), Some("outer"));
    }

    #[tokio::test]
    async fn test_constraint_violation_classified() {
        let executor = executor().await;
        executor
            .execute(
                "INSERT INTO items (id, name) VALUES (?, ?)",
                &[1i64.into(), "unique".into()],
            )
            .await
            .unwrap();

        let err = executor
            .execute(
                "INSERT INTO items (id, name) VALUES (?, ?)",
                &[2i64.into(), "unique".into()],
            )
            .await
            .unwrap_err();

        match err {
            DatabaseError::Constraint { constraint, .. } => {
                assert!(constraint.contains("items.name"));
            }
            other => panic!("expected constraint error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_prepared_statements() {
        let executor = executor().await;
        let handle = executor.prepared("INSERT INTO items (id, name) VALUES (?, ?)");

        for i in 1..=3i64 {
            executor
                .execute_prepared(&handle, &[i.into(), format!("p{}", i).into()])
                .await
                .unwrap();
        }

        let count = executor
            .execute("SELECT COUNT(*) AS n FROM items", &[])
            .await
            .unwrap();
        assert_eq!(count.rows[0]["n"].as_integer(), Some(3));
    }

    #[tokio::test]
    async fn test_slow_query_recorded() {
        let config = DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            min_connections: 1,
            max_connections: 1,
            enable_wal: false,
            slow_query_threshold: Duration::from_millis(0),
            ..Default::default()
        };
        let pool = ConnectionPool::new(config.clone()).await.unwrap();
        let executor = QueryExecutor::new(pool, &config);

        executor.execute("SELECT 1", &[]).await.unwrap();
        assert!(executor.stats().slow_queries >= 1);
        assert!(!executor.slow_queries().is_empty());
    }
}
