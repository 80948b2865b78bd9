//! # Schema Migrations
//!
//! Embedded, ordered migrations applied inside a transaction at startup.
//! The `schema_version` table holds the single current version row.

use crate::database::executor::{QueryExecutor, SqlValue, TransactionScope};
use crate::database::{DatabaseError, Result};
use futures::FutureExt;

/// One schema migration
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    /// Monotonic version
    pub version: u32,

    /// Human-readable name
    pub name: &'static str,

    /// Statements to apply
    pub statements: &'static [&'static str],
}

/// All migrations, oldest first
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "core tables",
        statements: &[
            "CREATE TABLE IF NOT EXISTS vocabulary (
                position INTEGER PRIMARY KEY,
                term TEXT NOT NULL,
                type TEXT NOT NULL DEFAULT 'unknown',
                created_at TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS stage_output (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                position INTEGER NOT NULL,
                stage INTEGER NOT NULL,
                raw TEXT NOT NULL,
                parsed_json TEXT,
                tokens INTEGER NOT NULL DEFAULT 0,
                duration_ms INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS flashcards (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                position INTEGER NOT NULL,
                term_number INTEGER NOT NULL,
                tab TEXT NOT NULL,
                front TEXT NOT NULL,
                back TEXT NOT NULL,
                tags TEXT NOT NULL DEFAULT '',
                honorific TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL
            )",
        ],
    },
    Migration {
        version: 2,
        name: "analytics tables",
        statements: &[
            "CREATE TABLE IF NOT EXISTS cache_metadata (
                key TEXT PRIMARY KEY,
                tier TEXT NOT NULL,
                tags TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                expires_at TEXT,
                hit_count INTEGER NOT NULL DEFAULT 0,
                size_bytes INTEGER NOT NULL DEFAULT 0,
                hot INTEGER NOT NULL DEFAULT 0
            )",
            "CREATE TABLE IF NOT EXISTS api_usage (
                request_id TEXT PRIMARY KEY,
                stage INTEGER NOT NULL,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                cost REAL NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS error_records (
                id TEXT PRIMARY KEY,
                fingerprint TEXT NOT NULL,
                category TEXT NOT NULL,
                severity TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                context_json TEXT NOT NULL DEFAULT '{}'
            )",
            "CREATE INDEX IF NOT EXISTS idx_error_records_fingerprint
                ON error_records (fingerprint)",
            "CREATE INDEX IF NOT EXISTS idx_api_usage_created_at
                ON api_usage (created_at)",
        ],
    },
    Migration {
        version: 3,
        name: "rate limiter audit",
        statements: &[
            "CREATE TABLE IF NOT EXISTS rate_limiter_audit (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                snapshot_at TEXT NOT NULL,
                shards INTEGER NOT NULL,
                allowed INTEGER NOT NULL,
                refused INTEGER NOT NULL,
                pending_reservations INTEGER NOT NULL,
                imbalance_ratio REAL NOT NULL
            )",
        ],
    },
];

/// Applies pending migrations
pub struct MigrationRunner;

impl MigrationRunner {
    /// Current schema version, zero before any migration
    pub async fn current_version(executor: &QueryExecutor) -> Result<u32> {
        executor
            .execute(
                "CREATE TABLE IF NOT EXISTS schema_version (
                    key TEXT PRIMARY KEY,
                    value INTEGER NOT NULL
                )",
                &[],
            )
            .await?;

        let result = executor
            .execute(
                "SELECT value FROM schema_version WHERE key = ?",
                &["schema_version".into()],
            )
            .await?;

        Ok(result
            .rows
            .first()
            .and_then(|row| row.get("value"))
            .and_then(SqlValue::as_integer)
            .unwrap_or(0) as u32)
    }

    /// Apply every migration past the current version, each in its own
    /// transaction
    pub async fn run(executor: &QueryExecutor) -> Result<u32> {
        let mut version = Self::current_version(executor).await?;

        for migration in MIGRATIONS {
            if migration.version <= version {
                continue;
            }
            log::info!(
                "applying migration {} ({})",
                migration.version,
                migration.name
            );

            executor
                .transaction(|tx: &mut TransactionScope| {
                    async move {
                        for statement in migration.statements {
                            tx.execute(statement, &[]).await?;
                        }
                        tx.execute(
                            "INSERT INTO schema_version (key, value) VALUES ('schema_version', ?)
                             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                            &[SqlValue::Integer(migration.version as i64)],
                        )
                        .await?;
                        Ok(())
                    }
                    .boxed()
                })
                .await
                .map_err(|e| {
                    DatabaseError::Migration(format!(
                        "migration {} failed: {}",
                        migration.version, e
                    ))
                })?;

            version = migration.version;
        }

        Ok(version)
    }
}
