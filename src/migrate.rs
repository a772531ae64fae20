//! Versioned schema migrations and the crash-recovery pass.
//!
//! `schema_migrations` records every applied version. On open, each
//! migration with a version above the recorded maximum runs in ascending
//! order inside its own transaction, and its row is written in that same
//! transaction, so a failure leaves the database at the previous version.
//! A failed migration aborts the open; there is no partial-schema fallback.
//!
//! Right after migrating, [`recover`] resets state left behind by a
//! process that died mid-job.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::error::KbError;

pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub statements: &'static [&'static str],
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        statements: &[
            r#"
            CREATE TABLE documents (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL CHECK (kind IN ('file', 'note')),
                title TEXT NOT NULL,
                source_path TEXT,
                blob_relative_path TEXT,
                mime_type TEXT,
                size_bytes INTEGER NOT NULL DEFAULT 0,
                sha256 TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE chunks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                document_id TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
                chunk_index INTEGER NOT NULL,
                content TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE (document_id, chunk_index)
            )
            "#,
            r#"
            CREATE TABLE notes (
                document_id TEXT PRIMARY KEY REFERENCES documents(id) ON DELETE CASCADE,
                content TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE jobs (
                id TEXT PRIMARY KEY,
                type TEXT NOT NULL,
                status TEXT NOT NULL
                    CHECK (status IN ('pending', 'processing', 'paused', 'done', 'failed', 'canceled')),
                payload_json TEXT NOT NULL,
                progress_current INTEGER NOT NULL DEFAULT 0,
                progress_total INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                created_at INTEGER NOT NULL,
                started_at INTEGER,
                finished_at INTEGER,
                updated_at INTEGER NOT NULL,
                heartbeat_at INTEGER
            )
            "#,
            r#"
            CREATE TABLE job_items (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                kind TEXT NOT NULL,
                source_path TEXT NOT NULL,
                status TEXT NOT NULL
                    CHECK (status IN ('pending', 'processing', 'done', 'failed', 'skipped')),
                error_message TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                started_at INTEGER,
                finished_at INTEGER,
                UNIQUE (job_id, source_path)
            )
            "#,
            "CREATE INDEX idx_chunks_document ON chunks(document_id, chunk_index)",
            "CREATE INDEX idx_jobs_status_created ON jobs(status, created_at)",
            "CREATE INDEX idx_job_items_job_status ON job_items(job_id, status, created_at)",
            "CREATE INDEX idx_documents_sha256 ON documents(sha256)",
        ],
    },
    Migration {
        version: 2,
        name: "chunks_fts",
        statements: &[
            r#"
            CREATE VIRTUAL TABLE chunks_fts USING fts5(
                content,
                content = 'chunks',
                content_rowid = 'id',
                tokenize = 'unicode61 remove_diacritics 2'
            )
            "#,
            r#"
            CREATE TRIGGER chunks_fts_insert AFTER INSERT ON chunks BEGIN
                INSERT INTO chunks_fts(rowid, content) VALUES (new.id, new.content);
            END
            "#,
            r#"
            CREATE TRIGGER chunks_fts_delete AFTER DELETE ON chunks BEGIN
                INSERT INTO chunks_fts(chunks_fts, rowid, content) VALUES ('delete', old.id, old.content);
            END
            "#,
            r#"
            CREATE TRIGGER chunks_fts_update AFTER UPDATE ON chunks BEGIN
                INSERT INTO chunks_fts(chunks_fts, rowid, content) VALUES ('delete', old.id, old.content);
                INSERT INTO chunks_fts(rowid, content) VALUES (new.id, new.content);
            END
            "#,
            "INSERT INTO chunks_fts(chunks_fts) VALUES ('rebuild')",
        ],
    },
];

/// Apply every pending migration from `migrations`.
pub async fn run_migrations(pool: &SqlitePool, migrations: &[Migration]) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create schema_migrations")?;

    let current = current_version(pool).await?;

    let mut pending: Vec<&Migration> = migrations.iter().filter(|m| m.version > current).collect();
    pending.sort_by_key(|m| m.version);

    for migration in pending {
        apply(pool, migration).await.map_err(|e| KbError::Migration {
            version: migration.version,
            name: migration.name,
            message: format!("{:#}", e),
        })?;
        info!(version = migration.version, name = migration.name, "applied migration");
    }

    Ok(())
}

async fn apply(pool: &SqlitePool, migration: &Migration) -> Result<()> {
    let mut tx = pool.begin().await?;
    for statement in migration.statements {
        sqlx::query(statement).execute(&mut *tx).await?;
    }
    sqlx::query("INSERT INTO schema_migrations (version, name, applied_at) VALUES (?, ?, ?)")
        .bind(migration.version)
        .bind(migration.name)
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

pub async fn current_version(pool: &SqlitePool) -> Result<i64> {
    let version: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_migrations")
        .fetch_one(pool)
        .await?;
    Ok(version.unwrap_or(0))
}

/// What [`recover`] changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub jobs_paused: u64,
    pub items_reset: u64,
    /// Blob paths (relative to the knowledge-base root) of half-imported
    /// documents that were deleted. The caller removes the files.
    pub orphaned_blobs: Vec<String>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.jobs_paused == 0 && self.items_reset == 0 && self.orphaned_blobs.is_empty()
    }
}

/// Reset crash-interrupted state in one transaction.
///
/// - `processing` jobs become `paused` (never auto-resumed).
/// - `processing` items become `pending`.
/// - file documents without a `sha256` (an import that never finished) are
///   deleted along with their chunks.
///
/// Running it again immediately changes nothing.
pub async fn recover(pool: &SqlitePool) -> Result<RecoveryReport> {
    let now = chrono::Utc::now().timestamp_millis();
    let mut tx = pool.begin().await?;

    let jobs_paused = sqlx::query(
        "UPDATE jobs SET status = 'paused', updated_at = ? WHERE status = 'processing'",
    )
    .bind(now)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    let items_reset = sqlx::query(
        "UPDATE job_items SET status = 'pending', started_at = NULL, updated_at = ? WHERE status = 'processing'",
    )
    .bind(now)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    let orphaned_blobs: Vec<Option<String>> = sqlx::query_scalar(
        "SELECT blob_relative_path FROM documents WHERE kind = 'file' AND sha256 IS NULL",
    )
    .fetch_all(&mut *tx)
    .await?;

    sqlx::query("DELETE FROM documents WHERE kind = 'file' AND sha256 IS NULL")
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    let report = RecoveryReport {
        jobs_paused,
        items_reset,
        orphaned_blobs: orphaned_blobs.into_iter().flatten().collect(),
    };
    if !report.is_empty() {
        warn!(
            jobs_paused = report.jobs_paused,
            items_reset = report.items_reset,
            orphaned_documents = report.orphaned_blobs.len(),
            "recovered from unclean shutdown"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn pool(tmp: &TempDir) -> SqlitePool {
        crate::db::connect(&tmp.path().join("meta.sqlite")).await.unwrap()
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let tmp = TempDir::new().unwrap();
        let pool = pool(&tmp).await;
        run_migrations(&pool, MIGRATIONS).await.unwrap();
        run_migrations(&pool, MIGRATIONS).await.unwrap();
        assert_eq!(current_version(&pool).await.unwrap(), 2);

        let applied: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schema_migrations")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(applied, 2);
    }

    #[tokio::test]
    async fn failed_migration_is_fatal_and_not_recorded() {
        const BROKEN: &[Migration] = &[
            Migration {
                version: 1,
                name: "ok",
                statements: &["CREATE TABLE a (x INTEGER)"],
            },
            Migration {
                version: 2,
                name: "broken",
                statements: &["CREATE TABLE b (y INTEGER)", "THIS IS NOT SQL"],
            },
        ];
        let tmp = TempDir::new().unwrap();
        let pool = pool(&tmp).await;
        let err = run_migrations(&pool, BROKEN).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<KbError>(),
            Some(KbError::Migration { version: 2, .. })
        ));
        assert_eq!(current_version(&pool).await.unwrap(), 1);

        // The failed migration's own DDL rolled back with it.
        let b_exists: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'b'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(b_exists, 0);
    }

    #[tokio::test]
    async fn fts_triggers_track_chunk_changes() {
        let tmp = TempDir::new().unwrap();
        let pool = pool(&tmp).await;
        run_migrations(&pool, MIGRATIONS).await.unwrap();

        sqlx::query("INSERT INTO documents (id, kind, title, created_at, updated_at) VALUES ('d', 'note', 't', 0, 0)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO chunks (document_id, chunk_index, content, created_at) VALUES ('d', 0, 'Crème brûlée recipe', 0)")
            .execute(&pool)
            .await
            .unwrap();

        let hits: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks_fts WHERE chunks_fts MATCH 'creme'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(hits, 1, "diacritics should fold");

        sqlx::query("UPDATE chunks SET content = 'plain toast' WHERE document_id = 'd'")
            .execute(&pool)
            .await
            .unwrap();
        let hits: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks_fts WHERE chunks_fts MATCH 'creme'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(hits, 0);

        sqlx::query("DELETE FROM documents WHERE id = 'd'")
            .execute(&pool)
            .await
            .unwrap();
        let hits: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks_fts WHERE chunks_fts MATCH 'toast'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(hits, 0, "cascade delete should clear the index");
    }
}
