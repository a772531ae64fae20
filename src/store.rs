//! Metadata Store: one SQLite database per knowledge base.
//!
//! [`MetaStore::open`] connects, migrates, and runs the recovery pass before
//! returning, so every handle in circulation points at a current schema with
//! no stale `processing` rows.
//!
//! Every mutating sequence is one short transaction. The streaming importer
//! never holds a transaction across file I/O: it commits the document row,
//! then commits chunks in small batches, then commits the final hash. Search
//! and stats read on other pool connections and only ever wait for one of
//! those small commits.

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::{debug, warn};
use uuid::Uuid;

use knowledge_engine_core::chunk::{chunk_text, TextChunk};
use knowledge_engine_core::models::{
    Chunk, Document, DocumentKind, Job, JobItem, JobItemStatus, JobStatus, JobType, KbStats,
    SearchHit, Timestamp,
};
use knowledge_engine_core::paths::KbPaths;

use crate::db;
use crate::migrate::{self, RecoveryReport, MIGRATIONS};

/// `kb.listJobs` returns at most this many jobs, newest first.
pub const LIST_JOBS_LIMIT: i64 = 200;

pub const DEFAULT_SEARCH_LIMIT: u32 = 20;
pub const MAX_SEARCH_LIMIT: u32 = 100;

pub(crate) fn now_ms() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Fields of a file document known before its bytes are read.
#[derive(Debug, Clone)]
pub struct NewFileDocument {
    pub id: String,
    pub title: String,
    pub source_path: String,
    pub blob_relative_path: String,
    pub mime_type: Option<String>,
}

/// Handle to one knowledge base's metadata database. Cheap to clone.
#[derive(Debug, Clone)]
pub struct MetaStore {
    pool: SqlitePool,
    paths: KbPaths,
}

impl MetaStore {
    /// Create directories, open the database, migrate, and recover.
    pub async fn open(paths: KbPaths) -> Result<(Self, RecoveryReport)> {
        paths
            .create_dirs()
            .with_context(|| format!("Failed to create {}", paths.root.display()))?;
        let pool = db::connect(&paths.meta_db).await?;
        migrate::run_migrations(&pool, MIGRATIONS).await?;
        let report = migrate::recover(&pool).await?;

        for relative in &report.orphaned_blobs {
            let blob = paths.blob_path(relative);
            if let Err(e) = tokio::fs::remove_file(&blob).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %blob.display(), error = %e, "failed to remove orphaned blob");
                }
            }
        }

        Ok((Self { pool, paths }, report))
    }

    pub fn paths(&self) -> &KbPaths {
        &self.paths
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ─── Documents ──────────────────────────────────────────────────

    /// Insert a file document with no hash yet (import in progress).
    pub async fn insert_file_document(&self, doc: &NewFileDocument) -> Result<()> {
        let now = now_ms();
        sqlx::query(
            r#"
            INSERT INTO documents (id, kind, title, source_path, blob_relative_path, mime_type,
                                   size_bytes, sha256, created_at, updated_at)
            VALUES (?, 'file', ?, ?, ?, ?, 0, NULL, ?, ?)
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.title)
        .bind(&doc.source_path)
        .bind(&doc.blob_relative_path)
        .bind(&doc.mime_type)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Append a batch of chunks in one transaction.
    pub async fn insert_chunks(&self, document_id: &str, chunks: &[TextChunk]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        insert_chunk_rows(&mut tx, document_id, chunks, now_ms()).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Record the content hash and size, marking the import complete.
    pub async fn finalize_document(&self, id: &str, sha256: &str, size_bytes: i64) -> Result<()> {
        sqlx::query("UPDATE documents SET sha256 = ?, size_bytes = ?, updated_at = ? WHERE id = ?")
            .bind(sha256)
            .bind(size_bytes)
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete a document; chunks, note, and index entries cascade.
    pub async fn delete_document(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete unfinished file documents imported from `source_path`,
    /// returning their blob paths for the caller to remove.
    pub async fn discard_unfinished(&self, source_path: &str) -> Result<Vec<String>> {
        let mut tx = self.pool.begin().await?;
        let blobs: Vec<Option<String>> = sqlx::query_scalar(
            "SELECT blob_relative_path FROM documents WHERE kind = 'file' AND sha256 IS NULL AND source_path = ?",
        )
        .bind(source_path)
        .fetch_all(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM documents WHERE kind = 'file' AND sha256 IS NULL AND source_path = ?")
            .bind(source_path)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(blobs.into_iter().flatten().collect())
    }

    pub async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(document_from_row).transpose()
    }

    pub async fn list_documents(&self) -> Result<Vec<Document>> {
        let rows = sqlx::query("SELECT * FROM documents ORDER BY created_at ASC, rowid ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(document_from_row).collect()
    }

    /// Chunks of a document in `chunk_index` order.
    pub async fn list_chunks(&self, document_id: &str) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(
            "SELECT id, document_id, chunk_index, content, created_at FROM chunks WHERE document_id = ? ORDER BY chunk_index ASC",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| Chunk {
                id: row.get("id"),
                document_id: row.get("document_id"),
                chunk_index: row.get("chunk_index"),
                content: row.get("content"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    /// Create a note document, its note body, and its chunks atomically.
    pub async fn create_note(&self, title: &str, content: &str) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = now_ms();
        let chunks = chunk_text(content);

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO documents (id, kind, title, source_path, blob_relative_path, mime_type,
                                   size_bytes, sha256, created_at, updated_at)
            VALUES (?, 'note', ?, NULL, NULL, 'text/markdown', ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(title)
        .bind(content.len() as i64)
        .bind(sha256_hex(content.as_bytes()))
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO notes (document_id, content) VALUES (?, ?)")
            .bind(&id)
            .bind(content)
            .execute(&mut *tx)
            .await?;

        insert_chunk_rows(&mut tx, &id, &chunks, now).await?;
        tx.commit().await?;

        debug!(kb_id = %self.paths.kb_id, document_id = %id, chunks = chunks.len(), "created note");
        Ok(id)
    }

    pub async fn get_note_content(&self, document_id: &str) -> Result<Option<String>> {
        Ok(
            sqlx::query_scalar("SELECT content FROM notes WHERE document_id = ?")
                .bind(document_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    // ─── Jobs ───────────────────────────────────────────────────────

    /// Insert a pending import job and one pending item per file.
    ///
    /// Fails (and inserts nothing) if `files` repeats a path.
    pub async fn create_import_job(&self, payload: &Value, files: &[String]) -> Result<Job> {
        let id = Uuid::new_v4().to_string();
        let now = now_ms();

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO jobs (id, type, status, payload_json, progress_current, progress_total,
                              created_at, updated_at)
            VALUES (?, ?, 'pending', ?, 0, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(JobType::ImportFiles.as_str())
        .bind(serde_json::to_string(payload)?)
        .bind(files.len() as i64)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        for path in files {
            sqlx::query(
                r#"
                INSERT INTO job_items (id, job_id, kind, source_path, status, created_at, updated_at)
                VALUES (?, ?, 'file', ?, 'pending', ?, ?)
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&id)
            .bind(path)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to queue {}", path))?;
        }
        tx.commit().await?;

        self.get_job(&id)
            .await?
            .ok_or_else(|| anyhow!("job {} vanished after insert", id))
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    /// Most recent jobs first.
    pub async fn list_jobs(&self, limit: i64) -> Result<Vec<Job>> {
        let rows = sqlx::query("SELECT * FROM jobs ORDER BY created_at DESC, rowid DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    /// Items of a job in creation order.
    pub async fn list_job_items(&self, job_id: &str) -> Result<Vec<JobItem>> {
        let rows = sqlx::query(
            "SELECT * FROM job_items WHERE job_id = ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_item_from_row).collect()
    }

    pub async fn job_status(&self, id: &str) -> Result<Option<JobStatus>> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match status {
            Some(s) => Ok(Some(s.parse::<JobStatus>()?)),
            None => Ok(None),
        }
    }

    /// `pending` → `processing`. Returns whether the row changed.
    pub async fn mark_job_processing(&self, id: &str) -> Result<bool> {
        let now = now_ms();
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'processing', started_at = COALESCE(started_at, ?), updated_at = ?, heartbeat_at = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Oldest pending item of a job.
    pub async fn next_pending_item(&self, job_id: &str) -> Result<Option<JobItem>> {
        let row = sqlx::query(
            "SELECT * FROM job_items WHERE job_id = ? AND status = 'pending' ORDER BY created_at ASC, rowid ASC LIMIT 1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_item_from_row).transpose()
    }

    pub async fn mark_item_processing(&self, item_id: &str) -> Result<()> {
        let now = now_ms();
        sqlx::query(
            "UPDATE job_items SET status = 'processing', started_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(now)
        .bind(now)
        .bind(item_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record an item's terminal outcome.
    pub async fn finish_item(
        &self,
        item_id: &str,
        status: JobItemStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        debug_assert!(status.is_terminal());
        let now = now_ms();
        sqlx::query(
            "UPDATE job_items SET status = ?, error_message = ?, finished_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(error_message)
        .bind(now)
        .bind(now)
        .bind(item_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Set `progress_current` to the number of terminal items, never lowering it.
    ///
    /// Canceled or finished jobs keep their progress frozen.
    pub async fn refresh_progress(&self, job_id: &str) -> Result<()> {
        let now = now_ms();
        sqlx::query(
            r#"
            UPDATE jobs
            SET progress_current = MAX(progress_current, (
                    SELECT COUNT(*) FROM job_items
                    WHERE job_id = jobs.id AND status IN ('done', 'failed', 'skipped')
                )),
                heartbeat_at = ?,
                updated_at = ?
            WHERE id = ? AND status IN ('pending', 'processing', 'paused')
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// `pending | processing` → `done`.
    pub async fn complete_job(&self, id: &str) -> Result<bool> {
        let now = now_ms();
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'done',
                progress_current = (
                    SELECT COUNT(*) FROM job_items
                    WHERE job_id = jobs.id AND status IN ('done', 'failed', 'skipped')
                ),
                finished_at = ?, updated_at = ?
            WHERE id = ? AND status IN ('pending', 'processing')
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// `pending | processing` → `failed`.
    pub async fn fail_job(&self, id: &str, message: &str) -> Result<bool> {
        let now = now_ms();
        let result = sqlx::query(
            r#"
            UPDATE jobs SET status = 'failed', error_message = ?, finished_at = ?, updated_at = ?
            WHERE id = ? AND status IN ('pending', 'processing')
            "#,
        )
        .bind(message)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// `pending | processing` → `paused`; anything else is left alone.
    pub async fn pause_job(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'paused', updated_at = ? WHERE id = ? AND status IN ('pending', 'processing')",
        )
        .bind(now_ms())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// `paused | pending` → `pending`. Returns whether the job is now pending.
    pub async fn resume_job(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'pending', updated_at = ? WHERE id = ? AND status IN ('paused', 'pending')",
        )
        .bind(now_ms())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Mark a non-terminal job `canceled` and its unfinished items `skipped`.
    ///
    /// A job already `done`, `failed`, or `canceled` is untouched.
    pub async fn cancel_job(&self, id: &str) -> Result<bool> {
        let now = now_ms();
        let mut tx = self.pool.begin().await?;

        let changed = sqlx::query(
            r#"
            UPDATE jobs SET status = 'canceled', finished_at = ?, updated_at = ?
            WHERE id = ? AND status IN ('pending', 'processing', 'paused')
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        if changed {
            sqlx::query(
                r#"
                UPDATE job_items SET status = 'skipped', finished_at = ?, updated_at = ?
                WHERE job_id = ? AND status IN ('pending', 'processing')
                "#,
            )
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(changed)
    }

    /// Oldest `pending` job, if any.
    pub async fn next_pending_job(&self) -> Result<Option<String>> {
        Ok(sqlx::query_scalar(
            "SELECT id FROM jobs WHERE status = 'pending' ORDER BY created_at ASC, rowid ASC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn count_jobs_with_status(&self, status: JobStatus) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?)
    }

    // ─── Search & stats ─────────────────────────────────────────────

    /// Full-text search over finished documents.
    ///
    /// Returns nothing, without querying, when `query` has no searchable
    /// terms.
    pub async fn search(&self, query: &str, limit: u32) -> Result<Vec<SearchHit>> {
        let Some(match_expr) = fts_query(query) else {
            return Ok(Vec::new());
        };
        let limit = limit.clamp(1, MAX_SEARCH_LIMIT);

        let rows = sqlx::query(
            r#"
            SELECT c.id AS chunk_id,
                   c.document_id AS document_id,
                   d.title AS title,
                   d.kind AS kind,
                   snippet(chunks_fts, 0, '[', ']', '…', 16) AS snippet,
                   bm25(chunks_fts) AS rank
            FROM chunks_fts
            JOIN chunks c ON c.id = chunks_fts.rowid
            JOIN documents d ON d.id = c.document_id
            WHERE chunks_fts MATCH ?
              AND (d.kind = 'note' OR d.sha256 IS NOT NULL)
            ORDER BY rank ASC, c.id ASC
            LIMIT ?
            "#,
        )
        .bind(&match_expr)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("Search failed for query '{}'", query))?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in &rows {
            let kind: String = row.get("kind");
            let rank: f64 = row.get("rank");
            hits.push(SearchHit {
                chunk_id: row.get("chunk_id"),
                document_id: row.get("document_id"),
                document_title: row.get("title"),
                document_kind: kind.parse()?,
                snippet: row.get("snippet"),
                score: -rank,
            });
        }
        Ok(hits)
    }

    pub async fn stats(&self) -> Result<KbStats> {
        let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?;
        let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        let jobs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
            .fetch_one(&self.pool)
            .await?;
        Ok(KbStats {
            documents,
            chunks,
            jobs,
        })
    }
}

async fn insert_chunk_rows(
    conn: &mut SqliteConnection,
    document_id: &str,
    chunks: &[TextChunk],
    now: Timestamp,
) -> Result<()> {
    for chunk in chunks {
        sqlx::query(
            "INSERT INTO chunks (document_id, chunk_index, content, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(document_id)
        .bind(chunk.index)
        .bind(&chunk.content)
        .bind(now)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Turn free text into an FTS5 expression: each whitespace-separated term
/// is stripped of FTS syntax characters and quoted, and terms are AND-ed.
/// Terms without any letter or digit are dropped.
pub fn fts_query(input: &str) -> Option<String> {
    let terms: Vec<String> = input
        .split_whitespace()
        .map(|t| t.chars().filter(|c| !is_fts_syntax(*c)).collect::<String>())
        .filter(|t| t.chars().any(char::is_alphanumeric))
        .map(|t| format!("\"{}\"", t))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}

fn is_fts_syntax(c: char) -> bool {
    matches!(c, '"' | '*' | '(' | ')' | ':' | '^' | '{' | '}' | '+' | '-' | '[' | ']')
}

fn document_from_row(row: &SqliteRow) -> Result<Document> {
    let kind: String = row.get("kind");
    Ok(Document {
        id: row.get("id"),
        kind: kind.parse::<DocumentKind>()?,
        title: row.get("title"),
        source_path: row.get("source_path"),
        blob_relative_path: row.get("blob_relative_path"),
        mime_type: row.get("mime_type"),
        size_bytes: row.get("size_bytes"),
        sha256: row.get("sha256"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn job_from_row(row: &SqliteRow) -> Result<Job> {
    let job_type: String = row.get("type");
    let status: String = row.get("status");
    let payload: String = row.get("payload_json");
    Ok(Job {
        id: row.get("id"),
        job_type: job_type.parse()?,
        status: status.parse()?,
        payload: serde_json::from_str(&payload).context("Corrupt job payload")?,
        progress_current: row.get("progress_current"),
        progress_total: row.get("progress_total"),
        error_message: row.get("error_message"),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        updated_at: row.get("updated_at"),
        heartbeat_at: row.get("heartbeat_at"),
    })
}

fn job_item_from_row(row: &SqliteRow) -> Result<JobItem> {
    let kind: String = row.get("kind");
    let status: String = row.get("status");
    Ok(JobItem {
        id: row.get("id"),
        job_id: row.get("job_id"),
        kind: kind.parse()?,
        source_path: row.get("source_path"),
        status: status.parse()?,
        error_message: row.get("error_message"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn open(tmp: &TempDir) -> MetaStore {
        let paths = KbPaths::resolve(tmp.path(), "kb1").unwrap();
        MetaStore::open(paths).await.unwrap().0
    }

    #[test]
    fn fts_query_quotes_terms() {
        assert_eq!(fts_query("hello world").as_deref(), Some("\"hello\" \"world\""));
        assert_eq!(fts_query("say \"hi\" col:x").as_deref(), Some("\"say\" \"hi\" \"colx\""));
        assert_eq!(fts_query("   "), None);
        assert_eq!(fts_query("- * ()"), None);
    }

    #[tokio::test]
    async fn note_is_searchable() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp).await;
        let id = store.create_note("T", "hello world").await.unwrap();

        let hits = store.search("hello", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document_id, id);
        assert_eq!(hits[0].document_title, "T");
        assert_eq!(hits[0].document_kind, DocumentKind::Note);
        assert!(hits[0].snippet.contains("[hello]"));

        assert_eq!(store.get_note_content(&id).await.unwrap().as_deref(), Some("hello world"));
    }

    #[tokio::test]
    async fn unfinished_file_documents_are_not_searchable() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp).await;
        store
            .insert_file_document(&NewFileDocument {
                id: "d1".into(),
                title: "a.txt".into(),
                source_path: "/tmp/a.txt".into(),
                blob_relative_path: "blobs/d1.txt".into(),
                mime_type: Some("text/plain".into()),
            })
            .await
            .unwrap();
        store
            .insert_chunks(
                "d1",
                &[TextChunk {
                    index: 0,
                    content: "zebra stripes".into(),
                }],
            )
            .await
            .unwrap();
        assert!(store.search("zebra", 10).await.unwrap().is_empty());

        store.finalize_document("d1", "abc", 13).await.unwrap();
        assert_eq!(store.search("zebra", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_source_path_rejects_whole_job() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp).await;
        let files = vec!["/tmp/a.txt".to_string(), "/tmp/a.txt".to_string()];
        assert!(store.create_import_job(&json!({}), &files).await.is_err());
        assert_eq!(store.stats().await.unwrap().jobs, 0);
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_spares_finished_jobs() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp).await;
        let files = vec!["/a".to_string(), "/b".to_string()];
        let job = store.create_import_job(&json!({}), &files).await.unwrap();

        assert!(store.cancel_job(&job.id).await.unwrap());
        let after_first = store.get_job(&job.id).await.unwrap().unwrap();
        assert!(!store.cancel_job(&job.id).await.unwrap());
        let after_second = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(after_first, after_second);
        assert!(store
            .list_job_items(&job.id)
            .await
            .unwrap()
            .iter()
            .all(|i| i.status == JobItemStatus::Skipped));

        let done = store.create_import_job(&json!({}), &["/c".to_string()]).await.unwrap();
        assert!(store.mark_job_processing(&done.id).await.unwrap());
        let item = store.next_pending_item(&done.id).await.unwrap().unwrap();
        store.mark_item_processing(&item.id).await.unwrap();
        store.finish_item(&item.id, JobItemStatus::Done, None).await.unwrap();
        assert!(store.complete_job(&done.id).await.unwrap());
        let finished = store.get_job(&done.id).await.unwrap().unwrap();

        assert!(!store.cancel_job(&done.id).await.unwrap());
        assert_eq!(store.get_job(&done.id).await.unwrap().unwrap(), finished);
        assert_eq!(finished.progress_current, finished.progress_total);
    }

    #[tokio::test]
    async fn pause_only_applies_to_active_jobs() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp).await;
        let job = store.create_import_job(&json!({}), &["/a".to_string()]).await.unwrap();
        assert!(store.pause_job(&job.id).await.unwrap());
        assert!(!store.pause_job(&job.id).await.unwrap());
        assert!(store.resume_job(&job.id).await.unwrap());
        assert_eq!(store.job_status(&job.id).await.unwrap(), Some(JobStatus::Pending));
        store.cancel_job(&job.id).await.unwrap();
        assert!(!store.resume_job(&job.id).await.unwrap());
    }

    #[tokio::test]
    async fn progress_never_decreases() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp).await;
        let files: Vec<String> = (0..3).map(|i| format!("/f{}", i)).collect();
        let job = store.create_import_job(&json!({}), &files).await.unwrap();
        store.mark_job_processing(&job.id).await.unwrap();

        let mut last = 0;
        while let Some(item) = store.next_pending_item(&job.id).await.unwrap() {
            store.mark_item_processing(&item.id).await.unwrap();
            store.finish_item(&item.id, JobItemStatus::Failed, Some("nope")).await.unwrap();
            store.refresh_progress(&job.id).await.unwrap();
            let current = store.get_job(&job.id).await.unwrap().unwrap().progress_current;
            assert!(current >= last);
            last = current;
        }
        assert_eq!(last, 3);
    }
}
