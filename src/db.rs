//! SQLite connection management for one knowledge base.
//!
//! Every knowledge base owns a `meta.sqlite` file, opened with:
//!
//! - **WAL** journal; search and stats read while an import writes.
//! - `synchronous = NORMAL`.
//! - `foreign_keys = ON`; deleting a document cascades to its chunks, its
//!   note, and (through triggers) its full-text entries.
//! - a busy timeout, so a write waits out another connection's batch commit.

use anyhow::{Context, Result};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Connections per knowledge-base pool. All writes are short transactions
/// issued by one task at a time; extra connections serve concurrent reads.
const MAX_CONNECTIONS: u32 = 4;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Open (creating if missing) the metadata database at `db_path`.
pub async fn connect(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open metadata database {}", db_path.display()))?;

    Ok(pool)
}
