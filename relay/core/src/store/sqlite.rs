//! SQLite store
//!
//! Persists turns and sources with `sqlx`. Source idempotency is enforced by a
//! `UNIQUE(thread_id, url)` constraint, so concurrent writers racing on the
//! same citation still end up with one row.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::Row;
use uuid::Uuid;

use super::{NewSource, NewTurn, Role, SourceRecord, StoreError, Turn, TurnId, TurnStore};

/// [`TurnStore`] backed by a SQLite database
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and run migrations
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created, the database
    /// cannot be opened, or migrations fail.
    pub async fn connect(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Unavailable(format!("{}: {e}", parent.display())))?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        tracing::info!(path = %path.display(), "SQLite store ready");
        Ok(store)
    }

    /// Open a private in-memory database
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrations fail.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // One connection that never expires: each connection has its own memory database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS turns (
                id TEXT PRIMARY KEY,
                thread_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                metadata_json TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_turns_thread ON turns(thread_id, created_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sources (
                id TEXT PRIMARY KEY,
                thread_id TEXT NOT NULL,
                url TEXT NOT NULL,
                title TEXT,
                snippet TEXT,
                content TEXT,
                published_at TEXT,
                accessed_at TEXT NOT NULL,
                UNIQUE(thread_id, url)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    // Fixed precision keeps lexical order equal to time order
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp {value:?}: {e}")))
}

fn parse_uuid(value: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(value).map_err(|e| StoreError::Corrupt(format!("id {value:?}: {e}")))
}

fn turn_from_row(row: &SqliteRow) -> Result<Turn, StoreError> {
    let role: String = row.try_get("role")?;
    let metadata: Option<String> = row.try_get("metadata_json")?;
    let metadata = metadata
        .map(|json| serde_json::from_str(&json))
        .transpose()
        .map_err(|e| StoreError::Corrupt(format!("metadata: {e}")))?;

    Ok(Turn {
        id: TurnId(parse_uuid(&row.try_get::<String, _>("id")?)?),
        thread_id: row.try_get("thread_id")?,
        user_id: row.try_get("user_id")?,
        role: Role::parse(&role).ok_or_else(|| StoreError::Corrupt(format!("role {role:?}")))?,
        content: row.try_get("content")?,
        metadata,
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
    })
}

fn source_from_row(row: &SqliteRow) -> Result<SourceRecord, StoreError> {
    Ok(SourceRecord {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        thread_id: row.try_get("thread_id")?,
        url: row.try_get("url")?,
        title: row.try_get("title")?,
        snippet: row.try_get("snippet")?,
        content: row.try_get("content")?,
        published_at: row.try_get("published_at")?,
        accessed_at: parse_timestamp(&row.try_get::<String, _>("accessed_at")?)?,
    })
}

#[async_trait]
impl TurnStore for SqliteStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn create_turn(&self, turn: NewTurn) -> Result<Turn, StoreError> {
        let record = Turn {
            id: TurnId::new(),
            thread_id: turn.thread_id,
            user_id: turn.user_id,
            role: turn.role,
            content: turn.content,
            metadata: turn.metadata,
            created_at: Utc::now(),
        };
        let metadata_json = record
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Corrupt(format!("metadata: {e}")))?;

        sqlx::query(
            "INSERT INTO turns (id, thread_id, user_id, role, content, metadata_json, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id.to_string())
        .bind(&record.thread_id)
        .bind(&record.user_id)
        .bind(record.role.as_str())
        .bind(&record.content)
        .bind(metadata_json)
        .bind(timestamp(record.created_at))
        .execute(&self.pool)
        .await?;

        Ok(record)
    }

    async fn create_source_if_absent(&self, source: NewSource) -> Result<SourceRecord, StoreError> {
        sqlx::query(
            "INSERT INTO sources (id, thread_id, url, title, snippet, content, published_at, accessed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(thread_id, url) DO NOTHING",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&source.thread_id)
        .bind(&source.url)
        .bind(&source.title)
        .bind(&source.snippet)
        .bind(&source.content)
        .bind(&source.published_at)
        .bind(timestamp(Utc::now()))
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT * FROM sources WHERE thread_id = ? AND url = ?")
            .bind(&source.thread_id)
            .bind(&source.url)
            .fetch_one(&self.pool)
            .await?;
        source_from_row(&row)
    }

    async fn turns_for_thread(
        &self,
        thread_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Turn>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM turns WHERE thread_id = ?
             ORDER BY created_at ASC, rowid ASC LIMIT ? OFFSET ?",
        )
        .bind(thread_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(i64::try_from(offset).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(turn_from_row).collect()
    }

    async fn sources_for_thread(&self, thread_id: &str) -> Result<Vec<SourceRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM sources WHERE thread_id = ? ORDER BY accessed_at DESC, rowid DESC",
        )
        .bind(thread_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(source_from_row).collect()
    }

    async fn count_turns(&self, thread_id: &str) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM turns WHERE thread_id = ?")
            .bind(thread_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}
