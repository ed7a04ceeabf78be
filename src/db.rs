//! SQLite state store: oauth credentials, sync state, Drive snapshots and
//! RAG index metadata.
//!
//! Schema is created idempotently at open. Sync state rows are
//! read-modify-written inside transactions so concurrent workers on different
//! data sources do not trample each other.

use crate::error::{DbError, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;

/// Shared handle over the relational state store.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

/// Notion incremental sync bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct NotionSyncState {
    pub data_source_id: i64,
    pub last_full_sync: Option<DateTime<Utc>>,
    pub since: Option<DateTime<Utc>>,
    pub next_cursor: Option<String>,
    pub rate_limited_until: Option<DateTime<Utc>>,
}

/// Drive incremental sync bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct DriveSyncState {
    pub data_source_id: i64,
    pub start_page_token: Option<String>,
    pub bootstrapped_at: Option<DateTime<Utc>>,
    pub last_synced: Option<DateTime<Utc>>,
}

/// Cached per-file metadata used for the re-index decision.
#[derive(Debug, Clone)]
pub struct DriveFileSnapshot {
    pub data_source_id: i64,
    pub file_id: String,
    pub name: String,
    pub mime_type: String,
    pub md5_checksum: Option<String>,
    pub version: Option<i64>,
    pub modified_time: Option<DateTime<Utc>>,
    pub web_view_link: Option<String>,
    pub last_synced: Option<DateTime<Utc>>,
}

/// Per-workspace retrieval index metadata.
#[derive(Debug, Clone)]
pub struct RagIndexMeta {
    pub workspace_id: i64,
    pub name: String,
    pub engine: String,
    pub storage_uri: String,
    pub dim: Option<i64>,
    pub status: String,
    pub object_count: i64,
    pub vector_count: i64,
    pub updated_at: Option<DateTime<Utc>>,
}

pub const DEFAULT_RAG_INDEX_NAME: &str = "default";

impl Database {
    /// Open (or create) the state database at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| DbError::Sqlx(sqlx::Error::Io(e)))?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(DbError::Sqlx)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(DbError::Sqlx)?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// In-memory database for tests.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(DbError::Sqlx)?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS oauth_credentials (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                provider TEXT NOT NULL,
                user_id INTEGER NOT NULL,
                data_source_id INTEGER NOT NULL,
                access_token TEXT NOT NULL,
                refresh_token TEXT,
                token_type TEXT NOT NULL DEFAULT 'bearer',
                expires_at TEXT,
                provider_payload TEXT NOT NULL DEFAULT '{}',
                updated_at TEXT NOT NULL,
                UNIQUE(provider, data_source_id, user_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(DbError::Sqlx)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS notion_sync_state (
                data_source_id INTEGER PRIMARY KEY,
                last_full_sync TEXT,
                since TEXT,
                next_cursor TEXT,
                rate_limited_until TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(DbError::Sqlx)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS gdrive_sync_state (
                data_source_id INTEGER PRIMARY KEY,
                start_page_token TEXT,
                bootstrapped_at TEXT,
                last_synced TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(DbError::Sqlx)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS gdrive_file_snapshots (
                data_source_id INTEGER NOT NULL,
                file_id TEXT NOT NULL,
                name TEXT NOT NULL DEFAULT '',
                mime_type TEXT NOT NULL DEFAULT '',
                md5_checksum TEXT,
                version INTEGER,
                modified_time TEXT,
                web_view_link TEXT,
                last_synced TEXT,
                PRIMARY KEY (data_source_id, file_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(DbError::Sqlx)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rag_indexes (
                workspace_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                engine TEXT NOT NULL,
                storage_uri TEXT NOT NULL,
                dim INTEGER,
                status TEXT NOT NULL DEFAULT 'ready',
                object_count INTEGER NOT NULL DEFAULT 0,
                vector_count INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT,
                PRIMARY KEY (workspace_id, name)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(DbError::Sqlx)?;

        Ok(())
    }

    // ---- notion sync state ----

    pub async fn notion_sync_state(&self, data_source_id: i64) -> Result<NotionSyncState> {
        let row = sqlx::query(
            "SELECT last_full_sync, since, next_cursor, rate_limited_until \
             FROM notion_sync_state WHERE data_source_id = ?",
        )
        .bind(data_source_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Sqlx)?;

        Ok(match row {
            Some(row) => NotionSyncState {
                data_source_id,
                last_full_sync: parse_ts(row.get("last_full_sync")),
                since: parse_ts(row.get("since")),
                next_cursor: row.get("next_cursor"),
                rate_limited_until: parse_ts(row.get("rate_limited_until")),
            },
            None => NotionSyncState {
                data_source_id,
                ..Default::default()
            },
        })
    }

    pub async fn save_notion_sync_state(&self, state: &NotionSyncState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO notion_sync_state
                (data_source_id, last_full_sync, since, next_cursor, rate_limited_until)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(data_source_id) DO UPDATE SET
                last_full_sync = excluded.last_full_sync,
                since = excluded.since,
                next_cursor = excluded.next_cursor,
                rate_limited_until = excluded.rate_limited_until
            "#,
        )
        .bind(state.data_source_id)
        .bind(fmt_ts(state.last_full_sync))
        .bind(fmt_ts(state.since))
        .bind(&state.next_cursor)
        .bind(fmt_ts(state.rate_limited_until))
        .execute(&self.pool)
        .await
        .map_err(DbError::Sqlx)?;
        Ok(())
    }

    pub async fn delete_notion_sync_state(&self, data_source_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM notion_sync_state WHERE data_source_id = ?")
            .bind(data_source_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::Sqlx)?;
        Ok(())
    }

    // ---- drive sync state ----

    pub async fn drive_sync_state(&self, data_source_id: i64) -> Result<DriveSyncState> {
        let row = sqlx::query(
            "SELECT start_page_token, bootstrapped_at, last_synced \
             FROM gdrive_sync_state WHERE data_source_id = ?",
        )
        .bind(data_source_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Sqlx)?;

        Ok(match row {
            Some(row) => DriveSyncState {
                data_source_id,
                start_page_token: row.get("start_page_token"),
                bootstrapped_at: parse_ts(row.get("bootstrapped_at")),
                last_synced: parse_ts(row.get("last_synced")),
            },
            None => DriveSyncState {
                data_source_id,
                ..Default::default()
            },
        })
    }

    pub async fn save_drive_sync_state(&self, state: &DriveSyncState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO gdrive_sync_state
                (data_source_id, start_page_token, bootstrapped_at, last_synced)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(data_source_id) DO UPDATE SET
                start_page_token = excluded.start_page_token,
                bootstrapped_at = excluded.bootstrapped_at,
                last_synced = excluded.last_synced
            "#,
        )
        .bind(state.data_source_id)
        .bind(&state.start_page_token)
        .bind(fmt_ts(state.bootstrapped_at))
        .bind(fmt_ts(state.last_synced))
        .execute(&self.pool)
        .await
        .map_err(DbError::Sqlx)?;
        Ok(())
    }

    pub async fn delete_drive_sync_state(&self, data_source_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM gdrive_sync_state WHERE data_source_id = ?")
            .bind(data_source_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::Sqlx)?;
        sqlx::query("DELETE FROM gdrive_file_snapshots WHERE data_source_id = ?")
            .bind(data_source_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::Sqlx)?;
        Ok(())
    }

    // ---- drive snapshots ----

    pub async fn drive_snapshot(
        &self,
        data_source_id: i64,
        file_id: &str,
    ) -> Result<Option<DriveFileSnapshot>> {
        let row = sqlx::query(
            "SELECT name, mime_type, md5_checksum, version, modified_time, web_view_link, last_synced \
             FROM gdrive_file_snapshots WHERE data_source_id = ? AND file_id = ?",
        )
        .bind(data_source_id)
        .bind(file_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Sqlx)?;

        Ok(row.map(|row| DriveFileSnapshot {
            data_source_id,
            file_id: file_id.to_string(),
            name: row.get("name"),
            mime_type: row.get("mime_type"),
            md5_checksum: row.get("md5_checksum"),
            version: row.get("version"),
            modified_time: parse_ts(row.get("modified_time")),
            web_view_link: row.get("web_view_link"),
            last_synced: parse_ts(row.get("last_synced")),
        }))
    }

    pub async fn save_drive_snapshot(&self, snapshot: &DriveFileSnapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO gdrive_file_snapshots
                (data_source_id, file_id, name, mime_type, md5_checksum, version,
                 modified_time, web_view_link, last_synced)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(data_source_id, file_id) DO UPDATE SET
                name = excluded.name,
                mime_type = excluded.mime_type,
                md5_checksum = excluded.md5_checksum,
                version = excluded.version,
                modified_time = excluded.modified_time,
                web_view_link = excluded.web_view_link,
                last_synced = excluded.last_synced
            "#,
        )
        .bind(snapshot.data_source_id)
        .bind(&snapshot.file_id)
        .bind(&snapshot.name)
        .bind(&snapshot.mime_type)
        .bind(&snapshot.md5_checksum)
        .bind(snapshot.version)
        .bind(fmt_ts(snapshot.modified_time))
        .bind(&snapshot.web_view_link)
        .bind(fmt_ts(snapshot.last_synced))
        .execute(&self.pool)
        .await
        .map_err(DbError::Sqlx)?;
        Ok(())
    }

    pub async fn delete_drive_snapshot(&self, data_source_id: i64, file_id: &str) -> Result<()> {
        sqlx::query(
            "DELETE FROM gdrive_file_snapshots WHERE data_source_id = ? AND file_id = ?",
        )
        .bind(data_source_id)
        .bind(file_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::Sqlx)?;
        Ok(())
    }

    // ---- rag index metadata ----

    pub async fn rag_index_meta(&self, workspace_id: i64) -> Result<Option<RagIndexMeta>> {
        let row = sqlx::query(
            "SELECT engine, storage_uri, dim, status, object_count, vector_count, updated_at \
             FROM rag_indexes WHERE workspace_id = ? AND name = ?",
        )
        .bind(workspace_id)
        .bind(DEFAULT_RAG_INDEX_NAME)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Sqlx)?;

        Ok(row.map(|row| RagIndexMeta {
            workspace_id,
            name: DEFAULT_RAG_INDEX_NAME.to_string(),
            engine: row.get("engine"),
            storage_uri: row.get("storage_uri"),
            dim: row.get("dim"),
            status: row.get("status"),
            object_count: row.get("object_count"),
            vector_count: row.get("vector_count"),
            updated_at: parse_ts(row.get("updated_at")),
        }))
    }

    pub async fn save_rag_index_meta(&self, meta: &RagIndexMeta) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO rag_indexes
                (workspace_id, name, engine, storage_uri, dim, status,
                 object_count, vector_count, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(workspace_id, name) DO UPDATE SET
                engine = excluded.engine,
                storage_uri = excluded.storage_uri,
                dim = excluded.dim,
                status = excluded.status,
                object_count = excluded.object_count,
                vector_count = excluded.vector_count,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(meta.workspace_id)
        .bind(&meta.name)
        .bind(&meta.engine)
        .bind(&meta.storage_uri)
        .bind(meta.dim)
        .bind(&meta.status)
        .bind(meta.object_count)
        .bind(meta.vector_count)
        .bind(fmt_ts(meta.updated_at))
        .execute(&self.pool)
        .await
        .map_err(DbError::Sqlx)?;
        Ok(())
    }
}

fn parse_ts(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn fmt_ts(value: Option<DateTime<Utc>>) -> Option<String> {
    value.map(|dt| dt.to_rfc3339())
}
