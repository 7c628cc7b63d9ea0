//! SQLite persistence for NZB records
//!
//! One table, `nzb_info`, keyed by a generated id with a unique hash of
//! the source link. The inspected content tree is stored as a JSON
//! column and re-hydrated on demand for alias resolution.

use crate::error::{Error, Result};
use crate::types::ContentFile;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, Row};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lifecycle status of an NZB record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NzbStatus {
    /// Queued, not yet inspected
    Pending,
    /// Inspection in progress
    Downloading,
    /// Inspected and ready to stream
    Downloaded,
    /// Inspection failed
    Failed,
}

impl NzbStatus {
    /// Stable string form stored in the `status` column
    pub fn as_str(&self) -> &'static str {
        match self {
            NzbStatus::Pending => "pending",
            NzbStatus::Downloading => "downloading",
            NzbStatus::Downloaded => "downloaded",
            NzbStatus::Failed => "failed",
        }
    }
}

/// One persisted NZB record
#[derive(Clone, Debug, FromRow)]
pub struct NzbInfo {
    /// Generated identifier
    pub id: String,
    /// MD5 of the cleaned source link
    pub hash: String,
    /// Display name
    pub name: String,
    /// Total declared size in bytes
    pub size: i64,
    /// Number of files in the document
    pub file_count: i64,
    /// Archive password, empty when none
    pub password: String,
    /// Source link
    pub url: String,
    /// Owning user
    pub user: String,
    /// Earliest post date among the files
    pub date: Option<DateTime<Utc>>,
    /// Lifecycle status string
    pub status: String,
    /// Inspected content records, as JSON
    pub content_files_json: String,
    /// Whether the content is streamable
    pub streamable: bool,
    /// Row creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
}

impl NzbInfo {
    /// Deserialize the content records column
    pub fn content_files(&self) -> Vec<ContentFile> {
        serde_json::from_str(&self.content_files_json).unwrap_or_default()
    }
}

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a unique record id
pub fn generate_id() -> String {
    use md5::{Digest, Md5};
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let count = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut hasher = Md5::new();
    hasher.update(nanos.to_le_bytes());
    hasher.update(count.to_le_bytes());
    let digest = hasher.finalize();
    format!("{:x}", digest)[..20].to_string()
}

/// Database handle
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Connect and run migrations
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(Error::Database)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS nzb_info (
                id TEXT PRIMARY KEY,
                hash TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                size INTEGER NOT NULL DEFAULT 0,
                file_count INTEGER NOT NULL DEFAULT 0,
                password TEXT NOT NULL DEFAULT '',
                url TEXT NOT NULL,
                user TEXT NOT NULL DEFAULT '',
                date TIMESTAMP,
                status TEXT NOT NULL DEFAULT '',
                content_files_json TEXT NOT NULL DEFAULT '[]',
                streamable INTEGER NOT NULL DEFAULT 0,
                created_at TIMESTAMP NOT NULL,
                updated_at TIMESTAMP NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert or update a record by hash
    pub async fn upsert(&self, info: &NzbInfo) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO nzb_info
                (id, hash, name, size, file_count, password, url, user,
                 date, status, content_files_json, streamable, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(hash) DO UPDATE SET
                name = excluded.name,
                size = excluded.size,
                file_count = excluded.file_count,
                password = excluded.password,
                url = excluded.url,
                user = excluded.user,
                date = excluded.date,
                status = excluded.status,
                content_files_json = excluded.content_files_json,
                streamable = excluded.streamable,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&info.id)
        .bind(&info.hash)
        .bind(&info.name)
        .bind(info.size)
        .bind(info.file_count)
        .bind(&info.password)
        .bind(&info.url)
        .bind(&info.user)
        .bind(info.date)
        .bind(&info.status)
        .bind(&info.content_files_json)
        .bind(info.streamable)
        .bind(info.created_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record by id
    pub async fn get_by_id(&self, id: &str) -> Result<Option<NzbInfo>> {
        let info = sqlx::query_as::<_, NzbInfo>("SELECT * FROM nzb_info WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(info)
    }

    /// Record by link hash
    pub async fn get_by_hash(&self, hash: &str) -> Result<Option<NzbInfo>> {
        let info = sqlx::query_as::<_, NzbInfo>("SELECT * FROM nzb_info WHERE hash = ?")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(info)
    }

    /// All records, newest first
    pub async fn get_all(&self) -> Result<Vec<NzbInfo>> {
        let rows = sqlx::query_as::<_, NzbInfo>(
            "SELECT * FROM nzb_info ORDER BY created_at DESC, id DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Delete a record; returns whether it existed
    pub async fn delete_by_id(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM nzb_info WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Update only the status column
    pub async fn update_status(&self, hash: &str, status: NzbStatus) -> Result<()> {
        sqlx::query("UPDATE nzb_info SET status = ?, updated_at = ? WHERE hash = ?")
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(hash)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Store inspection results
    pub async fn update_content(
        &self,
        hash: &str,
        content_files: &[ContentFile],
        streamable: bool,
        status: NzbStatus,
    ) -> Result<()> {
        let json = serde_json::to_string(content_files)?;
        sqlx::query(
            "UPDATE nzb_info SET content_files_json = ?, streamable = ?, status = ?, updated_at = ? WHERE hash = ?",
        )
        .bind(json)
        .bind(streamable)
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Row count (used by health reporting)
    pub async fn count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM nzb_info")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n"))
    }
}
