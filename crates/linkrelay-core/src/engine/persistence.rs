//! SQLite-based transfer history
//!
//! The pipeline itself keeps nothing once a task leaves the registry; it
//! hands each terminal task to a [`RecordStore`].

use crate::error::RelayError;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use linkrelay_types::{TaskId, TaskStatus, TransferRecord, UserId, UserStats};
use sqlx::{sqlite::{SqliteConnectOptions, SqlitePool}, Row, SqlitePool as Pool};
use std::path::Path;
use uuid::Uuid;

/// Sink for terminal transfer records
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn record(&self, record: &TransferRecord) -> Result<(), RelayError>;
}

/// Drops every record
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRecordStore;

#[async_trait]
impl RecordStore for NoopRecordStore {
    async fn record(&self, _record: &TransferRecord) -> Result<(), RelayError> {
        Ok(())
    }
}

/// Database connection pool for transfer history
#[derive(Clone, Debug)]
pub struct HistoryDatabase {
    pool: Pool,
}

impl HistoryDatabase {
    /// Open (or create) the database at `db_path`
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, RelayError> {
        let path = db_path.as_ref();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transfers (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                task_id TEXT NOT NULL,
                artifact_name TEXT NOT NULL,
                source_url TEXT NOT NULL,
                bytes INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                file_id TEXT,
                share_link TEXT,
                error TEXT,
                created_at TEXT NOT NULL,
                finished_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_transfers_user ON transfers(user_id);
            CREATE INDEX IF NOT EXISTS idx_transfers_finished ON transfers(finished_at);
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Insert a record, replacing any earlier row with the same id
    pub async fn insert(&self, record: &TransferRecord) -> Result<(), RelayError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO transfers (
                id, user_id, task_id, artifact_name, source_url, bytes, status,
                file_id, share_link, error, created_at, finished_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id.to_string())
        .bind(record.user_id.as_str())
        .bind(record.task_id.as_str())
        .bind(&record.artifact_name)
        .bind(&record.source_url)
        .bind(record.bytes as i64)
        .bind(record.status.as_str())
        .bind(record.file_id.as_ref())
        .bind(record.share_link.as_ref())
        .bind(record.error.as_ref())
        .bind(timestamp(&record.created_at))
        .bind(timestamp(&record.finished_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Newest first, optionally for one user only
    pub async fn load_records(
        &self,
        user: Option<&UserId>,
        limit: usize,
    ) -> Result<Vec<TransferRecord>, RelayError> {
        let rows = match user {
            Some(user) => {
                sqlx::query(
                    "SELECT * FROM transfers WHERE user_id = ? ORDER BY finished_at DESC LIMIT ?",
                )
                .bind(user.as_str())
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM transfers ORDER BY finished_at DESC LIMIT ?")
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.into_iter().map(row_to_record).collect()
    }

    /// Transfer count and relayed volume for one user
    pub async fn user_stats(&self, user: &UserId) -> Result<UserStats, RelayError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS transfers,
                COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0) AS completed,
                COALESCE(SUM(CASE WHEN status = 'completed' THEN bytes ELSE 0 END), 0) AS bytes
            FROM transfers WHERE user_id = ?
            "#,
        )
        .bind(user.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(UserStats {
            transfers: row.get::<i64, _>("transfers") as u64,
            completed: row.get::<i64, _>("completed") as u64,
            bytes: row.get::<i64, _>("bytes") as u64,
        })
    }

    /// Remove every record
    pub async fn clear(&self) -> Result<u64, RelayError> {
        let result = sqlx::query("DELETE FROM transfers")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl RecordStore for HistoryDatabase {
    async fn record(&self, record: &TransferRecord) -> Result<(), RelayError> {
        self.insert(record).await
    }
}

/// Convert a database row to a TransferRecord
fn row_to_record(row: sqlx::sqlite::SqliteRow) -> Result<TransferRecord, RelayError> {
    let status = row
        .get::<String, _>("status")
        .parse::<TaskStatus>()
        .map_err(RelayError::Serialization)?;

    Ok(TransferRecord {
        id: Uuid::parse_str(row.get::<String, _>("id").as_str())
            .map_err(|e| RelayError::Serialization(e.to_string()))?,
        user_id: UserId::new(row.get::<String, _>("user_id")),
        task_id: TaskId::from(row.get::<String, _>("task_id")),
        artifact_name: row.get("artifact_name"),
        source_url: row.get("source_url"),
        bytes: row.get::<i64, _>("bytes") as u64,
        status,
        file_id: row.get("file_id"),
        share_link: row.get("share_link"),
        error: row.get("error"),
        created_at: parse_timestamp(row.get::<String, _>("created_at").as_str())?,
        finished_at: parse_timestamp(row.get::<String, _>("finished_at").as_str())?,
    })
}

/// Fixed-width so that text ordering is chronological
fn timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, RelayError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RelayError::Serialization(e.to_string()))
}
