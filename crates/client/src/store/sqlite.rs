use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tokio::sync::Mutex;

use super::{LocalStore, Partition, Record, StoreError, StoreResult};
use crate::config::StoreLocation;

/// SQLite-backed store.
///
/// The database is opened lazily on first use. An open failure is logged and
/// returned as [`StoreError::Unavailable`]; the next call tries again.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    location: StoreLocation,
    pool: Arc<Mutex<Option<SqlitePool>>>,
}

impl SqliteStore {
    pub fn new(location: StoreLocation) -> Self {
        Self {
            location,
            pool: Arc::new(Mutex::new(None)),
        }
    }

    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self::new(StoreLocation::File(path.into()))
    }

    /// Private in-memory database (single connection), for tests.
    pub fn in_memory() -> Self {
        Self::new(StoreLocation::Memory)
    }

    pub fn location(&self) -> &StoreLocation {
        &self.location
    }

    async fn ensure_initialized(&self) -> StoreResult<SqlitePool> {
        let mut guard = self.pool.lock().await;
        if let Some(pool) = guard.as_ref() {
            return Ok(pool.clone());
        }

        let pool = match connect(&self.location).await {
            Ok(pool) => pool,
            Err(err) => {
                tracing::warn!(location = ?self.location, "failed to open local store: {err}");
                return Err(err);
            }
        };

        *guard = Some(pool.clone());
        Ok(pool)
    }

    /// Close the pool; a later call reopens it.
    pub async fn close(&self) {
        if let Some(pool) = self.pool.lock().await.take() {
            pool.close().await;
        }
    }
}

async fn connect(location: &StoreLocation) -> StoreResult<SqlitePool> {
    let pool = match location {
        StoreLocation::Memory => {
            let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
            // Every connection to :memory: is its own database.
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?
        }
        StoreLocation::File(path) => {
            ensure_parent_dir(path)?;
            let options = SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true);
            SqlitePoolOptions::new()
                .max_connections(4)
                .connect_with(options)
                .await
                .map_err(|e| StoreError::Unavailable(format!("{}: {e}", path.display())))?
        }
    };

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS records (
            partition   TEXT NOT NULL,
            record_key  TEXT NOT NULL,
            seq         INTEGER NOT NULL DEFAULT 0,
            value       TEXT NOT NULL,
            updated_at  TEXT NOT NULL,
            PRIMARY KEY (partition, record_key)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sequences (
            partition   TEXT PRIMARY KEY,
            last_value  INTEGER NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await?;

    Ok(pool)
}

fn ensure_parent_dir(path: &Path) -> StoreResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            StoreError::Unavailable(format!("failed to create {}: {e}", parent.display()))
        })?;
    }
    Ok(())
}

fn row_to_record(partition: &Partition, row: &sqlx::sqlite::SqliteRow) -> StoreResult<Record> {
    let key: String = row.try_get("record_key")?;
    let seq: i64 = row.try_get("seq")?;
    let raw: String = row.try_get("value")?;
    let updated_at: String = row.try_get("updated_at")?;

    let updated_at = DateTime::parse_from_rfc3339(&updated_at)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            partition: partition.name(),
            reason: format!("invalid updated_at for {key}: {e}"),
        })?;

    Ok(Record {
        seq: u64::try_from(seq).unwrap_or_default(),
        value: serde_json::from_str(&raw)?,
        key,
        updated_at,
    })
}

impl SqliteStore {
    async fn upsert(&self, partition: &Partition, key: &str, seq: u64, value: &Value) -> StoreResult<()> {
        let pool = self.ensure_initialized().await?;
        let seq = i64::try_from(seq).map_err(|_| StoreError::Corrupt {
            partition: partition.name(),
            reason: format!("sequence {seq} out of range"),
        })?;

        sqlx::query(
            r#"
            INSERT INTO records (partition, record_key, seq, value, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(partition, record_key) DO UPDATE SET
                seq = excluded.seq,
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(partition.name())
        .bind(key)
        .bind(seq)
        .bind(serde_json::to_string(value)?)
        .bind(Utc::now().to_rfc3339())
        .execute(&pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl LocalStore for SqliteStore {
    async fn put(&self, partition: &Partition, key: &str, value: &Value) -> StoreResult<()> {
        self.upsert(partition, key, 0, value).await
    }

    async fn put_sequenced(&self, partition: &Partition, seq: u64, value: &Value) -> StoreResult<()> {
        self.upsert(partition, &seq.to_string(), seq, value).await
    }

    async fn get(&self, partition: &Partition, key: &str) -> StoreResult<Option<Record>> {
        let pool = self.ensure_initialized().await?;
        let row = sqlx::query(
            r#"
            SELECT record_key, seq, value, updated_at
            FROM records
            WHERE partition = ?1 AND record_key = ?2
            "#,
        )
        .bind(partition.name())
        .bind(key)
        .fetch_optional(&pool)
        .await?;

        row.map(|row| row_to_record(partition, &row)).transpose()
    }

    async fn get_all(&self, partition: &Partition) -> StoreResult<Vec<Record>> {
        let pool = self.ensure_initialized().await?;
        let rows = sqlx::query(
            r#"
            SELECT record_key, seq, value, updated_at
            FROM records
            WHERE partition = ?1
            ORDER BY seq ASC, record_key ASC
            "#,
        )
        .bind(partition.name())
        .fetch_all(&pool)
        .await?;

        rows.iter().map(|row| row_to_record(partition, row)).collect()
    }

    async fn remove(&self, partition: &Partition, key: &str) -> StoreResult<()> {
        let pool = self.ensure_initialized().await?;
        sqlx::query("DELETE FROM records WHERE partition = ?1 AND record_key = ?2")
            .bind(partition.name())
            .bind(key)
            .execute(&pool)
            .await?;
        Ok(())
    }

    async fn clear(&self, partition: &Partition) -> StoreResult<()> {
        let pool = self.ensure_initialized().await?;
        sqlx::query("DELETE FROM records WHERE partition = ?1")
            .bind(partition.name())
            .execute(&pool)
            .await?;
        Ok(())
    }

    async fn next_sequence(&self, partition: &Partition) -> StoreResult<u64> {
        let pool = self.ensure_initialized().await?;
        let row = sqlx::query(
            r#"
            INSERT INTO sequences (partition, last_value) VALUES (?1, 1)
            ON CONFLICT(partition) DO UPDATE SET last_value = last_value + 1
            RETURNING last_value
            "#,
        )
        .bind(partition.name())
        .fetch_one(&pool)
        .await?;

        let value: i64 = row.try_get("last_value")?;
        u64::try_from(value).map_err(|_| StoreError::Corrupt {
            partition: partition.name(),
            reason: format!("negative sequence {value}"),
        })
    }
}
