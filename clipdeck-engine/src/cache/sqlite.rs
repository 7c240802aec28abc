//! SQLite-backed persistent tier

use super::store::{PersistedRecord, PersistentStore, RecordMeta};
use crate::audio::BufferKind;
use crate::error::StorageError;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;
use tracing::info;
use uuid::Uuid;

/// Persistent tier stored in a single `cache_entries` table
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `db_path`
    pub async fn open(db_path: &Path) -> Result<Self, StorageError> {
        let newly_created = !db_path.exists();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Io(e.to_string()))?;
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect(&db_url)
            .await?;

        if newly_created {
            info!("Initialized new cache database: {}", db_path.display());
        } else {
            info!("Opened existing cache database: {}", db_path.display());
        }

        sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
        sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

        let store = Self { pool };
        store.create_schema().await?;
        Ok(store)
    }

    /// Private in-memory database (single connection so every query sees it)
    pub async fn in_memory() -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.create_schema().await?;
        Ok(store)
    }

    async fn create_schema(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cache_entries (
                source_key TEXT PRIMARY KEY,
                id TEXT NOT NULL,
                encoding TEXT NOT NULL,
                serialized_buffer BLOB NOT NULL,
                waveform BLOB NOT NULL,
                size_bytes INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                last_accessed_at INTEGER NOT NULL,
                sample_rate INTEGER NOT NULL,
                channel_count INTEGER NOT NULL,
                duration_seconds REAL NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_cache_entries_last_accessed ON cache_entries(last_accessed_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StorageError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StorageError::Serialization(format!("invalid timestamp {}", ms)))
}

fn waveform_to_blob(waveform: &[f32]) -> Vec<u8> {
    waveform.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn waveform_from_blob(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

fn record_from_row(row: &SqliteRow) -> Result<PersistedRecord, StorageError> {
    let id: String = row.try_get("id")?;
    let encoding: String = row.try_get("encoding")?;
    let waveform: Vec<u8> = row.try_get("waveform")?;
    let size_bytes: i64 = row.try_get("size_bytes")?;
    let sample_rate: i64 = row.try_get("sample_rate")?;
    let channel_count: i64 = row.try_get("channel_count")?;

    Ok(PersistedRecord {
        id: Uuid::parse_str(&id).map_err(|e| StorageError::Serialization(e.to_string()))?,
        source_key: row.try_get("source_key")?,
        encoding: BufferKind::parse(&encoding).ok_or_else(|| {
            StorageError::Serialization(format!("unknown encoding {}", encoding))
        })?,
        serialized_buffer: row.try_get("serialized_buffer")?,
        waveform: waveform_from_blob(&waveform),
        size_bytes: size_bytes.max(0) as u64,
        created_at: from_millis(row.try_get("created_at")?)?,
        last_accessed_at: from_millis(row.try_get("last_accessed_at")?)?,
        sample_rate: sample_rate.max(0) as u32,
        channel_count: channel_count.max(0) as u16,
        duration_seconds: row.try_get("duration_seconds")?,
    })
}

#[async_trait]
impl PersistentStore for SqliteStore {
    async fn load(&self, key: &str) -> Result<Option<PersistedRecord>, StorageError> {
        let row = sqlx::query("SELECT * FROM cache_entries WHERE source_key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn save(&self, record: PersistedRecord) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO cache_entries (
                source_key, id, encoding, serialized_buffer, waveform, size_bytes,
                created_at, last_accessed_at, sample_rate, channel_count, duration_seconds
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.source_key)
        .bind(record.id.to_string())
        .bind(record.encoding.as_str())
        .bind(&record.serialized_buffer)
        .bind(waveform_to_blob(&record.waveform))
        .bind(record.size_bytes as i64)
        .bind(to_millis(record.created_at))
        .bind(to_millis(record.last_accessed_at))
        .bind(record.sample_rate as i64)
        .bind(record.channel_count as i64)
        .bind(record.duration_seconds)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn touch(&self, key: &str, at: DateTime<Utc>) -> Result<(), StorageError> {
        sqlx::query("UPDATE cache_entries SET last_accessed_at = ? WHERE source_key = ?")
            .bind(to_millis(at))
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE source_key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn clear(&self) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM cache_entries")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<RecordMeta>, StorageError> {
        let rows = sqlx::query(
            "SELECT source_key, size_bytes, created_at, last_accessed_at FROM cache_entries",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let size_bytes: i64 = row.try_get("size_bytes")?;
                Ok(RecordMeta {
                    source_key: row.try_get("source_key")?,
                    size_bytes: size_bytes.max(0) as u64,
                    created_at: from_millis(row.try_get("created_at")?)?,
                    last_accessed_at: from_millis(row.try_get("last_accessed_at")?)?,
                })
            })
            .collect()
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}
