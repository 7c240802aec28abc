//! Persistence backends for the slow cache tier

use crate::audio::BufferKind;
use crate::error::StorageError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// On-disk shape of a cache entry
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedRecord {
    pub id: Uuid,
    pub source_key: String,
    /// Element type of `serialized_buffer`
    pub encoding: BufferKind,
    /// Planar little-endian samples, channel after channel
    pub serialized_buffer: Vec<u8>,
    pub waveform: Vec<f32>,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub sample_rate: u32,
    pub channel_count: u16,
    pub duration_seconds: f64,
}

impl PersistedRecord {
    pub fn meta(&self) -> RecordMeta {
        RecordMeta {
            source_key: self.source_key.clone(),
            size_bytes: self.size_bytes,
            created_at: self.created_at,
            last_accessed_at: self.last_accessed_at,
        }
    }
}

/// Record header used for eviction decisions
#[derive(Debug, Clone, PartialEq)]
pub struct RecordMeta {
    pub source_key: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

/// Slow-tier storage
///
/// Implementations report an unavailable backend as `StorageError::Io`,
/// which switches the cache to memory-only operation.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<PersistedRecord>, StorageError>;

    /// Insert or replace the record for `record.source_key`
    async fn save(&self, record: PersistedRecord) -> Result<(), StorageError>;

    async fn touch(&self, key: &str, at: DateTime<Utc>) -> Result<(), StorageError>;

    /// Returns true if a record was removed
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    async fn clear(&self) -> Result<(), StorageError>;

    async fn list(&self) -> Result<Vec<RecordMeta>, StorageError>;

    /// Backend name for logs
    fn name(&self) -> &'static str;
}

/// Volatile store for tests and `--memory-only` runs
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, PersistedRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistentStore for MemoryStore {
    async fn load(&self, key: &str) -> Result<Option<PersistedRecord>, StorageError> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn save(&self, record: PersistedRecord) -> Result<(), StorageError> {
        self.records
            .write()
            .await
            .insert(record.source_key.clone(), record);
        Ok(())
    }

    async fn touch(&self, key: &str, at: DateTime<Utc>) -> Result<(), StorageError> {
        if let Some(record) = self.records.write().await.get_mut(key) {
            record.last_accessed_at = at;
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.records.write().await.remove(key).is_some())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.records.write().await.clear();
        Ok(())
    }

    async fn list(&self) -> Result<Vec<RecordMeta>, StorageError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .map(PersistedRecord::meta)
            .collect())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
