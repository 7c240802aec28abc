//! Two-tier sample cache
//!
//! **Tiers:**
//! - Memory: LRU bounded by `max_entries` and `max_memory_bytes`; entries
//!   are accounted with the [`MemoryManager`] and dropped when it evicts them
//! - Persistent: a [`PersistentStore`] bounded by `max_persistent_bytes`
//!
//! **Policies:**
//! - `get` checks memory first, then the persistent tier, promoting hits
//! - Entries idle longer than the TTL (measured from last access) are
//!   treated as absent and removed on sight
//! - Over-budget puts evict least recently used entries until usage is
//!   at or below `cleanup_threshold_ratio` of the budget
//! - `QuotaExceeded` runs emergency cleanup and retries once
//! - A persistence I/O failure switches the cache to memory-only

use super::compression;
use super::entry::{decode_record, encode_record, entry_size, CacheEntry, StoredSamples};
use super::memory_tier::{MemoryEntry, MemoryTier};
use super::store::PersistentStore;
use crate::audio::SampleBuffer;
use crate::error::StorageError;
use crate::memory::{AllocationId, CleanupStrategy, MemoryManager};
use crate::source::SourceKey;
use chrono::{DateTime, Utc};
use clipdeck_common::config::CacheConfig;
use clipdeck_common::{Clock, Subscription};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

/// Memory-manager tag carried by every memory-tier entry
const CACHE_TAG: &str = "cache";
/// Tag prefix naming the entry's source key
const SOURCE_TAG: &str = "source";

/// Cache diagnostics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    /// Distinct keys across both tiers
    pub entry_count: usize,
    /// Memory tier bytes plus persistent tier bytes
    pub total_bytes: u64,
    /// Combined byte budget of both tiers
    pub quota: u64,
    pub memory_entries: usize,
    pub memory_bytes: u64,
    pub persistent_entries: usize,
    pub persistent_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Entries written quantized since startup
    pub compressed_entries: u64,
    pub bytes_saved: u64,
    /// Compressed bytes / original bytes over all compressed writes (1.0 if none)
    pub compression_ratio: f64,
    /// Persistent tier disabled after an I/O failure
    pub degraded: bool,
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    compressed_entries: AtomicU64,
    compressed_original_bytes: AtomicU64,
    compressed_stored_bytes: AtomicU64,
}

/// Two-tier cache of decoded sources
pub struct PersistentCache {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    memory: Arc<MemoryManager>,
    tier: Arc<Mutex<MemoryTier>>,
    store: Option<Arc<dyn PersistentStore>>,
    /// Serializes budget check, eviction and save in the persistent tier
    write_lock: AsyncMutex<()>,
    degraded: AtomicBool,
    /// Requested by the caller (`--compress`)
    compression: AtomicBool,
    /// Requested by the active quality settings
    adaptive_compression: AtomicBool,
    counters: Arc<CacheCounters>,
    _eviction_listener: Subscription,
}

impl PersistentCache {
    /// Create a cache; `store = None` runs memory-only
    pub fn new(
        config: CacheConfig,
        memory: Arc<MemoryManager>,
        store: Option<Arc<dyn PersistentStore>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let tier = Arc::new(Mutex::new(MemoryTier::new()));
        let counters = Arc::new(CacheCounters::default());

        let weak_tier: Weak<Mutex<MemoryTier>> = Arc::downgrade(&tier);
        let weak_counters = Arc::downgrade(&counters);
        let listener = memory.on_evicted(move |evicted| {
            if !evicted.tags.contains(CACHE_TAG) {
                return;
            }
            let Some(tier) = weak_tier.upgrade() else { return };
            let Some(key) = evicted
                .tag_value(SOURCE_TAG)
                .and_then(|k| SourceKey::parse(k).ok())
            else {
                return;
            };
            let mut tier = tier.lock().unwrap_or_else(|e| e.into_inner());
            let owned = tier
                .peek(&key)
                .is_some_and(|e| e.allocation == Some(evicted.id));
            if owned {
                tier.remove(&key);
                if let Some(counters) = weak_counters.upgrade() {
                    counters.evictions.fetch_add(1, Ordering::Relaxed);
                }
                debug!("Memory manager evicted cached {}", key);
            }
        });

        if let Some(store) = &store {
            info!("Cache persistent tier: {}", store.name());
        } else {
            info!("Cache running memory-only");
        }

        Self {
            config,
            clock,
            memory,
            tier,
            store,
            write_lock: AsyncMutex::new(()),
            degraded: AtomicBool::new(false),
            compression: AtomicBool::new(false),
            adaptive_compression: AtomicBool::new(false),
            counters,
            _eviction_listener: listener,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Default compression for [`PersistentCache::put`]
    pub fn set_compression(&self, enabled: bool) {
        self.compression.store(enabled, Ordering::Relaxed);
    }

    /// Compression requested by quality adaptation; combined with the
    /// caller's setting, never replacing it
    pub fn set_adaptive_compression(&self, enabled: bool) {
        self.adaptive_compression.store(enabled, Ordering::Relaxed);
    }

    pub fn compression_enabled(&self) -> bool {
        self.compression.load(Ordering::Relaxed)
            || self.adaptive_compression.load(Ordering::Relaxed)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// Look up an entry, promoting persistent hits into memory
    pub async fn get(&self, key: &SourceKey) -> Option<CacheEntry> {
        let now = self.clock.now();

        enum Lookup {
            Hit(MemoryEntry),
            Expired(Option<AllocationId>),
            Miss,
        }

        let lookup = {
            let mut tier = self.lock_tier();
            let expired = tier.peek(key).map(|e| self.is_expired(e.last_accessed_at));
            match expired {
                Some(true) => Lookup::Expired(tier.remove(key).and_then(|e| e.allocation)),
                Some(false) => match tier.touch(key, now) {
                    Some(entry) => Lookup::Hit(entry),
                    None => Lookup::Miss,
                },
                None => Lookup::Miss,
            }
        };

        match lookup {
            Lookup::Hit(entry) => {
                if let Some(id) = entry.allocation {
                    self.memory.touch(id);
                }
                self.touch_persistent(key, now).await;
                match entry.samples.to_buffer() {
                    Ok(buffer) => {
                        self.counters.hits.fetch_add(1, Ordering::Relaxed);
                        Some(CacheEntry {
                            key: key.clone(),
                            buffer,
                            waveform: entry.waveform,
                            size_bytes: entry.size_bytes,
                            created_at: entry.created_at,
                            last_accessed_at: now,
                            compressed: entry.samples.is_compressed(),
                        })
                    }
                    Err(e) => {
                        warn!("Dropping unreadable cache entry {}: {}", key, e);
                        self.remove(key).await;
                        self.counters.misses.fetch_add(1, Ordering::Relaxed);
                        None
                    }
                }
            }
            Lookup::Expired(allocation) => {
                debug!("Cache entry {} expired", key);
                if let Some(id) = allocation {
                    self.memory.release(id);
                }
                self.delete_persistent(key).await;
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Lookup::Miss => self.get_persistent(key, now).await,
        }
    }

    async fn get_persistent(&self, key: &SourceKey, now: DateTime<Utc>) -> Option<CacheEntry> {
        let miss = || {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            None
        };
        let Some(store) = self.active_store() else {
            return miss();
        };

        let record = match store.load(key.as_str()).await {
            Ok(Some(record)) => record,
            Ok(None) => return miss(),
            Err(e) => {
                self.degrade(&e);
                return miss();
            }
        };

        if self.is_expired(record.last_accessed_at) {
            debug!("Persistent cache entry {} expired", key);
            self.delete_persistent(key).await;
            return miss();
        }

        let decoded = decode_record(&record).and_then(|s| s.to_buffer().map(|b| (s, b)));
        let (samples, buffer) = match decoded {
            Ok(parts) => parts,
            Err(e) => {
                warn!("Dropping corrupt persistent entry {}: {}", key, e);
                self.delete_persistent(key).await;
                return miss();
            }
        };

        self.touch_persistent(key, now).await;

        let waveform = Arc::new(record.waveform);
        let compressed = samples.is_compressed();
        let size_bytes = record.size_bytes;
        if let Err(e) = self.insert_memory(key, samples, Arc::clone(&waveform), record.created_at) {
            debug!("Not promoting {} into memory: {}", key, e);
        }

        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        Some(CacheEntry {
            key: key.clone(),
            buffer,
            waveform,
            size_bytes,
            created_at: record.created_at,
            last_accessed_at: now,
            compressed,
        })
    }

    /// Memory-tier lookup that never suspends (for trigger paths)
    pub fn get_resident(&self, key: &SourceKey) -> Option<Arc<SampleBuffer>> {
        let now = self.clock.now();
        let (entry, expired) = {
            let mut tier = self.lock_tier();
            if self.is_expired(tier.peek(key)?.last_accessed_at) {
                (None, tier.remove(key).and_then(|e| e.allocation))
            } else {
                (tier.touch(key, now), None)
            }
        };
        if let Some(id) = expired {
            debug!("Cache entry {} expired", key);
            self.memory.release(id);
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
        }
        entry?.samples.to_buffer().ok()
    }

    pub fn is_resident(&self, key: &SourceKey) -> bool {
        self.lock_tier().peek(key).is_some()
    }

    /// Store with the cache's default compression setting
    pub async fn put(
        &self,
        key: &SourceKey,
        buffer: Arc<SampleBuffer>,
        waveform: Vec<f32>,
    ) -> Result<(), StorageError> {
        let compress = self.compression_enabled();
        self.put_with(key, buffer, waveform, compress).await
    }

    /// Store an entry in both tiers
    ///
    /// # Errors
    /// - `QuotaExceeded` if the entry fits neither tier after emergency cleanup
    pub async fn put_with(
        &self,
        key: &SourceKey,
        buffer: Arc<SampleBuffer>,
        waveform: Vec<f32>,
        compress: bool,
    ) -> Result<(), StorageError> {
        let samples = if compress {
            let compressed = compression::compress(&buffer);
            let original = buffer.size_bytes();
            self.counters.compressed_entries.fetch_add(1, Ordering::Relaxed);
            self.counters
                .compressed_original_bytes
                .fetch_add(original, Ordering::Relaxed);
            self.counters
                .compressed_stored_bytes
                .fetch_add(compressed.size_bytes(), Ordering::Relaxed);
            StoredSamples::Compressed(Arc::new(compressed))
        } else {
            StoredSamples::Raw(buffer)
        };
        let waveform = Arc::new(waveform);
        let now = self.clock.now();

        let persisted = match self.write_persistent(key, &samples, &waveform, now).await {
            Ok(persisted) => persisted,
            Err(StorageError::QuotaExceeded { .. }) => {
                warn!("Persistent quota exceeded storing {}, running emergency cleanup", key);
                self.emergency_cleanup().await;
                match self.write_persistent(key, &samples, &waveform, now).await {
                    Ok(persisted) => persisted,
                    Err(e @ StorageError::QuotaExceeded { .. }) => return Err(e),
                    Err(e) => {
                        self.degrade(&e);
                        false
                    }
                }
            }
            Err(e) => {
                self.degrade(&e);
                false
            }
        };

        match self.insert_memory(key, samples.clone(), Arc::clone(&waveform), now) {
            Ok(()) => Ok(()),
            Err(_) if persisted => {
                debug!("{} kept in persistent tier only", key);
                Ok(())
            }
            Err(StorageError::QuotaExceeded { .. }) => {
                warn!("Memory quota exceeded storing {}, running emergency cleanup", key);
                self.emergency_cleanup().await;
                self.insert_memory(key, samples, waveform, now)
            }
            Err(e) => Err(e),
        }
    }

    /// Insert into the memory tier, evicting LRU entries as needed
    fn insert_memory(
        &self,
        key: &SourceKey,
        samples: StoredSamples,
        waveform: Arc<Vec<f32>>,
        created_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let size = entry_size(&samples, &waveform);
        let max = self.config.max_memory_bytes;
        if size > max {
            return Err(StorageError::QuotaExceeded {
                required: size,
                available: max,
            });
        }

        // Accounted before taking the tier lock: the manager may evict
        // (and call back into the tier) while making room
        let source_tag = format!("{}:{}", SOURCE_TAG, key);
        let allocation = self
            .memory
            .track(size, samples.kind(), &[CACHE_TAG, source_tag.as_str()])
            .map_err(|e| {
                debug!("Memory manager refused {} bytes for {}: {}", size, key, e);
                StorageError::QuotaExceeded {
                    required: size,
                    available: self
                        .memory
                        .config()
                        .max_bytes
                        .saturating_sub(self.memory.current_usage()),
                }
            })?;

        let mut released = Vec::new();
        {
            let mut tier = self.lock_tier();
            if let Some(old) = tier.remove(key) {
                released.extend(old.allocation);
            }

            while tier.len() >= self.config.max_entries {
                match tier.pop_lru() {
                    Some((evicted, entry)) => {
                        debug!("Evicted {} (entry limit)", evicted);
                        released.extend(entry.allocation);
                        self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                    }
                    None => break,
                }
            }

            if tier.total_bytes() + size > max {
                let goal = self.threshold_bytes(max);
                while tier.total_bytes() + size > goal && !tier.is_empty() {
                    match tier.pop_lru() {
                        Some((evicted, entry)) => {
                            debug!("Evicted {} (memory budget)", evicted);
                            released.extend(entry.allocation);
                            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                        }
                        None => break,
                    }
                }
            }

            let now = self.clock.now();
            tier.insert(
                key.clone(),
                MemoryEntry {
                    samples,
                    waveform,
                    size_bytes: size,
                    created_at,
                    last_accessed_at: now,
                    access_seq: 0,
                    allocation: Some(allocation),
                },
            );
        }

        for id in released {
            self.memory.release(id);
        }
        Ok(())
    }

    /// Returns Ok(false) when no persistent tier is active
    async fn write_persistent(
        &self,
        key: &SourceKey,
        samples: &StoredSamples,
        waveform: &[f32],
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let Some(store) = self.active_store() else {
            return Ok(false);
        };

        let record = encode_record(key, samples, waveform, now, now);
        let size = record.size_bytes;
        let max = self.config.max_persistent_bytes;
        if size > max {
            return Err(StorageError::QuotaExceeded {
                required: size,
                available: max,
            });
        }

        let _writing = self.write_lock.lock().await;
        let mut others: Vec<_> = store
            .list()
            .await?
            .into_iter()
            .filter(|m| m.source_key != record.source_key)
            .collect();
        let mut total: u64 = others.iter().map(|m| m.size_bytes).sum();

        if total + size > max {
            let goal = self.threshold_bytes(max);
            others.sort_by_key(|m| m.last_accessed_at);
            for meta in others {
                if total + size <= goal {
                    break;
                }
                store.delete(&meta.source_key).await?;
                total = total.saturating_sub(meta.size_bytes);
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                debug!("Evicted {} from persistent tier", meta.source_key);
            }
            if total + size > max {
                return Err(StorageError::QuotaExceeded {
                    required: size,
                    available: max.saturating_sub(total),
                });
            }
        }

        store.save(record).await?;
        Ok(true)
    }

    /// Remove from both tiers; returns true if either held the key
    pub async fn remove(&self, key: &SourceKey) -> bool {
        let removed = self.lock_tier().remove(key);
        let in_memory = removed.is_some();
        if let Some(id) = removed.and_then(|e| e.allocation) {
            self.memory.release(id);
        }
        let persisted = self.delete_persistent(key).await;
        in_memory || persisted
    }

    pub async fn clear(&self) {
        let drained = self.lock_tier().drain();
        for (_, entry) in drained {
            if let Some(id) = entry.allocation {
                self.memory.release(id);
            }
        }
        if let Some(store) = self.active_store() {
            if let Err(e) = store.clear().await {
                self.degrade(&e);
            }
        }
        info!("Cache cleared");
    }

    /// Protect a resident entry from memory cleanup
    pub fn pin(&self, key: &SourceKey) -> bool {
        self.allocation_of(key)
            .map(|id| self.memory.pin(id).is_ok())
            .unwrap_or(false)
    }

    pub fn unpin(&self, key: &SourceKey) -> bool {
        self.allocation_of(key)
            .map(|id| self.memory.unpin(id).is_ok())
            .unwrap_or(false)
    }

    fn allocation_of(&self, key: &SourceKey) -> Option<AllocationId> {
        self.lock_tier().peek(key).and_then(|e| e.allocation)
    }

    /// Drop every TTL-expired entry from both tiers; returns entries removed
    pub async fn purge_expired(&self) -> usize {
        let ttl_ms = self.ttl_ms();
        let expired: Vec<_> = {
            let mut tier = self.lock_tier();
            let keys = tier.expired_keys(|at| self.clock.millis_since(at), ttl_ms);
            keys.into_iter()
                .filter_map(|k| tier.remove(&k).map(|e| (k, e)))
                .collect()
        };
        let mut removed = expired.len();
        for (_, entry) in expired {
            if let Some(id) = entry.allocation {
                self.memory.release(id);
            }
        }

        if let Some(store) = self.active_store() {
            match store.list().await {
                Ok(metas) => {
                    for meta in metas {
                        if self.is_expired(meta.last_accessed_at) {
                            match store.delete(&meta.source_key).await {
                                Ok(true) => removed += 1,
                                Ok(false) => {}
                                Err(e) => {
                                    self.degrade(&e);
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(e) => self.degrade(&e),
            }
        }

        if removed > 0 {
            debug!("Purged {} expired cache entries", removed);
        }
        removed
    }

    pub async fn stats(&self) -> CacheStats {
        let (memory_keys, memory_bytes): (HashSet<SourceKey>, u64) = {
            let tier = self.lock_tier();
            (tier.keys().cloned().collect(), tier.total_bytes())
        };

        let metas = match self.active_store() {
            Some(store) => match store.list().await {
                Ok(metas) => metas,
                Err(e) => {
                    self.degrade(&e);
                    Vec::new()
                }
            },
            None => Vec::new(),
        };
        let persistent_bytes: u64 = metas.iter().map(|m| m.size_bytes).sum();
        let persistent_only = metas
            .iter()
            .filter(|m| {
                SourceKey::parse(&m.source_key)
                    .map(|k| !memory_keys.contains(&k))
                    .unwrap_or(true)
            })
            .count();

        let original = self.counters.compressed_original_bytes.load(Ordering::Relaxed);
        let stored = self.counters.compressed_stored_bytes.load(Ordering::Relaxed);

        CacheStats {
            entry_count: memory_keys.len() + persistent_only,
            total_bytes: memory_bytes + persistent_bytes,
            quota: self.config.max_memory_bytes + self.config.max_persistent_bytes,
            memory_entries: memory_keys.len(),
            memory_bytes,
            persistent_entries: metas.len(),
            persistent_bytes,
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            compressed_entries: self.counters.compressed_entries.load(Ordering::Relaxed),
            bytes_saved: original.saturating_sub(stored),
            compression_ratio: if original == 0 {
                1.0
            } else {
                stored as f64 / original as f64
            },
            degraded: self.is_degraded(),
        }
    }

    async fn emergency_cleanup(&self) {
        let report = self.memory.run_cleanup(&[CleanupStrategy::Emergency]);
        let purged = self.purge_expired().await;
        info!(
            "Emergency cleanup freed {} bytes and purged {} expired entries",
            report.freed_bytes(),
            purged
        );
    }

    async fn touch_persistent(&self, key: &SourceKey, now: DateTime<Utc>) {
        if let Some(store) = self.active_store() {
            if let Err(e) = store.touch(key.as_str(), now).await {
                self.degrade(&e);
            }
        }
    }

    async fn delete_persistent(&self, key: &SourceKey) -> bool {
        let Some(store) = self.active_store() else {
            return false;
        };
        match store.delete(key.as_str()).await {
            Ok(deleted) => deleted,
            Err(e) => {
                self.degrade(&e);
                false
            }
        }
    }

    fn active_store(&self) -> Option<Arc<dyn PersistentStore>> {
        if self.is_degraded() {
            return None;
        }
        self.store.clone()
    }

    fn degrade(&self, err: &StorageError) {
        if !self.degraded.swap(true, Ordering::AcqRel) {
            warn!(
                "Persistent cache unavailable ({}), continuing memory-only",
                err
            );
        }
    }

    fn is_expired(&self, last_accessed_at: DateTime<Utc>) -> bool {
        self.clock.millis_since(last_accessed_at) > self.ttl_ms()
    }

    fn ttl_ms(&self) -> f64 {
        self.config.entry_ttl().as_millis() as f64
    }

    fn threshold_bytes(&self, max: u64) -> u64 {
        (max as f64 * self.config.cleanup_threshold_ratio) as u64
    }

    fn lock_tier(&self) -> MutexGuard<'_, MemoryTier> {
        self.tier.lock().unwrap_or_else(|e| e.into_inner())
    }
}
