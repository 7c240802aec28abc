//! In-memory LRU tier

use super::entry::StoredSamples;
use crate::memory::AllocationId;
use crate::source::SourceKey;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub(crate) struct MemoryEntry {
    pub samples: StoredSamples,
    pub waveform: Arc<Vec<f32>>,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    /// Monotonic access counter; lowest is least recently used
    pub access_seq: u64,
    /// Memory manager record for this entry
    pub allocation: Option<AllocationId>,
}

/// Entries keyed by source with LRU ordering by access sequence
#[derive(Debug, Default)]
pub(crate) struct MemoryTier {
    entries: HashMap<SourceKey, MemoryEntry>,
    total_bytes: u64,
    next_seq: u64,
}

impl MemoryTier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn peek(&self, key: &SourceKey) -> Option<&MemoryEntry> {
        self.entries.get(key)
    }

    /// Mark as most recently used and return a snapshot
    pub fn touch(&mut self, key: &SourceKey, now: DateTime<Utc>) -> Option<MemoryEntry> {
        let seq = self.bump();
        let entry = self.entries.get_mut(key)?;
        entry.access_seq = seq;
        entry.last_accessed_at = now;
        Some(entry.clone())
    }

    /// Insert as most recently used; returns the entry it replaced
    pub fn insert(&mut self, key: SourceKey, mut entry: MemoryEntry) -> Option<MemoryEntry> {
        entry.access_seq = self.bump();
        self.total_bytes += entry.size_bytes;
        let replaced = self.entries.insert(key, entry);
        if let Some(old) = &replaced {
            self.total_bytes = self.total_bytes.saturating_sub(old.size_bytes);
        }
        replaced
    }

    pub fn remove(&mut self, key: &SourceKey) -> Option<MemoryEntry> {
        let entry = self.entries.remove(key)?;
        self.total_bytes = self.total_bytes.saturating_sub(entry.size_bytes);
        Some(entry)
    }

    /// Remove and return the least recently used entry
    pub fn pop_lru(&mut self) -> Option<(SourceKey, MemoryEntry)> {
        let key = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.access_seq)
            .map(|(k, _)| k.clone())?;
        let entry = self.remove(&key)?;
        Some((key, entry))
    }

    /// Keys whose last access is older than `ttl_ms` milliseconds
    pub fn expired_keys(&self, elapsed_ms: impl Fn(DateTime<Utc>) -> f64, ttl_ms: f64) -> Vec<SourceKey> {
        self.entries
            .iter()
            .filter(|(_, e)| elapsed_ms(e.last_accessed_at) > ttl_ms)
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn drain(&mut self) -> Vec<(SourceKey, MemoryEntry)> {
        self.total_bytes = 0;
        self.entries.drain().collect()
    }

    pub fn keys(&self) -> impl Iterator<Item = &SourceKey> {
        self.entries.keys()
    }

    fn bump(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::SampleBuffer;

    fn entry(size_bytes: u64) -> MemoryEntry {
        let buffer = SampleBuffer::mono(vec![0.0; 4], 8000).unwrap();
        MemoryEntry {
            samples: StoredSamples::Raw(Arc::new(buffer)),
            waveform: Arc::new(Vec::new()),
            size_bytes,
            created_at: Utc::now(),
            last_accessed_at: Utc::now(),
            access_seq: 0,
            allocation: None,
        }
    }

    fn key(s: &str) -> SourceKey {
        SourceKey::parse(s).unwrap()
    }

    #[test]
    fn test_lru_order_follows_access() {
        let mut tier = MemoryTier::new();
        tier.insert(key("yt:a"), entry(10));
        tier.insert(key("yt:b"), entry(10));
        tier.touch(&key("yt:a"), Utc::now());

        let (evicted, _) = tier.pop_lru().unwrap();
        assert_eq!(evicted, key("yt:b"));
    }

    #[test]
    fn test_replacing_adjusts_total() {
        let mut tier = MemoryTier::new();
        tier.insert(key("yt:a"), entry(10));
        let replaced = tier.insert(key("yt:a"), entry(25));
        assert_eq!(replaced.unwrap().size_bytes, 10);
        assert_eq!(tier.total_bytes(), 25);
        assert_eq!(tier.len(), 1);
    }
}
