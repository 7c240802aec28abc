//! Size-keyed free lists for buffer reuse

use crate::audio::{BufferData, BufferKind};
use std::collections::HashMap;

/// Retains deallocated buffers keyed by (kind, element count)
///
/// Buffers are zeroed on the way out, never on the way in, so pooled memory
/// is only touched when it is actually reused.
#[derive(Debug)]
pub struct BufferPool {
    free: HashMap<(BufferKind, usize), Vec<BufferData>>,
    /// Buffers at or above this size are dropped instead of pooled
    max_buffer_bytes: u64,
    pooled_bytes: u64,
    hits: u64,
    misses: u64,
}

impl BufferPool {
    pub fn new(max_buffer_bytes: u64) -> Self {
        Self {
            free: HashMap::new(),
            max_buffer_bytes,
            pooled_bytes: 0,
            hits: 0,
            misses: 0,
        }
    }

    /// Reuse a pooled buffer of exactly this shape, or allocate a fresh one
    pub fn take(&mut self, kind: BufferKind, len: usize) -> BufferData {
        if let Some(list) = self.free.get_mut(&(kind, len)) {
            if let Some(mut data) = list.pop() {
                if list.is_empty() {
                    self.free.remove(&(kind, len));
                }
                self.pooled_bytes = self.pooled_bytes.saturating_sub(data.size_bytes());
                self.hits += 1;
                data.fill_zero();
                return data;
            }
        }
        self.misses += 1;
        BufferData::zeroed(kind, len)
    }

    /// Offer a buffer for reuse; returns false if it was too large to keep
    pub fn give_back(&mut self, data: BufferData) -> bool {
        let size = data.size_bytes();
        if size == 0 || size >= self.max_buffer_bytes {
            return false;
        }
        self.pooled_bytes += size;
        self.free
            .entry((data.kind(), data.len()))
            .or_default()
            .push(data);
        true
    }

    /// Release every pooled buffer; returns bytes freed
    pub fn trim(&mut self) -> u64 {
        let freed = self.pooled_bytes;
        self.free.clear();
        self.pooled_bytes = 0;
        freed
    }

    pub fn pooled_bytes(&self) -> u64 {
        self.pooled_bytes
    }

    pub fn pooled_buffers(&self) -> usize {
        self.free.values().map(|l| l.len()).sum()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }
}
