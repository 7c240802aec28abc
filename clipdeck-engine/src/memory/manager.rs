//! Memory manager
//!
//! Accounts for every large buffer the engine holds, pools deallocated
//! buffers for reuse, and frees memory through escalating cleanup
//! strategies when usage approaches the configured maximum.
//!
//! **Ownership model:**
//! - [`MemoryManager::allocate`] hands out a [`BufferAllocation`] that owns
//!   its storage; the manager keeps only an accounting record
//! - [`MemoryManager::track`] accounts for storage owned elsewhere (cache
//!   entries hold `Arc<SampleBuffer>`)
//! - Evicting a record notifies `on_evicted` listeners, which drop the
//!   storage they own
//!
//! **Cleanup strategies** (escalating severity):
//! 1. Trim the buffer pool
//! 2. Evict allocations idle longer than an age threshold
//! 3. Evict the largest allocations first
//! 4. Ask the host for a garbage collection pass (if a hook is installed)
//! 5. Emergency: evict every unpinned allocation and clear the pool
//!
//! Pinned allocations are never selected by any strategy.

use super::pool::BufferPool;
use crate::audio::{BufferData, BufferKind};
use crate::error::MemoryError;
use chrono::{DateTime, Utc};
use clipdeck_common::config::MemoryConfig;
use clipdeck_common::{Clock, ObserverRegistry, Subscription};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Elevated pressure ends and critical begins at this usage fraction
const CRITICAL_RATIO: f64 = 0.95;

/// Opaque allocation handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct AllocationId(Uuid);

impl AllocationId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for AllocationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Buffer handed out by [`MemoryManager::allocate`]
#[derive(Debug)]
pub struct BufferAllocation {
    id: AllocationId,
    size_bytes: u64,
    tags: BTreeSet<String>,
    /// Backing storage, owned by the holder of this allocation
    pub data: BufferData,
}

impl BufferAllocation {
    pub fn id(&self) -> AllocationId {
        self.id
    }

    pub fn kind(&self) -> BufferKind {
        self.data.kind()
    }

    /// Accounted size (the size requested at allocation time)
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }
}

/// Options for [`MemoryManager::deallocate`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeallocateOptions {
    /// Keep the storage in the pool instead of freeing it (honored only
    /// below memory pressure and under the pool size threshold)
    pub pool_for_reuse: bool,
}

impl DeallocateOptions {
    pub fn pooled() -> Self {
        Self {
            pool_for_reuse: true,
        }
    }
}

/// One cleanup action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupStrategy {
    TrimPool,
    /// Evict unpinned allocations idle longer than this
    EvictOlderThan(Duration),
    /// Evict unpinned allocations, largest first, until this many bytes are freed
    EvictLargest { target_bytes: u64 },
    RequestGc,
    Emergency,
}

/// Allocation removed by a cleanup strategy
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvictedAllocation {
    pub id: AllocationId,
    pub kind: BufferKind,
    pub size_bytes: u64,
    pub tags: BTreeSet<String>,
}

impl EvictedAllocation {
    /// Value of the first `prefix:value` tag
    pub fn tag_value(&self, prefix: &str) -> Option<&str> {
        self.tags
            .iter()
            .find_map(|t| t.strip_prefix(prefix).and_then(|rest| rest.strip_prefix(':')))
    }
}

/// Outcome of a cleanup run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanupReport {
    pub pool_bytes_released: u64,
    pub evicted: Vec<EvictedAllocation>,
    pub gc_requested: bool,
}

impl CleanupReport {
    pub fn freed_bytes(&self) -> u64 {
        self.pool_bytes_released + self.evicted.iter().map(|e| e.size_bytes).sum::<u64>()
    }

    fn merge(&mut self, other: CleanupReport) {
        self.pool_bytes_released += other.pool_bytes_released;
        self.evicted.extend(other.evicted);
        self.gc_requested |= other.gc_requested;
    }
}

/// Coarse usage level relative to `max_bytes`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryPressure {
    /// Below `pressure_ratio`; pooling allowed
    Normal,
    Elevated,
    /// At or above 95% of the maximum
    Critical,
}

/// Snapshot of manager state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryStats {
    pub live_bytes: u64,
    pub pooled_bytes: u64,
    pub max_bytes: u64,
    pub peak_bytes: u64,
    pub allocations: usize,
    pub pinned: usize,
    pub pooled_buffers: usize,
    pub pool_hits: u64,
    pub pool_misses: u64,
    pub cleanup_runs: u64,
    pub pressure: MemoryPressure,
}

struct AllocationRecord {
    kind: BufferKind,
    size_bytes: u64,
    pinned: bool,
    tags: BTreeSet<String>,
    last_used_at: DateTime<Utc>,
}

struct ManagerState {
    records: HashMap<AllocationId, AllocationRecord>,
    pool: BufferPool,
    live_bytes: u64,
    peak_bytes: u64,
    cleanup_runs: u64,
}

impl ManagerState {
    fn usage(&self) -> u64 {
        self.live_bytes + self.pool.pooled_bytes()
    }

    fn insert(&mut self, id: AllocationId, record: AllocationRecord) {
        self.live_bytes += record.size_bytes;
        self.records.insert(id, record);
        self.peak_bytes = self.peak_bytes.max(self.usage());
    }

    fn remove(&mut self, id: &AllocationId) -> Option<AllocationRecord> {
        let record = self.records.remove(id)?;
        self.live_bytes = self.live_bytes.saturating_sub(record.size_bytes);
        Some(record)
    }

    fn evict(&mut self, id: AllocationId, evicted: &mut Vec<EvictedAllocation>) {
        if let Some(record) = self.remove(&id) {
            evicted.push(EvictedAllocation {
                id,
                kind: record.kind,
                size_bytes: record.size_bytes,
                tags: record.tags,
            });
        }
    }

    fn unpinned(&self) -> impl Iterator<Item = (&AllocationId, &AllocationRecord)> {
        self.records.iter().filter(|(_, r)| !r.pinned)
    }
}

type GcHook = Arc<dyn Fn() + Send + Sync>;

/// Accounting, pooling and cleanup for large buffers
pub struct MemoryManager {
    config: MemoryConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<ManagerState>,
    evictions: ObserverRegistry<EvictedAllocation>,
    gc_hook: Mutex<Option<GcHook>>,
}

impl MemoryManager {
    pub fn new(config: MemoryConfig, clock: Arc<dyn Clock>) -> Self {
        let pool = BufferPool::new(config.pool_max_buffer_bytes);
        Self {
            config,
            clock,
            state: Mutex::new(ManagerState {
                records: HashMap::new(),
                pool,
                live_bytes: 0,
                peak_bytes: 0,
                cleanup_runs: 0,
            }),
            evictions: ObserverRegistry::new(),
            gc_hook: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Allocate zeroed storage for `len` elements of `kind`
    ///
    /// Runs cleanup synchronously if the allocation would exceed
    /// `max_bytes`, escalating to emergency cleanup before giving up.
    ///
    /// # Errors
    /// - `Allocation` if memory is still insufficient after emergency cleanup
    pub fn allocate(
        &self,
        len: usize,
        kind: BufferKind,
        tags: &[&str],
    ) -> Result<BufferAllocation, MemoryError> {
        let size_bytes = (len * kind.element_size()) as u64;
        let id = AllocationId::new();
        let tags: BTreeSet<String> = tags.iter().map(|t| t.to_string()).collect();
        let record_tags = tags.clone();
        let now = self.clock.now();
        let data = self.reserve(size_bytes, move |state| {
            let data = state.pool.take(kind, len);
            state.insert(
                id,
                AllocationRecord {
                    kind,
                    size_bytes,
                    pinned: false,
                    tags: record_tags,
                    last_used_at: now,
                },
            );
            data
        })?;
        debug!("Allocated {} ({} bytes, {})", id, size_bytes, kind.as_str());

        Ok(BufferAllocation {
            id,
            size_bytes,
            tags,
            data,
        })
    }

    /// Account for storage owned by the caller
    ///
    /// # Errors
    /// - `Allocation` if memory is still insufficient after emergency cleanup
    pub fn track(
        &self,
        size_bytes: u64,
        kind: BufferKind,
        tags: &[&str],
    ) -> Result<AllocationId, MemoryError> {
        let id = AllocationId::new();
        let record = AllocationRecord {
            kind,
            size_bytes,
            pinned: false,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            last_used_at: self.clock.now(),
        };
        self.reserve(size_bytes, move |state| state.insert(id, record))?;
        Ok(id)
    }

    /// Return an allocation; returns false if it had already been evicted
    pub fn deallocate(&self, allocation: BufferAllocation, options: DeallocateOptions) -> bool {
        let mut state = self.lock_state();
        let known = state.remove(&allocation.id).is_some();
        let below_pressure = self.pressure_for(state.usage()) == MemoryPressure::Normal;
        if options.pool_for_reuse && below_pressure {
            let pooled = state.pool.give_back(allocation.data);
            debug!("Deallocated {} (pooled={})", allocation.id, pooled);
        } else {
            debug!("Deallocated {}", allocation.id);
        }
        known
    }

    /// Stop accounting for tracked storage
    pub fn release(&self, id: AllocationId) -> bool {
        self.lock_state().remove(&id).is_some()
    }

    /// Protect an allocation from every cleanup strategy
    pub fn pin(&self, id: AllocationId) -> Result<(), MemoryError> {
        self.set_pinned(id, true)
    }

    pub fn unpin(&self, id: AllocationId) -> Result<(), MemoryError> {
        self.set_pinned(id, false)
    }

    fn set_pinned(&self, id: AllocationId, pinned: bool) -> Result<(), MemoryError> {
        let mut state = self.lock_state();
        let record = state
            .records
            .get_mut(&id)
            .ok_or(MemoryError::UnknownAllocation(id))?;
        record.pinned = pinned;
        Ok(())
    }

    pub fn is_pinned(&self, id: AllocationId) -> bool {
        self.lock_state()
            .records
            .get(&id)
            .map(|r| r.pinned)
            .unwrap_or(false)
    }

    pub fn contains(&self, id: AllocationId) -> bool {
        self.lock_state().records.contains_key(&id)
    }

    /// Mark an allocation as recently used (resets its idle age)
    pub fn touch(&self, id: AllocationId) {
        let now = self.clock.now();
        if let Some(record) = self.lock_state().records.get_mut(&id) {
            record.last_used_at = now;
        }
    }

    /// Bytes held: live allocations plus pooled buffers
    pub fn current_usage(&self) -> u64 {
        self.lock_state().usage()
    }

    pub fn pressure(&self) -> MemoryPressure {
        let usage = self.current_usage();
        self.pressure_for(usage)
    }

    fn pressure_for(&self, usage: u64) -> MemoryPressure {
        let max = self.config.max_bytes.max(1) as f64;
        let ratio = usage as f64 / max;
        if ratio >= CRITICAL_RATIO {
            MemoryPressure::Critical
        } else if ratio >= self.config.pressure_ratio {
            MemoryPressure::Elevated
        } else {
            MemoryPressure::Normal
        }
    }

    /// Subscribe to evictions; listeners should drop the storage they own
    pub fn on_evicted<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&EvictedAllocation) + Send + Sync + 'static,
    {
        self.evictions.subscribe(callback)
    }

    /// Install the host's garbage-collection hook used by `RequestGc`
    pub fn set_gc_hook<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.gc_hook.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(hook));
    }

    /// Run the given strategies in order
    ///
    /// Eviction listeners and the GC hook run after the internal lock is
    /// released, so they may call back into the manager.
    pub fn run_cleanup(&self, strategies: &[CleanupStrategy]) -> CleanupReport {
        let mut report = CleanupReport::default();
        let mut wants_gc = false;

        {
            let mut state = self.lock_state();
            for strategy in strategies {
                match *strategy {
                    CleanupStrategy::TrimPool => {
                        report.pool_bytes_released += state.pool.trim();
                    }
                    CleanupStrategy::EvictOlderThan(age) => {
                        let limit_ms = age.as_millis() as f64;
                        let stale: Vec<AllocationId> = state
                            .unpinned()
                            .filter(|(_, r)| self.clock.millis_since(r.last_used_at) > limit_ms)
                            .map(|(id, _)| *id)
                            .collect();
                        for id in stale {
                            state.evict(id, &mut report.evicted);
                        }
                    }
                    CleanupStrategy::EvictLargest { target_bytes } => {
                        let mut candidates: Vec<(AllocationId, u64)> = state
                            .unpinned()
                            .map(|(id, r)| (*id, r.size_bytes))
                            .collect();
                        candidates.sort_by(|a, b| b.1.cmp(&a.1));
                        let mut freed = 0u64;
                        for (id, size) in candidates {
                            if freed >= target_bytes {
                                break;
                            }
                            state.evict(id, &mut report.evicted);
                            freed += size;
                        }
                    }
                    CleanupStrategy::RequestGc => wants_gc = true,
                    CleanupStrategy::Emergency => {
                        report.pool_bytes_released += state.pool.trim();
                        let all: Vec<AllocationId> =
                            state.unpinned().map(|(id, _)| *id).collect();
                        for id in all {
                            state.evict(id, &mut report.evicted);
                        }
                    }
                }
            }
            state.cleanup_runs += 1;
        }

        if wants_gc {
            let hook = self
                .gc_hook
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            if let Some(hook) = hook {
                hook();
                report.gc_requested = true;
            }
        }

        for evicted in &report.evicted {
            self.evictions.notify(evicted);
        }

        if report.freed_bytes() > 0 {
            debug!(
                "Cleanup freed {} bytes ({} evictions)",
                report.freed_bytes(),
                report.evicted.len()
            );
        }
        report
    }

    /// Pressure-driven cleanup used by the timer
    pub fn cleanup(&self) -> CleanupReport {
        let age = CleanupStrategy::EvictOlderThan(self.config.max_allocation_age());
        match self.pressure() {
            MemoryPressure::Normal => CleanupReport::default(),
            MemoryPressure::Elevated => self.run_cleanup(&[CleanupStrategy::TrimPool, age]),
            MemoryPressure::Critical => {
                let mut report =
                    self.run_cleanup(&[CleanupStrategy::TrimPool, age, CleanupStrategy::RequestGc]);
                if self.pressure() == MemoryPressure::Critical {
                    let goal = (self.config.max_bytes as f64 * self.config.pressure_ratio) as u64;
                    let target_bytes = self.current_usage().saturating_sub(goal);
                    report.merge(self.run_cleanup(&[CleanupStrategy::EvictLargest { target_bytes }]));
                }
                report
            }
        }
    }

    /// Run [`MemoryManager::cleanup`] periodically until the manager is dropped
    pub fn spawn_auto_cleanup(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let period = self
            .config
            .auto_cleanup_interval()
            .max(Duration::from_millis(100));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                let report = manager.cleanup();
                if !report.evicted.is_empty() {
                    info!(
                        "Automatic cleanup evicted {} allocations ({} bytes)",
                        report.evicted.len(),
                        report.freed_bytes()
                    );
                }
            }
            debug!("Automatic memory cleanup stopped");
        })
    }

    pub fn stats(&self) -> MemoryStats {
        let state = self.lock_state();
        MemoryStats {
            live_bytes: state.live_bytes,
            pooled_bytes: state.pool.pooled_bytes(),
            max_bytes: self.config.max_bytes,
            peak_bytes: state.peak_bytes,
            allocations: state.records.len(),
            pinned: state.records.values().filter(|r| r.pinned).count(),
            pooled_buffers: state.pool.pooled_buffers(),
            pool_hits: state.pool.hits(),
            pool_misses: state.pool.misses(),
            cleanup_runs: state.cleanup_runs,
            pressure: self.pressure_for(state.usage()),
        }
    }

    /// Make room for `size` bytes, escalating through the strategies, and
    /// run `commit` under the same lock that confirmed the room
    fn reserve<T, F>(&self, size: u64, commit: F) -> Result<T, MemoryError>
    where
        F: FnOnce(&mut ManagerState) -> T,
    {
        let max = self.config.max_bytes;
        if size > max {
            return Err(MemoryError::Allocation {
                requested: size,
                available: max.saturating_sub(self.current_usage()),
            });
        }
        let mut commit = Some(commit);
        if let Some(done) = self.try_commit(size, &mut commit) {
            return Ok(done);
        }

        let escalation = [
            CleanupStrategy::TrimPool,
            CleanupStrategy::EvictOlderThan(self.config.max_allocation_age()),
        ];
        for strategy in escalation {
            self.run_cleanup(&[strategy]);
            if let Some(done) = self.try_commit(size, &mut commit) {
                return Ok(done);
            }
        }

        let target_bytes = (self.current_usage() + size).saturating_sub(max);
        self.run_cleanup(&[
            CleanupStrategy::EvictLargest { target_bytes },
            CleanupStrategy::RequestGc,
        ]);
        if let Some(done) = self.try_commit(size, &mut commit) {
            return Ok(done);
        }

        warn!(
            "Allocation of {} bytes still exceeds limit, running emergency cleanup",
            size
        );
        self.run_cleanup(&[CleanupStrategy::Emergency]);

        self.try_commit(size, &mut commit)
            .ok_or_else(|| MemoryError::Allocation {
                requested: size,
                available: max.saturating_sub(self.current_usage()),
            })
    }

    fn try_commit<T, F>(&self, size: u64, commit: &mut Option<F>) -> Option<T>
    where
        F: FnOnce(&mut ManagerState) -> T,
    {
        let mut state = self.lock_state();
        if state.usage() + size > self.config.max_bytes {
            return None;
        }
        commit.take().map(|f| f(&mut state))
    }

    fn lock_state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
