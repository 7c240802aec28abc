//! Memory manager integration tests: cleanup strategies never touch pinned
//! allocations, and the cache follows memory-manager evictions

mod helpers;

use clipdeck_common::config::{CacheConfig, MemoryConfig};
use clipdeck_common::{Clock, ManualClock};
use clipdeck_engine::audio::BufferKind;
use clipdeck_engine::cache::PersistentCache;
use clipdeck_engine::memory::{CleanupStrategy, DeallocateOptions, MemoryManager, MemoryPressure};
use clipdeck_engine::SourceKey;
use helpers::*;
use std::sync::Arc;
use std::time::Duration;

fn manager(max_bytes: u64) -> (Arc<MemoryManager>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    let config = MemoryConfig {
        max_bytes,
        ..MemoryConfig::default()
    };
    (Arc::new(MemoryManager::new(config, clock.clone())), clock)
}

#[test]
fn test_pinned_allocations_survive_every_strategy_combination() {
    let strategies = [
        CleanupStrategy::TrimPool,
        CleanupStrategy::EvictOlderThan(Duration::ZERO),
        CleanupStrategy::EvictLargest { target_bytes: u64::MAX },
        CleanupStrategy::RequestGc,
        CleanupStrategy::Emergency,
    ];

    // Every non-empty subset, in order
    for mask in 1u32..(1 << strategies.len()) {
        let (mm, clock) = manager(1_000_000);
        let pinned: Vec<_> = (0..3)
            .map(|i| {
                let alloc = mm.allocate(100 * (i + 1), BufferKind::Float32, &["pinned"]).unwrap();
                mm.pin(alloc.id()).unwrap();
                alloc
            })
            .collect();
        for _ in 0..3 {
            let alloc = mm.allocate(1000, BufferKind::Float32, &["loose"]).unwrap();
            mm.deallocate(alloc, DeallocateOptions::pooled());
        }
        let tracked = mm.track(50_000, BufferKind::Float32, &["loose"]).unwrap();
        clock.advance_ms(60_000);

        let chosen: Vec<CleanupStrategy> = strategies
            .iter()
            .enumerate()
            .filter(|(i, _)| mask & (1 << i) != 0)
            .map(|(_, s)| *s)
            .collect();
        let report = mm.run_cleanup(&chosen);

        for alloc in &pinned {
            assert!(mm.contains(alloc.id()), "pinned evicted by {:?}", chosen);
            assert!(mm.is_pinned(alloc.id()));
        }
        assert!(report.evicted.iter().all(|e| !e.tags.contains("pinned")));
        if chosen.iter().any(|s| !matches!(s, CleanupStrategy::TrimPool | CleanupStrategy::RequestGc)) {
            assert!(!mm.contains(tracked));
        }
    }
}

#[test]
fn test_allocation_under_pressure_evicts_unpinned_only() {
    let (mm, _) = manager(10_000);
    let keep = mm.track(4_000, BufferKind::Float32, &[]).unwrap();
    mm.pin(keep).unwrap();
    let loose = mm.track(4_000, BufferKind::Float32, &[]).unwrap();

    let alloc = mm.allocate(1_000, BufferKind::Float32, &[]).unwrap();
    assert_eq!(alloc.size_bytes(), 4_000);
    assert!(mm.contains(keep));
    assert!(!mm.contains(loose));
}

#[test]
fn test_allocation_fails_when_pinned_memory_fills_budget() {
    let (mm, _) = manager(10_000);
    let keep = mm.track(9_000, BufferKind::Float32, &[]).unwrap();
    mm.pin(keep).unwrap();

    assert!(mm.allocate(1_000, BufferKind::Float32, &[]).is_err());
    assert!(mm.contains(keep));
}

#[test]
fn test_pressure_levels() {
    let (mm, _) = manager(1_000);
    assert_eq!(mm.pressure(), MemoryPressure::Normal);
    let id = mm.track(850, BufferKind::Bytes, &[]).unwrap();
    assert_ne!(mm.pressure(), MemoryPressure::Normal);
    mm.release(id);
    assert_eq!(mm.pressure(), MemoryPressure::Normal);
}

#[tokio::test]
async fn test_cache_drops_entries_evicted_by_memory_manager() {
    let (mm, clock) = manager(1_000_000);
    let clock: Arc<dyn Clock> = clock;
    let cache = PersistentCache::new(CacheConfig::default(), Arc::clone(&mm), None, clock);

    let pinned = SourceKey::parse("url:pinned").unwrap();
    let loose = SourceKey::parse("url:loose").unwrap();
    cache.put(&pinned, sine_buffer(440.0, 0.1, 8000), vec![]).await.unwrap();
    cache.put(&loose, sine_buffer(440.0, 0.1, 8000), vec![]).await.unwrap();
    assert!(cache.pin(&pinned));

    mm.run_cleanup(&[CleanupStrategy::Emergency]);

    assert!(cache.is_resident(&pinned));
    assert!(!cache.is_resident(&loose));
    assert!(cache.unpin(&pinned));
}
