//! Engine assembly
//!
//! Builds every component from one [`EngineConfig`] and wires the
//! cross-component links: the performance monitor samples the memory
//! manager, quality changes toggle adaptive cache compression, and the pipeline
//! reads waveform resolution from the active quality settings.

use crate::acquisition::{AcquisitionPipeline, Fetcher, HttpFetcher};
use crate::analysis::{WorkerPool, ZeroCrossingDetector};
use crate::audio::{AudioDecoder, SymphoniaDecoder};
use crate::cache::{MemoryStore, PersistentCache, PersistentStore, SqliteStore};
use crate::error::Result;
use crate::memory::MemoryManager;
use crate::monitor::PerformanceMonitor;
use crate::playback::PlaybackScheduler;
use clipdeck_common::config::EngineConfig;
use clipdeck_common::{Clock, Subscription, SystemClock};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Persistent tier backend selection
#[derive(Debug, Clone, PartialEq)]
pub enum StoreBackend {
    /// SQLite database; `None` uses the configured or platform default path
    Sqlite(Option<PathBuf>),
    /// Process-local map, lost on exit
    InMemory,
    /// Memory tier only
    Disabled,
}

pub struct EngineBuilder {
    config: EngineConfig,
    clock: Option<Arc<dyn Clock>>,
    backend: StoreBackend,
    fetcher: Option<Arc<dyn Fetcher>>,
    decoder: Option<Arc<dyn AudioDecoder>>,
    workers: Option<usize>,
    background_tasks: bool,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            clock: None,
            backend: StoreBackend::Sqlite(None),
            fetcher: None,
            decoder: None,
            workers: None,
            background_tasks: true,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn store(mut self, backend: StoreBackend) -> Self {
        self.backend = backend;
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn decoder(mut self, decoder: Arc<dyn AudioDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    /// Analysis thread count (default: available parallelism, 1..=4)
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Skip the periodic memory cleanup and quality evaluation loops
    pub fn without_background_tasks(mut self) -> Self {
        self.background_tasks = false;
        self
    }

    /// Construct and wire every component
    ///
    /// An unavailable SQLite database is not fatal: the cache starts
    /// memory-only and logs a warning.
    ///
    /// # Errors
    /// - Invalid configuration
    /// - HTTP client construction failure
    pub async fn build(self) -> Result<ClipdeckEngine> {
        self.config.validate()?;
        let config = self.config;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let memory = Arc::new(MemoryManager::new(config.memory.clone(), Arc::clone(&clock)));
        let store = open_store(&self.backend, &config).await;
        let cache = Arc::new(PersistentCache::new(
            config.cache.clone(),
            Arc::clone(&memory),
            store,
            Arc::clone(&clock),
        ));

        let workers = Arc::new(match self.workers {
            Some(n) => WorkerPool::new(n),
            None => WorkerPool::with_default_size(),
        });

        let monitor = Arc::new(PerformanceMonitor::new(
            config.performance.clone(),
            Arc::clone(&clock),
        ));
        monitor.set_memory_probe(memory.clone());
        cache.set_adaptive_compression(monitor.adaptive_settings().cache_compression);
        let cache_for_quality = Arc::downgrade(&cache);
        let quality_subscription = monitor.on_quality_change(move |change| {
            if let Some(cache) = cache_for_quality.upgrade() {
                cache.set_adaptive_compression(change.settings.cache_compression);
            }
        });

        let fetcher: Arc<dyn Fetcher> = match self.fetcher {
            Some(f) => f,
            None => Arc::new(HttpFetcher::new(config.acquisition.request_timeout())?),
        };
        let decoder: Arc<dyn AudioDecoder> = self
            .decoder
            .unwrap_or_else(|| Arc::new(SymphoniaDecoder::new()));

        let pipeline = AcquisitionPipeline::new(
            config.acquisition.clone(),
            Arc::clone(&cache),
            Arc::clone(&memory),
            fetcher,
            decoder,
            Arc::clone(&workers),
        )
        .with_monitor(Arc::clone(&monitor));

        let scheduler = PlaybackScheduler::new(
            config.playback.clone(),
            Arc::clone(&cache),
            Arc::clone(&clock),
        );
        let zero_crossing = ZeroCrossingDetector::new(config.zero_crossing.clone());

        let mut background = Vec::new();
        if self.background_tasks {
            background.push(memory.spawn_auto_cleanup());
            background.push(monitor.spawn_evaluation_loop());
        }

        info!(
            "Engine ready: {} analysis workers, persistent tier {}",
            workers.stats().workers,
            if cache.is_degraded() { "off" } else { "on" }
        );

        Ok(ClipdeckEngine {
            config,
            clock,
            memory,
            cache,
            workers,
            monitor,
            pipeline,
            scheduler,
            zero_crossing,
            _quality_subscription: quality_subscription,
            background,
        })
    }
}

async fn open_store(backend: &StoreBackend, config: &EngineConfig) -> Option<Arc<dyn PersistentStore>> {
    match backend {
        StoreBackend::Disabled => None,
        StoreBackend::InMemory => Some(Arc::new(MemoryStore::new())),
        StoreBackend::Sqlite(path) => {
            let path = path
                .clone()
                .unwrap_or_else(|| config.cache.resolved_database_path());
            match SqliteStore::open(&path).await {
                Ok(store) => Some(Arc::new(store)),
                Err(e) => {
                    warn!(
                        "Cache database {} unavailable, running memory-only: {}",
                        path.display(),
                        e
                    );
                    None
                }
            }
        }
    }
}

/// Fully wired engine owning every component
pub struct ClipdeckEngine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    memory: Arc<MemoryManager>,
    cache: Arc<PersistentCache>,
    workers: Arc<WorkerPool>,
    monitor: Arc<PerformanceMonitor>,
    pipeline: AcquisitionPipeline,
    scheduler: PlaybackScheduler,
    zero_crossing: ZeroCrossingDetector,
    _quality_subscription: Subscription,
    background: Vec<JoinHandle<()>>,
}

impl ClipdeckEngine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    pub fn cache(&self) -> &Arc<PersistentCache> {
        &self.cache
    }

    pub fn workers(&self) -> &Arc<WorkerPool> {
        &self.workers
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    pub fn pipeline(&self) -> &AcquisitionPipeline {
        &self.pipeline
    }

    pub fn scheduler(&self) -> &PlaybackScheduler {
        &self.scheduler
    }

    pub fn zero_crossing(&self) -> &ZeroCrossingDetector {
        &self.zero_crossing
    }

    /// Stop background loops and analysis threads
    pub fn shutdown(&mut self) {
        for task in self.background.drain(..) {
            task.abort();
        }
        self.workers.shutdown();
        info!("Engine shut down");
    }
}

impl Drop for ClipdeckEngine {
    fn drop(&mut self) {
        for task in self.background.drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clipdeck_common::ManualClock;

    #[tokio::test]
    async fn test_build_memory_only() {
        let engine = ClipdeckEngine::builder(EngineConfig::default())
            .store(StoreBackend::Disabled)
            .clock(Arc::new(ManualClock::new()))
            .workers(1)
            .without_background_tasks()
            .build()
            .await
            .unwrap();

        assert!(!engine.cache().compression_enabled());
        assert_eq!(engine.pipeline().in_flight_count(), 0);
        assert_eq!(engine.scheduler().active_voice_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = EngineConfig::default();
        config.acquisition.retry_attempts = 0;
        let result = ClipdeckEngine::builder(config)
            .store(StoreBackend::Disabled)
            .without_background_tasks()
            .build()
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_emergency_quality_enables_compression() {
        let clock = Arc::new(ManualClock::new());
        let engine = ClipdeckEngine::builder(EngineConfig::default())
            .store(StoreBackend::InMemory)
            .clock(clock.clone())
            .workers(1)
            .without_background_tasks()
            .build()
            .await
            .unwrap();

        // Three simultaneous breaches: slow frames twice plus memory near the limit
        engine.monitor().record_memory(95, 100);
        for _ in 0..3 {
            engine.monitor().frame_render_start();
            clock.advance_ms(200);
            engine.monitor().frame_render_end();
        }

        assert!(engine.monitor().report().emergency);
        assert_eq!(
            engine.monitor().level(),
            engine.config().performance.max_degradation_level
        );
        assert!(engine.cache().compression_enabled());
    }

    #[tokio::test]
    async fn test_recovery_keeps_requested_compression() {
        let clock = Arc::new(ManualClock::new());
        let engine = ClipdeckEngine::builder(EngineConfig::default())
            .store(StoreBackend::Disabled)
            .clock(clock.clone())
            .workers(1)
            .without_background_tasks()
            .build()
            .await
            .unwrap();
        engine.cache().set_compression(true);

        engine.monitor().record_memory(95, 100);
        for _ in 0..3 {
            engine.monitor().frame_render_start();
            clock.advance_ms(200);
            engine.monitor().frame_render_end();
        }
        assert!(engine.monitor().level() > 0);

        // Back to full quality: adaptive compression off, requested compression kept
        engine.monitor().reset();
        assert_eq!(engine.monitor().level(), 0);
        assert!(!engine.monitor().adaptive_settings().cache_compression);
        assert!(engine.cache().compression_enabled());

        engine.cache().set_compression(false);
        assert!(!engine.cache().compression_enabled());
    }
}
