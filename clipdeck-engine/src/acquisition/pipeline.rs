//! Acquisition pipeline: cache check → fetch → decode → waveform → store
//!
//! **Progress bands:**
//! - `downloading` 0-70 (byte-level when the length is known)
//! - `processing` 70-90 (decode on the blocking pool)
//! - `generating_waveform` 90-100 (analysis worker pool)
//! - `ready` 100, also sent immediately on a cache hit
//!
//! **De-duplication:** one task per source key. A second `begin` for a key
//! already in flight attaches to the running task and receives its result
//! and subsequent progress. The in-flight entry is removed only after the
//! result has been written to the cache, so a later caller either attaches
//! or hits the cache.
//!
//! **Cancellation:** the token is checked at every chunk boundary and
//! between stages. Cancelling aborts the transfer for every attached caller
//! and returns the staging buffer to the memory manager.

use super::fetcher::{open_local, FetchResponse, Fetcher};
use super::retry::{RetryMachine, RetryPolicy, RetryState};
use crate::analysis::WorkerPool;
use crate::audio::{extract_peaks, AudioDecoder, BufferKind, SampleBuffer};
use crate::cache::PersistentCache;
use crate::error::AcquisitionError;
use crate::memory::{AllocationId, BufferAllocation, DeallocateOptions, MemoryManager};
use crate::monitor::PerformanceMonitor;
use crate::source::{AcquireSource, FetchTarget, ResolvedSource, SourceKey};
use clipdeck_common::config::AcquisitionConfig;
use clipdeck_common::events::{AcquisitionStatus, ErrorClass, ProgressEvent};
use clipdeck_common::{ObserverRegistry, Subscription};
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const DOWNLOAD_BAND_END: u8 = 70;
const DECODE_BAND_END: u8 = 90;
const DEFAULT_WAVEFORM_POINTS: usize = 2000;

/// Progress listener passed to `begin`/`acquire`
pub type ProgressCallback = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

type SharedResult = Shared<BoxFuture<'static, Result<AcquiredAudio, AcquisitionError>>>;

/// Decoded source ready for playback
#[derive(Debug, Clone)]
pub struct AcquiredAudio {
    pub key: SourceKey,
    pub buffer: Arc<SampleBuffer>,
    pub waveform: Arc<Vec<f32>>,
    /// Served from the cache without fetching
    pub from_cache: bool,
}

struct InFlight {
    result: SharedResult,
    cancel: CancellationToken,
    progress: ObserverRegistry<ProgressEvent>,
}

/// Handle to a running (or attached) acquisition
pub struct AcquisitionTicket {
    key: SourceKey,
    result: SharedResult,
    cancel: CancellationToken,
    attached: bool,
    _progress: Option<Subscription>,
}

impl AcquisitionTicket {
    pub fn key(&self) -> &SourceKey {
        &self.key
    }

    /// True if this ticket joined an acquisition started by another caller
    pub fn attached(&self) -> bool {
        self.attached
    }

    /// Cancel the acquisition for every attached caller
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(self) -> Result<AcquiredAudio, AcquisitionError> {
        self.result.await
    }
}

impl std::fmt::Debug for AcquisitionTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionTicket")
            .field("key", &self.key)
            .field("attached", &self.attached)
            .finish_non_exhaustive()
    }
}

struct PipelineInner {
    config: AcquisitionConfig,
    cache: Arc<PersistentCache>,
    memory: Arc<MemoryManager>,
    fetcher: Arc<dyn Fetcher>,
    decoder: Arc<dyn AudioDecoder>,
    workers: Arc<WorkerPool>,
    monitor: Option<Arc<PerformanceMonitor>>,
    limiter: Arc<Semaphore>,
    in_flight: Mutex<HashMap<SourceKey, InFlight>>,
}

/// Turns sources into resident sample buffers
#[derive(Clone)]
pub struct AcquisitionPipeline {
    inner: Arc<PipelineInner>,
}

impl AcquisitionPipeline {
    pub fn new(
        config: AcquisitionConfig,
        cache: Arc<PersistentCache>,
        memory: Arc<MemoryManager>,
        fetcher: Arc<dyn Fetcher>,
        decoder: Arc<dyn AudioDecoder>,
        workers: Arc<WorkerPool>,
    ) -> Self {
        let permits = config.max_concurrent.max(1);
        Self {
            inner: Arc::new(PipelineInner {
                config,
                cache,
                memory,
                fetcher,
                decoder,
                workers,
                monitor: None,
                limiter: Arc::new(Semaphore::new(permits)),
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Take waveform resolution and compression from the monitor's settings
    ///
    /// Must be called before the pipeline is cloned or used.
    pub fn with_monitor(mut self, monitor: Arc<PerformanceMonitor>) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.monitor = Some(monitor),
            None => warn!("Pipeline already shared; performance monitor not attached"),
        }
        self
    }

    /// Start (or attach to) an acquisition without waiting for it
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    /// - `Validation` for malformed URLs, before any I/O
    pub fn begin(
        &self,
        source: &AcquireSource,
        on_progress: Option<ProgressCallback>,
    ) -> Result<AcquisitionTicket, AcquisitionError> {
        let resolved = source.resolve(&self.inner.config.audio_endpoint)?;
        let key = resolved.key.clone();

        let mut in_flight = self.inner.lock_in_flight();
        if let Some(existing) = in_flight.get(&key) {
            debug!("Attaching to in-flight acquisition of {}", key);
            let subscription = on_progress.map(|cb| existing.progress.subscribe_arc(cb));
            return Ok(AcquisitionTicket {
                key,
                result: existing.result.clone(),
                cancel: existing.cancel.clone(),
                attached: true,
                _progress: subscription,
            });
        }

        let cancel = CancellationToken::new();
        let progress = ObserverRegistry::new();
        let subscription = on_progress.map(|cb| progress.subscribe_arc(cb));

        let task = tokio::spawn(Arc::clone(&self.inner).run(
            resolved,
            cancel.clone(),
            progress.clone(),
        ));
        let task_key = key.clone();
        let result: SharedResult = async move {
            task.await.unwrap_or_else(|e| {
                error!("Acquisition task for {} failed: {}", task_key, e);
                Err(AcquisitionError::internal(e.to_string()))
            })
        }
        .boxed()
        .shared();

        in_flight.insert(
            key.clone(),
            InFlight {
                result: result.clone(),
                cancel: cancel.clone(),
                progress,
            },
        );

        Ok(AcquisitionTicket {
            key,
            result,
            cancel,
            attached: false,
            _progress: subscription,
        })
    }

    /// Acquire a source, reporting progress to `on_progress`
    ///
    /// # Errors
    /// Classified [`AcquisitionError`] with the attempt count attached.
    pub async fn acquire(
        &self,
        source: &AcquireSource,
        on_progress: Option<ProgressCallback>,
    ) -> Result<AcquiredAudio, AcquisitionError> {
        self.begin(source, on_progress)?.wait().await
    }

    /// Cancel the in-flight acquisition of `key`; returns false if none
    pub fn cancel(&self, key: &SourceKey) -> bool {
        match self.inner.lock_in_flight().get(key) {
            Some(entry) => {
                info!("Cancelling acquisition of {}", key);
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_in_flight(&self, key: &SourceKey) -> bool {
        self.inner.lock_in_flight().contains_key(key)
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.lock_in_flight().len()
    }
}

impl PipelineInner {
    async fn run(
        self: Arc<Self>,
        resolved: ResolvedSource,
        cancel: CancellationToken,
        progress: ObserverRegistry<ProgressEvent>,
    ) -> Result<AcquiredAudio, AcquisitionError> {
        let key = resolved.key.clone();
        let reporter = Reporter::new(progress);

        let result = self.execute(&resolved, &cancel, &reporter).await;
        match &result {
            Ok(audio) => {
                info!(
                    "Acquired {} ({:.2}s, {} ch, cached={})",
                    key,
                    audio.buffer.duration(),
                    audio.buffer.channel_count(),
                    audio.from_cache
                );
                reporter.emit(ProgressEvent::ready(key.as_str()));
            }
            Err(e) if e.is_cancelled() => {
                info!("Acquisition of {} cancelled", key);
                reporter.emit(ProgressEvent::failed(
                    key.as_str(),
                    reporter.last(),
                    e.message.clone(),
                    e.class,
                ));
            }
            Err(e) => {
                warn!("Acquisition of {} failed: {}", key, e);
                reporter.emit(ProgressEvent::failed(
                    key.as_str(),
                    reporter.last(),
                    e.message.clone(),
                    e.class,
                ));
            }
        }

        self.lock_in_flight().remove(&key);
        result
    }

    async fn execute(
        &self,
        resolved: &ResolvedSource,
        cancel: &CancellationToken,
        reporter: &Reporter,
    ) -> Result<AcquiredAudio, AcquisitionError> {
        let key = &resolved.key;

        if let Some(entry) = self.cache.get(key).await {
            debug!("Cache hit for {}", key);
            return Ok(AcquiredAudio {
                key: key.clone(),
                buffer: entry.buffer,
                waveform: entry.waveform,
                from_cache: true,
            });
        }

        if resolved.target == FetchTarget::CacheOnly {
            return Err(AcquisitionError::not_found(format!(
                "{} is not cached and has no fetchable location",
                key
            )));
        }

        let _permit = tokio::select! {
            _ = cancel.cancelled() => return Err(AcquisitionError::cancelled()),
            permit = Arc::clone(&self.limiter).acquire_owned() => permit
                .map_err(|e| AcquisitionError::internal(e.to_string()))?,
        };

        let mut machine = RetryMachine::new(RetryPolicy::from_config(&self.config));
        loop {
            let attempt = machine.attempt();
            match self.attempt(resolved, attempt, cancel, reporter).await {
                Ok(audio) => {
                    machine.record_success();
                    return Ok(audio);
                }
                Err(e) if e.is_cancelled() => return Err(e.with_attempts(attempt)),
                Err(e) => match machine.record_failure(e.class) {
                    RetryState::Waiting { attempt, delay } => {
                        warn!(
                            "Attempt {} for {} failed ({}), retrying in {:?}",
                            attempt, key, e, delay
                        );
                        reporter.emit(
                            ProgressEvent::new(key.as_str(), AcquisitionStatus::Retrying, 0)
                                .with_attempt(attempt + 1),
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                return Err(AcquisitionError::cancelled().with_attempts(attempt));
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                        machine.resume();
                    }
                    _ => return Err(e.with_attempts(attempt)),
                },
            }
        }
    }

    async fn attempt(
        &self,
        resolved: &ResolvedSource,
        attempt: u32,
        cancel: &CancellationToken,
        reporter: &Reporter,
    ) -> Result<AcquiredAudio, AcquisitionError> {
        let key = &resolved.key;
        reporter.emit(
            ProgressEvent::new(key.as_str(), AcquisitionStatus::Downloading, 0).with_attempt(attempt),
        );

        let encoded = self.download(resolved, cancel, reporter, attempt).await?;

        reporter.emit(
            ProgressEvent::new(key.as_str(), AcquisitionStatus::Processing, DOWNLOAD_BAND_END)
                .with_attempt(attempt),
        );
        let decoder = Arc::clone(&self.decoder);
        let extension = resolved.extension.clone();
        let decode = tokio::task::spawn_blocking(move || decoder.decode(encoded, extension.as_deref()));
        let buffer = tokio::select! {
            _ = cancel.cancelled() => return Err(AcquisitionError::cancelled()),
            joined = decode => joined.map_err(|e| AcquisitionError::internal(e.to_string()))??,
        };
        let buffer = Arc::new(buffer);
        debug!(
            "Decoded {}: {} frames @ {} Hz",
            key,
            buffer.len(),
            buffer.sample_rate()
        );

        reporter.emit(
            ProgressEvent::new(key.as_str(), AcquisitionStatus::GeneratingWaveform, DECODE_BAND_END)
                .with_attempt(attempt),
        );
        let waveform = self.waveform(key, &buffer, cancel).await?;

        if cancel.is_cancelled() {
            return Err(AcquisitionError::cancelled());
        }

        let compress = self.cache.compression_enabled()
            || self
                .monitor
                .as_ref()
                .is_some_and(|m| m.adaptive_settings().cache_compression);
        if let Err(e) = self
            .cache
            .put_with(key, Arc::clone(&buffer), waveform.clone(), compress)
            .await
        {
            warn!("Could not cache {}: {}", key, e);
        }

        Ok(AcquiredAudio {
            key: key.clone(),
            buffer,
            waveform: Arc::new(waveform),
            from_cache: false,
        })
    }

    async fn download(
        &self,
        resolved: &ResolvedSource,
        cancel: &CancellationToken,
        reporter: &Reporter,
        attempt: u32,
    ) -> Result<Vec<u8>, AcquisitionError> {
        let open = async {
            match &resolved.target {
                FetchTarget::Http { url } => self.fetcher.open(url).await,
                FetchTarget::LocalFile(path) => open_local(path, self.config.chunk_size_bytes).await,
                FetchTarget::CacheOnly => Err(AcquisitionError::not_found("no fetch target")),
            }
        };
        let FetchResponse {
            content_length,
            mut chunks,
            ..
        } = tokio::select! {
            _ = cancel.cancelled() => return Err(AcquisitionError::cancelled()),
            opened = open => opened?,
        };

        let capacity = content_length
            .map(|len| len as usize)
            .unwrap_or(self.config.chunk_size_bytes);
        let source_tag = format!("source:{}", resolved.key);
        let mut staging = StagingBuffer::new(
            Arc::clone(&self.memory),
            capacity,
            self.config.chunk_size_bytes,
            &["acquisition", source_tag.as_str()],
        )?;

        let mut received: u64 = 0;
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Transfer of {} cancelled after {} bytes", resolved.key, received);
                    return Err(AcquisitionError::cancelled());
                }
                next = chunks.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk?;
            received += chunk.len() as u64;
            staging.extend(&chunk)?;

            if let Some(total) = content_length.filter(|t| *t > 0) {
                let pct = (received.min(total) * DOWNLOAD_BAND_END as u64 / total) as u8;
                reporter.emit_if_advanced(
                    ProgressEvent::new(resolved.key.as_str(), AcquisitionStatus::Downloading, pct)
                        .with_attempt(attempt),
                );
            }
        }

        if received == 0 {
            return Err(AcquisitionError::new(
                ErrorClass::Decode,
                format!("{} returned no data", resolved.key),
            ));
        }
        debug!("Downloaded {} bytes for {}", received, resolved.key);
        Ok(staging.into_bytes())
    }

    async fn waveform(
        &self,
        key: &SourceKey,
        buffer: &Arc<SampleBuffer>,
        cancel: &CancellationToken,
    ) -> Result<Vec<f32>, AcquisitionError> {
        let points = self
            .monitor
            .as_ref()
            .map(|m| m.adaptive_settings().waveform_points)
            .unwrap_or(DEFAULT_WAVEFORM_POINTS);
        let for_task = Arc::clone(buffer);
        let handle = match self
            .workers
            .submit("waveform", move || extract_peaks(&for_task, points))
        {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Waveform for {} skipped: {}", key, e);
                return Ok(Vec::new());
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(AcquisitionError::cancelled()),
            joined = handle.join() => Ok(joined.unwrap_or_else(|e| {
                warn!("Waveform for {} unavailable: {}", key, e);
                Vec::new()
            })),
        }
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<SourceKey, InFlight>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Pinned download buffer returned to the pool if the transfer is abandoned
///
/// Bytes beyond the initial capacity are accounted with the memory manager
/// in steps of at least `growth_step`, so an unannounced length is bound by
/// the same limit as an announced one.
struct StagingBuffer {
    memory: Arc<MemoryManager>,
    allocation: Option<BufferAllocation>,
    growth: Vec<AllocationId>,
    accounted: u64,
    growth_step: u64,
    tags: Vec<String>,
}

impl StagingBuffer {
    fn new(
        memory: Arc<MemoryManager>,
        capacity: usize,
        growth_step: usize,
        tags: &[&str],
    ) -> Result<Self, AcquisitionError> {
        let mut allocation = memory.allocate(capacity, BufferKind::Bytes, tags)?;
        // Pin so cleanup triggered by other work cannot account it away mid-transfer
        if let Err(e) = memory.pin(allocation.id()) {
            memory.deallocate(allocation, DeallocateOptions::default());
            return Err(e.into());
        }
        if let Some(bytes) = allocation.data.as_bytes_mut() {
            bytes.clear();
        }
        Ok(Self {
            memory,
            accounted: allocation.size_bytes(),
            allocation: Some(allocation),
            growth: Vec::new(),
            growth_step: growth_step.max(1) as u64,
            tags: tags.iter().map(|t| t.to_string()).collect(),
        })
    }

    fn extend(&mut self, chunk: &[u8]) -> Result<(), AcquisitionError> {
        let Some(bytes) = self
            .allocation
            .as_mut()
            .and_then(|a| a.data.as_bytes_mut())
        else {
            return Ok(());
        };

        let needed = (bytes.len() + chunk.len()) as u64;
        if needed > self.accounted {
            let step = (needed - self.accounted).max(self.growth_step);
            let tags: Vec<&str> = self.tags.iter().map(String::as_str).collect();
            let id = self.memory.track(step, BufferKind::Bytes, &tags)?;
            self.growth.push(id);
            self.memory.pin(id)?;
            self.accounted += step;
        }
        bytes.extend_from_slice(chunk);
        Ok(())
    }

    fn release_growth(&mut self) {
        for id in self.growth.drain(..) {
            self.memory.release(id);
        }
    }

    /// Hand the bytes to the decoder and release the accounting
    fn into_bytes(mut self) -> Vec<u8> {
        self.release_growth();
        let Some(mut allocation) = self.allocation.take() else {
            return Vec::new();
        };
        let bytes = allocation
            .data
            .as_bytes_mut()
            .map(std::mem::take)
            .unwrap_or_default();
        self.memory
            .deallocate(allocation, DeallocateOptions::default());
        bytes
    }
}

impl Drop for StagingBuffer {
    fn drop(&mut self) {
        self.release_growth();
        if let Some(allocation) = self.allocation.take() {
            debug!("Releasing partial download ({} bytes)", self.accounted);
            self.memory.deallocate(allocation, DeallocateOptions::pooled());
        }
    }
}

/// Fans progress out to attached callers, suppressing repeats
struct Reporter {
    observers: ObserverRegistry<ProgressEvent>,
    last: Mutex<Option<(AcquisitionStatus, u8)>>,
}

impl Reporter {
    fn new(observers: ObserverRegistry<ProgressEvent>) -> Self {
        Self {
            observers,
            last: Mutex::new(None),
        }
    }

    fn emit(&self, event: ProgressEvent) {
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Some((event.status, event.progress));
        self.observers.notify(&event);
    }

    /// Emit only when status or percentage changed
    fn emit_if_advanced(&self, event: ProgressEvent) {
        let unchanged = *self.last.lock().unwrap_or_else(|e| e.into_inner())
            == Some((event.status, event.progress));
        if !unchanged {
            self.emit(event);
        }
    }

    fn last(&self) -> u8 {
        self.last
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map(|(_, p)| p)
            .unwrap_or(0)
    }
}
