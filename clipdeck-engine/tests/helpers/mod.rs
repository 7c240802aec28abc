//! Shared fixtures for clipdeck-engine integration tests
//!
//! - deterministic signal generators and WAV encoding
//! - a scripted fetcher that counts transfers and injects failures
//! - a decoder for raw little-endian f32 payloads
//! - a persistent store with artificial latency

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clipdeck_common::config::EngineConfig;
use clipdeck_common::events::{ErrorClass, ProgressEvent};
use clipdeck_common::{Clock, ManualClock};
use clipdeck_engine::acquisition::{FetchResponse, Fetcher, ProgressCallback};
use clipdeck_engine::audio::{AudioDecoder, SampleBuffer};
use clipdeck_engine::cache::{MemoryStore, PersistedRecord, PersistentStore, RecordMeta};
use clipdeck_engine::error::{AcquisitionError, DecodeError, StorageError};
use clipdeck_engine::{ClipdeckEngine, StoreBackend};
use futures::stream::{self, StreamExt};
use hound::{SampleFormat, WavSpec, WavWriter};
use std::f32::consts::PI;
use std::io::Cursor;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const TEST_SAMPLE_RATE: u32 = 44100;

/// Mono sine at `amplitude`
pub fn sine(frequency_hz: f32, seconds: f64, sample_rate: u32, amplitude: f32) -> Vec<f32> {
    let frames = (seconds * sample_rate as f64).round() as usize;
    (0..frames)
        .map(|i| amplitude * (2.0 * PI * frequency_hz * i as f32 / sample_rate as f32).sin())
        .collect()
}

pub fn sine_buffer(frequency_hz: f32, seconds: f64, sample_rate: u32) -> Arc<SampleBuffer> {
    Arc::new(SampleBuffer::mono(sine(frequency_hz, seconds, sample_rate, 0.5), sample_rate).unwrap())
}

/// 16-bit mono WAV file contents
pub fn wav_bytes(samples: &[f32], sample_rate: u32) -> Vec<u8> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut cursor, spec).unwrap();
        for sample in samples {
            writer
                .write_sample((sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
                .unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

/// Raw little-endian f32 payload understood by [`RawF32Decoder`]
pub fn raw_f32_bytes(samples: &[f32]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Decodes raw little-endian f32 mono at a fixed rate
pub struct RawF32Decoder {
    pub sample_rate: u32,
}

impl AudioDecoder for RawF32Decoder {
    fn decode(&self, encoded: Vec<u8>, _extension: Option<&str>) -> Result<SampleBuffer, DecodeError> {
        if encoded.len() % 4 != 0 {
            return Err(DecodeError::Malformed("length not a multiple of 4".into()));
        }
        let samples = encoded
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        SampleBuffer::mono(samples, self.sample_rate)
    }
}

/// Scripted fetcher: fails the first `failures` opens, then serves `payload`
pub struct MockFetcher {
    payload: Vec<u8>,
    chunk_size: usize,
    delay: Duration,
    failures: AtomicU32,
    failure_class: ErrorClass,
    announce_length: bool,
    calls: AtomicUsize,
}

impl MockFetcher {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            chunk_size: 4096,
            delay: Duration::ZERO,
            failures: AtomicU32::new(0),
            failure_class: ErrorClass::Network,
            announce_length: true,
            calls: AtomicUsize::new(0),
        }
    }

    /// Sleep before each open
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Serve the payload without a content length
    pub fn without_length(mut self) -> Self {
        self.announce_length = false;
        self
    }

    pub fn failing(mut self, failures: u32, class: ErrorClass) -> Self {
        self.failures = AtomicU32::new(failures);
        self.failure_class = class;
        self
    }

    /// Opens performed so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn open(&self, url: &str) -> Result<FetchResponse, AcquisitionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(match self.failure_class {
                ErrorClass::Server => AcquisitionError::from_status(503, format!("{} unavailable", url)),
                ErrorClass::NotFound => AcquisitionError::from_status(404, format!("{} not found", url)),
                class => AcquisitionError::new(class, format!("injected failure for {}", url)),
            });
        }

        let chunks: Vec<Result<Vec<u8>, AcquisitionError>> = self
            .payload
            .chunks(self.chunk_size)
            .map(|c| Ok(c.to_vec()))
            .collect();
        Ok(FetchResponse {
            content_length: self.announce_length.then_some(self.payload.len() as u64),
            content_type: Some("application/octet-stream".to_string()),
            chunks: stream::iter(chunks).boxed(),
        })
    }
}

/// MemoryStore whose loads take `delay`
pub struct SlowStore {
    inner: MemoryStore,
    delay: Duration,
}

impl SlowStore {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: MemoryStore::new(),
            delay,
        }
    }
}

#[async_trait]
impl PersistentStore for SlowStore {
    async fn load(&self, key: &str) -> Result<Option<PersistedRecord>, StorageError> {
        tokio::time::sleep(self.delay).await;
        self.inner.load(key).await
    }

    async fn save(&self, record: PersistedRecord) -> Result<(), StorageError> {
        self.inner.save(record).await
    }

    async fn touch(&self, key: &str, at: DateTime<Utc>) -> Result<(), StorageError> {
        self.inner.touch(key, at).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        self.inner.delete(key).await
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.inner.clear().await
    }

    async fn list(&self) -> Result<Vec<RecordMeta>, StorageError> {
        self.inner.list().await
    }

    fn name(&self) -> &'static str {
        "slow-memory"
    }
}

/// Defaults with millisecond retry delays
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.acquisition.base_retry_delay_ms = 1;
    config.acquisition.max_retry_delay_ms = 5;
    config
}

/// Engine with an in-memory persistent tier, a manual clock and no background loops
pub async fn test_engine(
    config: EngineConfig,
    fetcher: Arc<MockFetcher>,
    clock: Arc<ManualClock>,
) -> ClipdeckEngine {
    ClipdeckEngine::builder(config)
        .store(StoreBackend::InMemory)
        .clock(clock as Arc<dyn Clock>)
        .fetcher(fetcher)
        .decoder(Arc::new(RawF32Decoder {
            sample_rate: TEST_SAMPLE_RATE,
        }))
        .workers(2)
        .without_background_tasks()
        .build()
        .await
        .unwrap()
}

/// Progress callback that records every event
pub fn recording_callback() -> (ProgressCallback, Arc<Mutex<Vec<ProgressEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let callback: ProgressCallback = Arc::new(move |event: &ProgressEvent| {
        sink.lock().unwrap().push(event.clone());
    });
    (callback, events)
}
