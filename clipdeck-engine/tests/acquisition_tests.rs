//! Acquisition pipeline integration tests
//!
//! Cover in-flight de-duplication, retry/backoff, failure classification,
//! cancellation and cache short-circuiting through a scripted fetcher.

mod helpers;

use clipdeck_common::events::{AcquisitionStatus, ErrorClass};
use clipdeck_common::ManualClock;
use clipdeck_engine::acquisition::AcquisitionPipeline;
use clipdeck_engine::{AcquireSource, SourceKey};
use helpers::*;
use std::sync::Arc;
use std::time::Duration;

const URL: &str = "https://cdn.example.com/audio/loop.raw";

fn payload() -> Vec<u8> {
    raw_f32_bytes(&sine(440.0, 0.5, TEST_SAMPLE_RATE, 0.5))
}

fn source() -> AcquireSource {
    AcquireSource::Url(URL.to_string())
}

#[tokio::test]
async fn test_concurrent_acquisitions_share_one_fetch() {
    let fetcher = Arc::new(MockFetcher::new(payload()).with_delay(Duration::from_millis(50)));
    let engine = test_engine(test_config(), fetcher.clone(), Arc::new(ManualClock::new())).await;
    let pipeline: AcquisitionPipeline = engine.pipeline().clone();

    let tasks: Vec<_> = (0..5)
        .map(|_| {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.acquire(&source(), None).await })
        })
        .collect();

    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await.unwrap().unwrap());
    }

    assert_eq!(fetcher.calls(), 1);
    assert_eq!(results.len(), 5);
    for audio in &results[1..] {
        assert!(Arc::ptr_eq(&audio.buffer, &results[0].buffer));
    }
    assert_eq!(pipeline.in_flight_count(), 0);
}

#[tokio::test]
async fn test_second_caller_attaches_to_in_flight() {
    let fetcher = Arc::new(MockFetcher::new(payload()).with_delay(Duration::from_millis(50)));
    let engine = test_engine(test_config(), fetcher.clone(), Arc::new(ManualClock::new())).await;

    let (callback, events) = recording_callback();
    let first = engine.pipeline().begin(&source(), None).unwrap();
    let second = engine.pipeline().begin(&source(), Some(callback)).unwrap();
    assert!(!first.attached());
    assert!(second.attached());
    assert!(engine.pipeline().is_in_flight(first.key()));

    first.wait().await.unwrap();
    second.wait().await.unwrap();
    assert_eq!(fetcher.calls(), 1);

    let events = events.lock().unwrap();
    assert_eq!(events.last().unwrap().status, AcquisitionStatus::Ready);
    assert_eq!(events.last().unwrap().progress, 100);
}

#[tokio::test]
async fn test_retryable_failures_are_retried() {
    let fetcher = Arc::new(MockFetcher::new(payload()).failing(2, ErrorClass::Server));
    let engine = test_engine(test_config(), fetcher.clone(), Arc::new(ManualClock::new())).await;

    let (callback, events) = recording_callback();
    let audio = engine.pipeline().acquire(&source(), Some(callback)).await.unwrap();

    assert_eq!(fetcher.calls(), 3);
    assert!(!audio.from_cache);

    let events = events.lock().unwrap();
    let retry_attempts: Vec<u32> = events
        .iter()
        .filter(|e| e.status == AcquisitionStatus::Retrying)
        .filter_map(|e| e.attempt)
        .collect();
    assert_eq!(retry_attempts, vec![2, 3]);
    assert_eq!(events.last().unwrap().status, AcquisitionStatus::Ready);
}

#[tokio::test]
async fn test_retries_exhausted_reports_attempts() {
    let fetcher = Arc::new(MockFetcher::new(payload()).failing(10, ErrorClass::Network));
    let engine = test_engine(test_config(), fetcher.clone(), Arc::new(ManualClock::new())).await;

    let err = engine.pipeline().acquire(&source(), None).await.unwrap_err();
    assert_eq!(err.class, ErrorClass::Network);
    assert_eq!(err.attempts, 3);
    assert_eq!(fetcher.calls(), 3);
}

#[tokio::test]
async fn test_not_found_is_not_retried() {
    let fetcher = Arc::new(MockFetcher::new(payload()).failing(1, ErrorClass::NotFound));
    let engine = test_engine(test_config(), fetcher.clone(), Arc::new(ManualClock::new())).await;

    let (callback, events) = recording_callback();
    let err = engine.pipeline().acquire(&source(), Some(callback)).await.unwrap_err();

    assert_eq!(err.class, ErrorClass::NotFound);
    assert_eq!(err.attempts, 1);
    assert_eq!(err.status, Some(404));
    assert_eq!(fetcher.calls(), 1);

    let events = events.lock().unwrap();
    let last = events.last().unwrap();
    assert_eq!(last.status, AcquisitionStatus::Error);
    assert_eq!(last.error.as_ref().unwrap().classification, ErrorClass::NotFound);
}

/// 10 s of 44.1 kHz f32 samples: 1,764,000 bytes
fn large_payload() -> Vec<u8> {
    raw_f32_bytes(&sine(440.0, 10.0, TEST_SAMPLE_RATE, 0.5))
}

fn one_mib_config() -> clipdeck_common::config::EngineConfig {
    let mut config = test_config();
    config.memory.max_bytes = 1024 * 1024;
    config
}

#[tokio::test]
async fn test_announced_download_over_memory_limit_fails() {
    let fetcher = Arc::new(MockFetcher::new(large_payload()));
    let engine = test_engine(one_mib_config(), fetcher.clone(), Arc::new(ManualClock::new())).await;

    let err = engine.pipeline().acquire(&source(), None).await.unwrap_err();
    assert_eq!(err.class, ErrorClass::Allocation);
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(engine.memory().current_usage(), 0);
}

#[tokio::test]
async fn test_unannounced_download_over_memory_limit_fails() {
    let fetcher = Arc::new(MockFetcher::new(large_payload()).without_length());
    let engine = test_engine(one_mib_config(), fetcher.clone(), Arc::new(ManualClock::new())).await;

    let err = engine.pipeline().acquire(&source(), None).await.unwrap_err();
    assert_eq!(err.class, ErrorClass::Allocation);
    let stats = engine.memory().stats();
    assert!(stats.peak_bytes <= 1024 * 1024);
    assert_eq!(stats.live_bytes, 0);
    assert_eq!(stats.pinned, 0);
}

#[tokio::test]
async fn test_unannounced_download_is_fully_accounted() {
    let bytes = payload();
    let fetcher = Arc::new(MockFetcher::new(bytes.clone()).without_length());
    let engine = test_engine(test_config(), fetcher, Arc::new(ManualClock::new())).await;

    let (callback, events) = recording_callback();
    engine.pipeline().acquire(&source(), Some(callback)).await.unwrap();

    let stats = engine.memory().stats();
    assert!(stats.peak_bytes >= bytes.len() as u64);
    // Staging released; only the unpinned cache entry remains
    assert_eq!(stats.pinned, 0);
    assert_eq!(stats.allocations, 1);
    assert_eq!(events.lock().unwrap().last().unwrap().status, AcquisitionStatus::Ready);
}

#[tokio::test]
async fn test_decode_failure_is_not_retried() {
    // 3 bytes cannot be raw f32 samples
    let fetcher = Arc::new(MockFetcher::new(vec![1, 2, 3]));
    let engine = test_engine(test_config(), fetcher.clone(), Arc::new(ManualClock::new())).await;

    let err = engine.pipeline().acquire(&source(), None).await.unwrap_err();
    assert_eq!(err.class, ErrorClass::Decode);
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn test_malformed_url_fails_without_network() {
    let fetcher = Arc::new(MockFetcher::new(payload()));
    let engine = test_engine(test_config(), fetcher.clone(), Arc::new(ManualClock::new())).await;

    let err = engine
        .pipeline()
        .acquire(&AcquireSource::Url("ftp://example.com/a.mp3".into()), None)
        .await
        .unwrap_err();
    assert_eq!(err.class, ErrorClass::Validation);
    assert_eq!(fetcher.calls(), 0);
}

#[tokio::test]
async fn test_cancel_stops_in_flight_acquisition() {
    let fetcher = Arc::new(MockFetcher::new(payload()).with_delay(Duration::from_secs(30)));
    let engine = test_engine(test_config(), fetcher.clone(), Arc::new(ManualClock::new())).await;

    let ticket = engine.pipeline().begin(&source(), None).unwrap();
    let key = ticket.key().clone();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(engine.pipeline().cancel(&key));

    let err = tokio::time::timeout(Duration::from_secs(5), ticket.wait())
        .await
        .expect("cancellation should resolve promptly")
        .unwrap_err();
    assert_eq!(err.class, ErrorClass::Cancelled);
    assert!(!engine.cache().is_resident(&key));
}

#[tokio::test]
async fn test_cached_source_is_ready_immediately() {
    let fetcher = Arc::new(MockFetcher::new(payload()));
    let engine = test_engine(test_config(), fetcher.clone(), Arc::new(ManualClock::new())).await;

    let first = engine.pipeline().acquire(&source(), None).await.unwrap();
    assert!(!first.from_cache);

    let (callback, events) = recording_callback();
    let second = engine.pipeline().acquire(&source(), Some(callback)).await.unwrap();
    assert!(second.from_cache);
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(second.buffer.len(), first.buffer.len());

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, AcquisitionStatus::Ready);
    assert_eq!(events[0].progress, 100);
}

#[tokio::test]
async fn test_progress_is_banded_and_monotonic() {
    let fetcher = Arc::new(MockFetcher::new(payload()));
    let engine = test_engine(test_config(), fetcher, Arc::new(ManualClock::new())).await;

    let (callback, events) = recording_callback();
    let audio = engine.pipeline().acquire(&source(), Some(callback)).await.unwrap();
    assert!(!audio.waveform.is_empty());

    let events = events.lock().unwrap();
    let progress: Vec<u8> = events.iter().map(|e| e.progress).collect();
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{:?}", progress);

    for event in events.iter() {
        match event.status {
            AcquisitionStatus::Downloading => assert!(event.progress <= 70),
            AcquisitionStatus::Processing => assert!((70..=90).contains(&event.progress)),
            AcquisitionStatus::GeneratingWaveform => assert!(event.progress >= 90),
            _ => {}
        }
    }
    assert!(events.iter().any(|e| e.status == AcquisitionStatus::Processing));
    assert!(events.iter().any(|e| e.status == AcquisitionStatus::GeneratingWaveform));
}

#[tokio::test]
async fn test_bare_key_without_cache_is_not_found() {
    let fetcher = Arc::new(MockFetcher::new(payload()));
    let engine = test_engine(test_config(), fetcher.clone(), Arc::new(ManualClock::new())).await;

    let key = SourceKey::parse("url:0123456789abcdef").unwrap();
    let err = engine
        .pipeline()
        .acquire(&AcquireSource::Key(key), None)
        .await
        .unwrap_err();
    assert_eq!(err.class, ErrorClass::NotFound);
    assert_eq!(fetcher.calls(), 0);
}

#[tokio::test]
async fn test_local_wav_file_decodes_with_symphonia() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tone.wav");
    std::fs::write(&path, wav_bytes(&sine(220.0, 1.0, TEST_SAMPLE_RATE, 0.5), TEST_SAMPLE_RATE)).unwrap();

    let engine = clipdeck_engine::ClipdeckEngine::builder(test_config())
        .store(clipdeck_engine::StoreBackend::Disabled)
        .workers(1)
        .without_background_tasks()
        .build()
        .await
        .unwrap();

    let audio = engine
        .pipeline()
        .acquire(&AcquireSource::LocalFile(path), None)
        .await
        .unwrap();
    assert!(audio.key.as_str().starts_with("file:"));
    assert_eq!(audio.buffer.sample_rate(), TEST_SAMPLE_RATE);
    assert!((audio.buffer.duration() - 1.0).abs() < 0.01);
}
