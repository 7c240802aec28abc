//! Cache entry types and the persisted record codec

use super::compression::{self, CompressedBuffer};
use super::store::PersistedRecord;
use crate::audio::{BufferKind, SampleBuffer};
use crate::error::StorageError;
use crate::source::SourceKey;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Cached sample data as stored in the memory tier
#[derive(Debug, Clone)]
pub enum StoredSamples {
    Raw(Arc<SampleBuffer>),
    Compressed(Arc<CompressedBuffer>),
}

impl StoredSamples {
    pub fn size_bytes(&self) -> u64 {
        match self {
            StoredSamples::Raw(b) => b.size_bytes(),
            StoredSamples::Compressed(c) => c.size_bytes(),
        }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, StoredSamples::Compressed(_))
    }

    pub fn kind(&self) -> BufferKind {
        match self {
            StoredSamples::Raw(_) => BufferKind::Float32,
            StoredSamples::Compressed(_) => BufferKind::Int16,
        }
    }

    /// Playable buffer; decompresses when needed
    pub fn to_buffer(&self) -> Result<Arc<SampleBuffer>, StorageError> {
        match self {
            StoredSamples::Raw(b) => Ok(Arc::clone(b)),
            StoredSamples::Compressed(c) => compression::decompress(c)
                .map(Arc::new)
                .map_err(|e| StorageError::Serialization(e.to_string())),
        }
    }

    fn sample_rate(&self) -> u32 {
        match self {
            StoredSamples::Raw(b) => b.sample_rate(),
            StoredSamples::Compressed(c) => c.sample_rate(),
        }
    }

    fn channel_count(&self) -> usize {
        match self {
            StoredSamples::Raw(b) => b.channel_count(),
            StoredSamples::Compressed(c) => c.channel_count(),
        }
    }

    fn duration(&self) -> f64 {
        match self {
            StoredSamples::Raw(b) => b.duration(),
            StoredSamples::Compressed(c) => c.duration(),
        }
    }
}

/// Entry returned by cache lookups
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: SourceKey,
    pub buffer: Arc<SampleBuffer>,
    /// Downsampled amplitude envelope
    pub waveform: Arc<Vec<f32>>,
    /// Stored footprint (sample data + waveform)
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    /// Stored quantized; `buffer` was decompressed on lookup
    pub compressed: bool,
}

/// Stored footprint of sample data plus waveform
pub fn entry_size(samples: &StoredSamples, waveform: &[f32]) -> u64 {
    samples.size_bytes() + (waveform.len() * std::mem::size_of::<f32>()) as u64
}

/// Build the persisted form of an entry
pub fn encode_record(
    key: &SourceKey,
    samples: &StoredSamples,
    waveform: &[f32],
    created_at: DateTime<Utc>,
    last_accessed_at: DateTime<Utc>,
) -> PersistedRecord {
    let serialized_buffer = match samples {
        StoredSamples::Raw(b) => b
            .channels()
            .iter()
            .flat_map(|c| c.iter().flat_map(|s| s.to_le_bytes()))
            .collect(),
        StoredSamples::Compressed(c) => c
            .channels()
            .iter()
            .flat_map(|ch| ch.iter().flat_map(|s| s.to_le_bytes()))
            .collect(),
    };

    PersistedRecord {
        id: Uuid::new_v4(),
        source_key: key.as_str().to_string(),
        encoding: samples.kind(),
        serialized_buffer,
        waveform: waveform.to_vec(),
        size_bytes: entry_size(samples, waveform),
        created_at,
        last_accessed_at,
        sample_rate: samples.sample_rate(),
        channel_count: samples.channel_count() as u16,
        duration_seconds: samples.duration(),
    }
}

/// Rebuild stored samples from a persisted record
///
/// # Errors
/// - `Serialization` if the byte layout does not match the header fields
pub fn decode_record(record: &PersistedRecord) -> Result<StoredSamples, StorageError> {
    let channel_count = record.channel_count as usize;
    let element = record.encoding.element_size();
    if channel_count == 0 || record.sample_rate == 0 {
        return Err(StorageError::Serialization(format!(
            "record {} has an empty header",
            record.source_key
        )));
    }
    let bytes = &record.serialized_buffer;
    if bytes.len() % (channel_count * element) != 0 {
        return Err(StorageError::Serialization(format!(
            "record {} has {} bytes, not a multiple of {} channels",
            record.source_key,
            bytes.len(),
            channel_count
        )));
    }
    let frames = bytes.len() / (channel_count * element);
    let channel_bytes = frames * element;

    let malformed = |e: crate::error::DecodeError| StorageError::Serialization(e.to_string());

    match record.encoding {
        BufferKind::Float32 => {
            let channels = bytes
                .chunks_exact(channel_bytes.max(1))
                .take(channel_count)
                .map(|ch| {
                    ch.chunks_exact(4)
                        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                        .collect()
                })
                .collect();
            let buffer = SampleBuffer::new(pad_channels(channels, channel_count), record.sample_rate)
                .map_err(malformed)?;
            Ok(StoredSamples::Raw(Arc::new(buffer)))
        }
        BufferKind::Int16 => {
            let channels = bytes
                .chunks_exact(channel_bytes.max(1))
                .take(channel_count)
                .map(|ch| {
                    ch.chunks_exact(2)
                        .map(|b| i16::from_le_bytes([b[0], b[1]]))
                        .collect()
                })
                .collect();
            let compressed =
                CompressedBuffer::from_parts(pad_channels(channels, channel_count), record.sample_rate)
                    .map_err(malformed)?;
            Ok(StoredSamples::Compressed(Arc::new(compressed)))
        }
        BufferKind::Bytes => Err(StorageError::Serialization(format!(
            "record {} has unsupported encoding {}",
            record.source_key,
            record.encoding.as_str()
        ))),
    }
}

/// Zero-frame records produce no chunks; keep the channel count intact
fn pad_channels<T>(mut channels: Vec<Vec<T>>, count: usize) -> Vec<Vec<T>> {
    while channels.len() < count {
        channels.push(Vec::new());
    }
    channels
}
