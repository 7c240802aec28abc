//! Core audio data types
//!
//! [`SampleBuffer`] is the decoded form of a source: planar f32 channels at
//! the source's native sample rate. Buffers are shared read-only through
//! `Arc<SampleBuffer>` between the cache and playing voices.
//!
//! [`BufferData`] is the raw storage handed out by the memory manager. Its
//! [`BufferKind`] determines element size and pool bucket.

use crate::error::DecodeError;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// Element type of a managed buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferKind {
    /// Decoded PCM samples
    Float32,
    /// Quantized PCM (compressed cache entries)
    Int16,
    /// Encoded bytes (download staging)
    Bytes,
}

impl BufferKind {
    pub fn element_size(&self) -> usize {
        match self {
            BufferKind::Float32 => 4,
            BufferKind::Int16 => 2,
            BufferKind::Bytes => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BufferKind::Float32 => "float32",
            BufferKind::Int16 => "int16",
            BufferKind::Bytes => "bytes",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "float32" => Some(BufferKind::Float32),
            "int16" => Some(BufferKind::Int16),
            "bytes" => Some(BufferKind::Bytes),
            _ => None,
        }
    }
}

/// Raw storage for a managed allocation
#[derive(Debug, Clone, PartialEq)]
pub enum BufferData {
    Float32(Vec<f32>),
    Int16(Vec<i16>),
    Bytes(Vec<u8>),
}

impl BufferData {
    /// Zero-filled storage of `len` elements
    pub fn zeroed(kind: BufferKind, len: usize) -> Self {
        match kind {
            BufferKind::Float32 => BufferData::Float32(vec![0.0; len]),
            BufferKind::Int16 => BufferData::Int16(vec![0; len]),
            BufferKind::Bytes => BufferData::Bytes(vec![0; len]),
        }
    }

    pub fn kind(&self) -> BufferKind {
        match self {
            BufferData::Float32(_) => BufferKind::Float32,
            BufferData::Int16(_) => BufferKind::Int16,
            BufferData::Bytes(_) => BufferKind::Bytes,
        }
    }

    /// Element count
    pub fn len(&self) -> usize {
        match self {
            BufferData::Float32(v) => v.len(),
            BufferData::Int16(v) => v.len(),
            BufferData::Bytes(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn size_bytes(&self) -> u64 {
        (self.len() * self.kind().element_size()) as u64
    }

    /// Overwrite every element with zero, keeping the length
    pub fn fill_zero(&mut self) {
        match self {
            BufferData::Float32(v) => v.iter_mut().for_each(|s| *s = 0.0),
            BufferData::Int16(v) => v.iter_mut().for_each(|s| *s = 0),
            BufferData::Bytes(v) => v.iter_mut().for_each(|s| *s = 0),
        }
    }

    pub fn as_bytes_mut(&mut self) -> Option<&mut Vec<u8>> {
        match self {
            BufferData::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_int16_mut(&mut self) -> Option<&mut Vec<i16>> {
        match self {
            BufferData::Int16(v) => Some(v),
            _ => None,
        }
    }
}

/// Decoded PCM audio
///
/// **Format:**
/// - Planar: one `Vec<f32>` per channel, all of equal length
/// - Samples nominally in [-1.0, 1.0]
/// - Native sample rate of the source (no resampling)
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBuffer {
    channels: Vec<Vec<f32>>,
    sample_rate: u32,
}

impl SampleBuffer {
    /// Build a buffer from planar channels
    ///
    /// # Errors
    /// - No channels, zero sample rate, or channels of unequal length
    pub fn new(channels: Vec<Vec<f32>>, sample_rate: u32) -> Result<Self, DecodeError> {
        if channels.is_empty() {
            return Err(DecodeError::Malformed("buffer has no channels".to_string()));
        }
        if sample_rate == 0 {
            return Err(DecodeError::Malformed("sample rate is zero".to_string()));
        }
        let frames = channels[0].len();
        if channels.iter().any(|c| c.len() != frames) {
            return Err(DecodeError::Malformed(
                "channels have different lengths".to_string(),
            ));
        }
        Ok(Self {
            channels,
            sample_rate,
        })
    }

    /// Single-channel buffer
    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Result<Self, DecodeError> {
        Self::new(vec![samples], sample_rate)
    }

    /// De-interleave `[L, R, L, R, ...]` style input
    pub fn from_interleaved(
        samples: &[f32],
        channel_count: usize,
        sample_rate: u32,
    ) -> Result<Self, DecodeError> {
        if channel_count == 0 || samples.len() % channel_count != 0 {
            return Err(DecodeError::Malformed(format!(
                "{} samples cannot be split into {} channels",
                samples.len(),
                channel_count
            )));
        }
        let frames = samples.len() / channel_count;
        let mut channels = vec![Vec::with_capacity(frames); channel_count];
        for frame in samples.chunks_exact(channel_count) {
            for (ch, sample) in frame.iter().enumerate() {
                channels[ch].push(*sample);
            }
        }
        Self::new(channels, sample_rate)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn channel(&self, index: usize) -> Option<&[f32]> {
        self.channels.get(index).map(|c| c.as_slice())
    }

    pub fn channels(&self) -> &[Vec<f32>] {
        &self.channels
    }

    /// Frames per channel
    pub fn len(&self) -> usize {
        self.channels[0].len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Duration in seconds
    pub fn duration(&self) -> f64 {
        self.len() as f64 / self.sample_rate as f64
    }

    /// In-memory footprint of the sample data
    pub fn size_bytes(&self) -> u64 {
        (self.len() * self.channel_count() * std::mem::size_of::<f32>()) as u64
    }

    /// Nearest frame index for a time in seconds, clamped to the buffer
    pub fn frame_at(&self, seconds: f64) -> usize {
        if seconds <= 0.0 || self.is_empty() {
            return 0;
        }
        let frame = (seconds * self.sample_rate as f64).round() as usize;
        frame.min(self.len() - 1)
    }

    pub fn time_of(&self, frame: usize) -> f64 {
        frame as f64 / self.sample_rate as f64
    }

    /// Mono signal for analysis: channel 0 as-is for mono buffers, the
    /// channel average otherwise
    pub fn mono_mix(&self) -> Cow<'_, [f32]> {
        if self.channels.len() == 1 {
            return Cow::Borrowed(&self.channels[0]);
        }
        let scale = 1.0 / self.channels.len() as f32;
        let mixed = (0..self.len())
            .map(|i| self.channels.iter().map(|c| c[i]).sum::<f32>() * scale)
            .collect();
        Cow::Owned(mixed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_unequal_channels() {
        let result = SampleBuffer::new(vec![vec![0.0; 10], vec![0.0; 9]], 44100);
        assert!(matches!(result, Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_from_interleaved() {
        let buffer = SampleBuffer::from_interleaved(&[0.1, -0.1, 0.2, -0.2], 2, 8000).unwrap();
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.channel(0).unwrap(), &[0.1, 0.2]);
        assert_eq!(buffer.channel(1).unwrap(), &[-0.1, -0.2]);
    }

    #[test]
    fn test_duration_and_size() {
        let buffer = SampleBuffer::new(vec![vec![0.0; 44100], vec![0.0; 44100]], 44100).unwrap();
        assert_eq!(buffer.duration(), 1.0);
        assert_eq!(buffer.size_bytes(), 44100 * 2 * 4);
    }

    #[test]
    fn test_frame_at_rounds_and_clamps() {
        let buffer = SampleBuffer::mono(vec![0.0; 100], 100).unwrap();
        assert_eq!(buffer.frame_at(0.504), 50);
        assert_eq!(buffer.frame_at(0.506), 51);
        assert_eq!(buffer.frame_at(-1.0), 0);
        assert_eq!(buffer.frame_at(5.0), 99);
    }

    #[test]
    fn test_mono_mix_averages_channels() {
        let buffer = SampleBuffer::new(vec![vec![1.0, 0.0], vec![0.0, -1.0]], 8000).unwrap();
        assert_eq!(buffer.mono_mix().as_ref(), &[0.5, -0.5]);
    }

    #[test]
    fn test_buffer_data_zeroing() {
        let mut data = BufferData::Int16(vec![3, 4, 5]);
        data.fill_zero();
        assert_eq!(data, BufferData::zeroed(BufferKind::Int16, 3));
        assert_eq!(data.size_bytes(), 6);
    }
}
