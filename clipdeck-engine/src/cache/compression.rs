//! Int16 quantization for compressed cache entries
//!
//! Halves the footprint of decoded audio at a quantization error below
//! 1/32767 of full scale, which is inaudible for trigger playback.

use crate::audio::SampleBuffer;
use crate::error::DecodeError;

/// Quantized planar PCM
#[derive(Debug, Clone, PartialEq)]
pub struct CompressedBuffer {
    channels: Vec<Vec<i16>>,
    sample_rate: u32,
}

impl CompressedBuffer {
    pub fn from_parts(channels: Vec<Vec<i16>>, sample_rate: u32) -> Result<Self, DecodeError> {
        if channels.is_empty() || sample_rate == 0 {
            return Err(DecodeError::Malformed(
                "compressed buffer needs channels and a sample rate".to_string(),
            ));
        }
        let frames = channels[0].len();
        if channels.iter().any(|c| c.len() != frames) {
            return Err(DecodeError::Malformed(
                "compressed channels have different lengths".to_string(),
            ));
        }
        Ok(Self {
            channels,
            sample_rate,
        })
    }

    pub fn channels(&self) -> &[Vec<i16>] {
        &self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn frames(&self) -> usize {
        self.channels[0].len()
    }

    pub fn duration(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    pub fn size_bytes(&self) -> u64 {
        (self.frames() * self.channel_count() * std::mem::size_of::<i16>()) as u64
    }
}

pub fn compress(buffer: &SampleBuffer) -> CompressedBuffer {
    let channels = buffer
        .channels()
        .iter()
        .map(|c| c.iter().map(|s| quantize(*s)).collect())
        .collect();
    CompressedBuffer {
        channels,
        sample_rate: buffer.sample_rate(),
    }
}

pub fn decompress(compressed: &CompressedBuffer) -> Result<SampleBuffer, DecodeError> {
    let channels = compressed
        .channels
        .iter()
        .map(|c| c.iter().map(|s| *s as f32 / i16::MAX as f32).collect())
        .collect();
    SampleBuffer::new(channels, compressed.sample_rate)
}

/// Bytes saved relative to the f32 original
pub fn bytes_saved(original_bytes: u64, compressed: &CompressedBuffer) -> u64 {
    original_bytes.saturating_sub(compressed.size_bytes())
}

fn quantize(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16
}
