//! Audio decoder using symphonia
//!
//! Decodes an in-memory encoded payload (MP3, AAC/M4A, FLAC, Vorbis, WAV)
//! to planar f32 PCM at the source's native sample rate.

use super::types::SampleBuffer;
use crate::error::DecodeError;
use std::io::Cursor;
use symphonia::core::audio::SampleBuffer as InterleavedScratch;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, warn};

/// Turns encoded bytes into PCM
///
/// Runs on a blocking thread; implementations must not touch async state.
pub trait AudioDecoder: Send + Sync {
    /// Decode a complete payload
    ///
    /// `extension` is a container hint such as `"mp3"` or `"m4a"`.
    fn decode(&self, encoded: Vec<u8>, extension: Option<&str>)
        -> Result<SampleBuffer, DecodeError>;
}

/// Symphonia-backed decoder
#[derive(Debug, Default, Clone, Copy)]
pub struct SymphoniaDecoder;

impl SymphoniaDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl AudioDecoder for SymphoniaDecoder {
    fn decode(
        &self,
        encoded: Vec<u8>,
        extension: Option<&str>,
    ) -> Result<SampleBuffer, DecodeError> {
        if encoded.is_empty() {
            return Err(DecodeError::Empty);
        }
        debug!("Decoding {} encoded bytes", encoded.len());

        let mss = MediaSourceStream::new(Box::new(Cursor::new(encoded)), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = extension {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| DecodeError::UnsupportedFormat(format!("probe failed: {}", e)))?;

        let mut format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or(DecodeError::NoAudioTrack)?;

        let track_id = track.id;
        let sample_rate = track
            .codec_params
            .sample_rate
            .ok_or_else(|| DecodeError::Malformed("sample rate not found".to_string()))?;

        let mut decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| DecodeError::UnsupportedFormat(format!("no decoder: {}", e)))?;

        let mut channels: Vec<Vec<f32>> = Vec::new();

        loop {
            let packet = match format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    break;
                }
                Err(SymphoniaError::ResetRequired) => break,
                Err(e) => {
                    warn!("Error reading packet: {}", e);
                    break;
                }
            };

            if packet.track_id() != track_id {
                continue;
            }

            let decoded = match decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::DecodeError(e)) => {
                    // Corrupt packet; skip it and keep going
                    warn!("Skipping undecodable packet: {}", e);
                    continue;
                }
                Err(e) => return Err(DecodeError::Malformed(e.to_string())),
            };

            let spec = *decoded.spec();
            let frames = decoded.frames();
            if frames == 0 {
                continue;
            }
            let channel_count = spec.channels.count();
            if channels.is_empty() {
                channels = vec![Vec::new(); channel_count];
            } else if channels.len() != channel_count {
                return Err(DecodeError::Malformed(format!(
                    "channel count changed mid-stream ({} -> {})",
                    channels.len(),
                    channel_count
                )));
            }

            let mut scratch = InterleavedScratch::<f32>::new(decoded.capacity() as u64, spec);
            scratch.copy_planar_ref(decoded);
            let planar = scratch.samples();
            for (ch, out) in channels.iter_mut().enumerate() {
                out.extend_from_slice(&planar[ch * frames..(ch + 1) * frames]);
            }
        }

        if channels.is_empty() || channels[0].is_empty() {
            return Err(DecodeError::Empty);
        }

        debug!(
            "Decoded {} frames x {} channels at {} Hz",
            channels[0].len(),
            channels.len(),
            sample_rate
        );

        SampleBuffer::new(channels, sample_rate)
    }
}
