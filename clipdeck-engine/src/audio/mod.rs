//! Audio data types, decoding and waveform extraction

pub mod decoder;
pub mod types;
pub mod waveform;

pub use decoder::{AudioDecoder, SymphoniaDecoder};
pub use types::{BufferData, BufferKind, SampleBuffer};
pub use waveform::extract_peaks;
