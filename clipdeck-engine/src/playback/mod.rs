//! Low-latency voice triggering over resident sample buffers

pub mod mixer;
pub mod scheduler;
pub mod voice;

pub use mixer::VoiceMixer;
pub use scheduler::PlaybackScheduler;
pub use voice::{validate_gain, validate_region, StopTarget, VoiceHandle};
