//! # Clipdeck Engine Library (clipdeck-engine)
//!
//! Audio acquisition, caching and low-latency playback for clip-based
//! performance tools.
//!
//! **Purpose:** Fetch audio from URLs or local files, decode it once, keep
//! the decoded samples in a quota-bounded two-tier cache, and trigger
//! sample-accurate voices from resident buffers without suspending.
//!
//! **Components:**
//! - [`acquisition`]: download/decode pipeline with retry and de-duplication
//! - [`cache`]: memory + persistent sample cache with TTL and LRU eviction
//! - [`memory`]: allocation accounting, buffer pooling and cleanup strategies
//! - [`monitor`]: frame timing and adaptive quality levels
//! - [`playback`]: trigger/jump/stop scheduling over a voice mixer
//! - [`analysis`]: zero-crossing cut points and the analysis worker pool
//!
//! [`engine::ClipdeckEngine`] wires them together from one configuration.

pub mod acquisition;
pub mod analysis;
pub mod audio;
pub mod cache;
pub mod engine;
pub mod error;
pub mod memory;
pub mod monitor;
pub mod playback;
pub mod source;

pub use engine::{ClipdeckEngine, EngineBuilder, StoreBackend};
pub use error::{Error, Result};
pub use source::{AcquireSource, SourceKey};

/// Build identification embedded by build.rs
pub mod build_info {
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
    pub const GIT_HASH: &str = env!("CLIPDECK_GIT_HASH");
    pub const BUILD_TIMESTAMP: &str = env!("CLIPDECK_BUILD_TIMESTAMP");
    pub const BUILD_PROFILE: &str = env!("CLIPDECK_BUILD_PROFILE");
}
