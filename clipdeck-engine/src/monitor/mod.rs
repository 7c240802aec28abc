//! Frame timing, memory trend and adaptive quality

pub mod performance;
pub mod quality;
pub mod window;

pub use performance::{MemoryProbe, PerformanceMonitor, PerformanceReport};
pub use quality::settings_for_level;
pub use window::{SlidingWindow, Trend};
