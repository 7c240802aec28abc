//! Non-real-time analysis: cut-point detection and the worker pool that
//! runs CPU-heavy advisory jobs

pub mod worker_pool;
pub mod zero_crossing;

pub use worker_pool::{TaskHandle, WorkerPool, WorkerPoolStats};
pub use zero_crossing::{BufferIdentity, CutPoints, CutQuality, ZeroCrossing, ZeroCrossingDetector};
