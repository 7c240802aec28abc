//! # Clipdeck Common Library
//!
//! Shared code for the clipdeck engine and its consumers:
//! - Configuration loading (TOML file, environment, compiled defaults)
//! - UI-facing event types (acquisition progress, voice lifecycle, quality)
//! - Observer registry for callback-style notification
//! - Clock abstraction so time-dependent logic is testable

pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod observer;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use observer::{ObserverRegistry, Subscription};
