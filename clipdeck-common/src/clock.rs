//! Wall-clock abstraction
//!
//! Every time-dependent policy in the engine (cache TTL, allocation age,
//! trigger debounce, frame timing) reads time through [`Clock`] so tests can
//! drive time explicitly with [`ManualClock`].

use chrono::{DateTime, Utc};
use std::fmt::Debug;
use std::sync::Mutex;
use std::time::Duration;

/// Source of the current time
pub trait Clock: Send + Sync + Debug {
    /// Current UTC time
    fn now(&self) -> DateTime<Utc>;

    /// Milliseconds elapsed since `earlier` (fractional, never negative)
    fn millis_since(&self, earlier: DateTime<Utc>) -> f64 {
        let delta = self.now() - earlier;
        match delta.num_microseconds() {
            Some(us) if us > 0 => us as f64 / 1000.0,
            Some(_) => 0.0,
            None => delta.num_milliseconds().max(0) as f64,
        }
    }
}

/// Clock backed by the system time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests and simulations
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Start at the current system time
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Start at a fixed instant
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let delta = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = *now + delta;
    }

    /// Move the clock forward by a number of milliseconds
    pub fn advance_ms(&self, ms: u64) {
        self.advance(Duration::from_millis(ms));
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}
