//! Retry/backoff state machine
//!
//! ```text
//! Attempting(1) ──fail (retryable)──> Waiting{1, d1} ──resume──> Attempting(2) ...
//!       │                                                             │
//!       └──success──> Succeeded                 fail (final) ──> Failed
//! ```
//!
//! The machine never sleeps; the caller waits out `Waiting::delay` with
//! whatever timer it has, which keeps the policy testable without time passing.

use clipdeck_common::config::AcquisitionConfig;
use clipdeck_common::events::ErrorClass;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

/// Exponential backoff with bounded attempts and proportional jitter
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Jitter as a fraction of the nominal delay (0.25 = ±25%)
    pub jitter_ratio: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &AcquisitionConfig) -> Self {
        Self {
            max_attempts: config.retry_attempts.max(1),
            base_delay: config.base_retry_delay(),
            max_delay: config.max_retry_delay(),
            jitter_ratio: config.retry_jitter_ratio.clamp(0.0, 1.0),
        }
    }

    /// Delay before the attempt following `attempt`, without jitter
    ///
    /// `base * 2^(attempt-1)`, capped at `max_delay`.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 2u32.saturating_pow(exponent);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Nominal delay scaled by `1 + jitter_ratio * jitter`, `jitter` in [-1, 1]
    pub fn delay_for(&self, attempt: u32, jitter: f64) -> Duration {
        let nominal = self.nominal_delay(attempt).as_secs_f64();
        let scaled = nominal * (1.0 + self.jitter_ratio * jitter.clamp(-1.0, 1.0));
        Duration::from_secs_f64(scaled.max(0.0)).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&AcquisitionConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    /// Attempt `n` (1-based) is running
    Attempting(u32),
    /// Attempt failed retryably; wait `delay` then `resume`
    Waiting { attempt: u32, delay: Duration },
    Succeeded { attempts: u32 },
    Failed { attempts: u32, class: ErrorClass },
}

impl RetryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RetryState::Succeeded { .. } | RetryState::Failed { .. })
    }
}

/// Drives one operation through its attempts
#[derive(Debug)]
pub struct RetryMachine {
    policy: RetryPolicy,
    state: RetryState,
    rng: StdRng,
}

impl RetryMachine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_rng(policy, StdRng::from_entropy())
    }

    /// Deterministic jitter for tests
    pub fn with_seed(policy: RetryPolicy, seed: u64) -> Self {
        Self::with_rng(policy, StdRng::seed_from_u64(seed))
    }

    fn with_rng(policy: RetryPolicy, rng: StdRng) -> Self {
        Self {
            policy,
            state: RetryState::Attempting(1),
            rng,
        }
    }

    pub fn state(&self) -> RetryState {
        self.state
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Current or most recent attempt number
    pub fn attempt(&self) -> u32 {
        match self.state {
            RetryState::Attempting(n) => n,
            RetryState::Waiting { attempt, .. } => attempt,
            RetryState::Succeeded { attempts } | RetryState::Failed { attempts, .. } => attempts,
        }
    }

    pub fn record_success(&mut self) -> RetryState {
        if let RetryState::Attempting(n) = self.state {
            self.state = RetryState::Succeeded { attempts: n };
        }
        self.state
    }

    /// Non-retryable classes and the final attempt move to `Failed`
    pub fn record_failure(&mut self, class: ErrorClass) -> RetryState {
        if let RetryState::Attempting(n) = self.state {
            self.state = if class.is_retryable() && n < self.policy.max_attempts {
                let jitter = self.rng.gen_range(-1.0..=1.0);
                RetryState::Waiting {
                    attempt: n,
                    delay: self.policy.delay_for(n, jitter),
                }
            } else {
                RetryState::Failed { attempts: n, class }
            };
        }
        self.state
    }

    /// Leave `Waiting` and start the next attempt
    pub fn resume(&mut self) -> RetryState {
        if let RetryState::Waiting { attempt, .. } = self.state {
            self.state = RetryState::Attempting(attempt + 1);
        }
        self.state
    }
}
