//! Voice handles and trigger validation

use crate::error::ValidationError;
use crate::source::SourceKey;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Caller-side view of an active voice
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VoiceHandle {
    pub id: Uuid,
    pub source_key: SourceKey,
    /// Region start in seconds
    pub start_time: f64,
    /// Region end in seconds
    pub end_time: f64,
    pub gain: f32,
    pub started_at: DateTime<Utc>,
    /// Pad that triggered the voice, if any
    pub pad: Option<u32>,
}

impl VoiceHandle {
    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }
}

/// What `stop` applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopTarget {
    Voice(Uuid),
    All,
}

impl From<&VoiceHandle> for StopTarget {
    fn from(handle: &VoiceHandle) -> Self {
        StopTarget::Voice(handle.id)
    }
}

/// Check a region against a buffer of `duration` seconds
///
/// # Errors
/// - start is negative or past the end of the buffer
/// - end is past the end of the buffer or not after start
pub fn validate_region(start: f64, end: f64, duration: f64) -> Result<(), ValidationError> {
    if !start.is_finite() || !end.is_finite() {
        return Err(ValidationError::new(format!(
            "time range must be finite (start={}, end={})",
            start, end
        )));
    }
    if start < 0.0 {
        return Err(ValidationError::new(format!("start {} is negative", start)));
    }
    if start > duration || end > duration {
        return Err(ValidationError::new(format!(
            "range {:.3}-{:.3}s exceeds buffer duration {:.3}s",
            start, end, duration
        )));
    }
    if end <= start {
        return Err(ValidationError::new(format!(
            "end {} must be after start {}",
            end, start
        )));
    }
    Ok(())
}

pub fn validate_gain(gain: f32) -> Result<(), ValidationError> {
    if !gain.is_finite() || gain < 0.0 {
        return Err(ValidationError::new(format!("invalid gain {}", gain)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_region() {
        assert!(validate_region(0.0, 5.0, 5.0).is_ok());
        assert!(validate_region(1.5, 2.0, 5.0).is_ok());
    }

    #[test]
    fn test_invalid_regions() {
        assert!(validate_region(-1.0, 5.0, 10.0).is_err());
        assert!(validate_region(10.0, 5.0, 20.0).is_err());
        assert!(validate_region(2.0, 2.0, 5.0).is_err());
        assert!(validate_region(1.0, 6.0, 5.0).is_err());
        assert!(validate_region(6.0, 7.0, 5.0).is_err());
        assert!(validate_region(f64::NAN, 1.0, 5.0).is_err());
    }

    #[test]
    fn test_gain() {
        assert!(validate_gain(0.0).is_ok());
        assert!(validate_gain(1.5).is_ok());
        assert!(validate_gain(-0.1).is_err());
        assert!(validate_gain(f32::INFINITY).is_err());
    }
}
