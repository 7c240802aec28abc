//! Event types shared with UI consumers
//!
//! Three event families leave the engine:
//! - [`ProgressEvent`]: acquisition progress, delivered through callbacks
//! - [`VoiceEvent`]: voice lifecycle, delivered through a broadcast stream
//! - [`QualityChange`] / [`PerformanceWarning`]: adaptive quality updates
//!
//! Both serialize to JSON with a `type`/`status` discriminator so they can be
//! forwarded to a renderer unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Acquisition status reported in progress callbacks
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionStatus {
    /// Transferring encoded bytes (0-70%)
    Downloading,
    /// Decoding to PCM (70-90%)
    Processing,
    /// Building the amplitude envelope (90-100%)
    GeneratingWaveform,
    /// Buffer resident and playable
    Ready,
    /// Waiting before the next attempt
    Retrying,
    /// Terminal failure
    Error,
}

impl AcquisitionStatus {
    /// True for `Ready` and `Error`
    pub fn is_terminal(&self) -> bool {
        matches!(self, AcquisitionStatus::Ready | AcquisitionStatus::Error)
    }
}

impl std::fmt::Display for AcquisitionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AcquisitionStatus::Downloading => write!(f, "downloading"),
            AcquisitionStatus::Processing => write!(f, "processing"),
            AcquisitionStatus::GeneratingWaveform => write!(f, "generating_waveform"),
            AcquisitionStatus::Ready => write!(f, "ready"),
            AcquisitionStatus::Retrying => write!(f, "retrying"),
            AcquisitionStatus::Error => write!(f, "error"),
        }
    }
}

/// Machine-readable error classification
///
/// Lets the UI decide whether to offer a retry affordance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Transport failure or timeout
    Network,
    /// Server-side failure (5xx, 408, 429)
    Server,
    /// Source does not exist or refused the request (4xx)
    NotFound,
    /// Payload could not be decoded
    Decode,
    /// Caller-supplied parameters are invalid (malformed URL, bad time range)
    Validation,
    /// Storage quota exhausted after emergency cleanup
    QuotaExceeded,
    /// Persistence backend unavailable
    Storage,
    /// Memory could not be allocated after emergency cleanup
    Allocation,
    /// Operation cancelled by the caller
    Cancelled,
    /// Unexpected internal failure
    Internal,
}

impl ErrorClass {
    /// Whether another attempt may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorClass::Network | ErrorClass::Server)
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorClass::Network => "network",
            ErrorClass::Server => "server",
            ErrorClass::NotFound => "not_found",
            ErrorClass::Decode => "decode",
            ErrorClass::Validation => "validation",
            ErrorClass::QuotaExceeded => "quota_exceeded",
            ErrorClass::Storage => "storage",
            ErrorClass::Allocation => "allocation",
            ErrorClass::Cancelled => "cancelled",
            ErrorClass::Internal => "internal",
        };
        write!(f, "{}", name)
    }
}

/// Error payload attached to a terminal `error` progress event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressError {
    /// Human-readable message
    pub message: String,
    /// Classification for retry affordances
    pub classification: ErrorClass,
}

/// Acquisition progress update
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressEvent {
    /// Source key string the update refers to
    pub source_key: String,
    pub status: AcquisitionStatus,
    /// Overall progress, 0-100
    pub progress: u8,
    /// Attempt number (1-based) when relevant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ProgressError>,
}

impl ProgressEvent {
    pub fn new(source_key: impl Into<String>, status: AcquisitionStatus, progress: u8) -> Self {
        Self {
            source_key: source_key.into(),
            status,
            progress: progress.min(100),
            attempt: None,
            error: None,
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    /// Immediate `ready` at 100% (cache hit or completed acquisition)
    pub fn ready(source_key: impl Into<String>) -> Self {
        Self::new(source_key, AcquisitionStatus::Ready, 100)
    }

    /// Terminal error event
    pub fn failed(
        source_key: impl Into<String>,
        progress: u8,
        message: impl Into<String>,
        classification: ErrorClass,
    ) -> Self {
        let mut event = Self::new(source_key, AcquisitionStatus::Error, progress);
        event.error = Some(ProgressError {
            message: message.into(),
            classification,
        });
        event
    }
}

/// Why a voice stopped before reaching its end
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Caller stopped this voice
    Explicit,
    /// Caller stopped every voice
    StopAll,
    /// A newer jump on the playhead channel replaced it
    Superseded,
    /// A newer trigger on the same pad arrived inside the debounce window
    Debounced,
}

/// Voice lifecycle event for visual feedback
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum VoiceEvent {
    /// Voice scheduled and audible from the next render quantum
    Started {
        voice_id: Uuid,
        source_key: String,
        /// Region start in seconds
        start_time: f64,
        /// Region end in seconds
        end_time: f64,
        gain: f32,
        /// Pad the trigger came from, if any
        #[serde(skip_serializing_if = "Option::is_none")]
        pad: Option<u32>,
        timestamp: DateTime<Utc>,
    },

    /// Voice stopped before its natural end
    Stopped {
        voice_id: Uuid,
        reason: StopReason,
        timestamp: DateTime<Utc>,
    },

    /// Voice reached the end of its region
    Ended {
        voice_id: Uuid,
        timestamp: DateTime<Utc>,
    },

    /// Voice reclaimed because the host voice limit was reached
    Stolen {
        voice_id: Uuid,
        timestamp: DateTime<Utc>,
    },
}

impl VoiceEvent {
    /// Voice the event refers to
    pub fn voice_id(&self) -> Uuid {
        match self {
            VoiceEvent::Started { voice_id, .. }
            | VoiceEvent::Stopped { voice_id, .. }
            | VoiceEvent::Ended { voice_id, .. }
            | VoiceEvent::Stolen { voice_id, .. } => *voice_id,
        }
    }
}

/// Rendering and analysis knobs for one degradation level
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualitySettings {
    pub level: u8,
    /// Canvas resolution multiplier
    pub resolution_scale: f32,
    pub antialiasing: bool,
    /// Draw calls batched per frame
    pub batch_size: u32,
    pub animations_enabled: bool,
    /// Waveform envelope resolution used by acquisition
    pub waveform_points: usize,
    /// Store new cache entries as 16-bit PCM
    pub cache_compression: bool,
    /// Analysis threads the host should allow
    pub analysis_workers: usize,
}

/// Why the degradation level moved
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QualityChangeReason {
    Degraded,
    Recovered,
    /// Simultaneous hard breaches forced the maximum level
    Emergency,
    Reset,
}

/// Emitted whenever the degradation level changes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityChange {
    pub previous_level: u8,
    pub level: u8,
    pub settings: QualitySettings,
    /// Score that caused the change (0-1)
    pub score: f64,
    pub reason: QualityChangeReason,
    pub timestamp: DateTime<Utc>,
}

/// Hard floor breached by a single frame or memory sample
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    LowFps,
    SlowRender,
    HighMemory,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerformanceWarning {
    pub kind: WarningKind,
    pub value: f64,
    pub threshold: f64,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_event_serialization() {
        let event = ProgressEvent::new("yt:dQw4w9WgXcQ", AcquisitionStatus::Downloading, 35)
            .with_attempt(2);
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["status"], "downloading");
        assert_eq!(json["progress"], 35);
        assert_eq!(json["attempt"], 2);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_failed_event_carries_classification() {
        let event = ProgressEvent::failed("yt:abc", 12, "connection reset", ErrorClass::Network);
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["status"], "error");
        assert_eq!(json["error"]["classification"], "network");
        assert_eq!(json["error"]["message"], "connection reset");
    }

    #[test]
    fn test_progress_is_clamped() {
        let event = ProgressEvent::new("k", AcquisitionStatus::Processing, 250);
        assert_eq!(event.progress, 100);
    }

    #[test]
    fn test_retryable_classes() {
        assert!(ErrorClass::Network.is_retryable());
        assert!(ErrorClass::Server.is_retryable());
        assert!(!ErrorClass::Decode.is_retryable());
        assert!(!ErrorClass::Validation.is_retryable());
        assert!(!ErrorClass::NotFound.is_retryable());
    }

    #[test]
    fn test_voice_event_tagging() {
        let id = Uuid::new_v4();
        let event = VoiceEvent::Stopped {
            voice_id: id,
            reason: StopReason::Superseded,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "Stopped");
        assert_eq!(json["reason"], "superseded");
        assert_eq!(event.voice_id(), id);
    }

    #[test]
    fn test_quality_change_serialization() {
        let change = QualityChange {
            previous_level: 0,
            level: 3,
            settings: QualitySettings {
                level: 3,
                resolution_scale: 0.25,
                antialiasing: false,
                batch_size: 10,
                animations_enabled: false,
                waveform_points: 250,
                cache_compression: true,
                analysis_workers: 1,
            },
            score: 0.2,
            reason: QualityChangeReason::Emergency,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json["reason"], "emergency");
        assert_eq!(json["settings"]["waveform_points"], 250);
    }
}
