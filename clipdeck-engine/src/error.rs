//! Error types for clipdeck-engine
//!
//! One thiserror enum per concern, aggregated by [`Error`] for callers that
//! drive several components at once.
//!
//! Classification follows the retry semantics of each failure:
//! - network/server failures are retryable
//! - decode and validation failures are never retried
//! - quota exhaustion triggers emergency cleanup before one retry
//! - storage I/O failures degrade the cache to memory-only

use crate::memory::AllocationId;
use clipdeck_common::events::ErrorClass;
use thiserror::Error;

/// Main error type for clipdeck-engine
#[derive(Error, Debug)]
pub enum Error {
    /// Download/decode pipeline errors
    #[error("Acquisition error: {0}")]
    Acquisition(#[from] AcquisitionError),

    /// Cache persistence errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Buffer allocation errors
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    /// Trigger/jump errors
    #[error("Playback error: {0}")]
    Playback(#[from] PlaybackError),

    /// Caller-supplied parameters are invalid
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Audio decoding errors
    #[error("Audio decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Analysis worker pool errors
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    /// Configuration loading errors
    #[error("Configuration error: {0}")]
    Config(#[from] clipdeck_common::Error),
}

/// Convenience Result type using clipdeck-engine Error
pub type Result<T> = std::result::Result<T, Error>;

/// Caller-supplied time range or parameter is invalid
///
/// Never retried and never triggers cleanup.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Validation error: {0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Audio decoding failure (malformed payload, non-retryable)
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// No demuxer/codec recognized the payload
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Container holds no decodable audio track
    #[error("No audio track found")]
    NoAudioTrack,

    /// Payload structure is broken
    #[error("Malformed audio: {0}")]
    Malformed(String),

    /// Decoding produced no samples
    #[error("Decoded audio is empty")]
    Empty,
}

/// Acquisition failure with classification and attempt count attached
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{class} failure after {attempts} attempt(s): {message}")]
pub struct AcquisitionError {
    /// Machine-readable classification
    pub class: ErrorClass,
    /// Human-readable detail
    pub message: String,
    /// Attempts made before giving up
    pub attempts: u32,
    /// HTTP status when the failure came from a response
    pub status: Option<u16>,
}

impl AcquisitionError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            attempts: 0,
            status: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Network, message)
    }

    /// Classify an HTTP status: 408/429/5xx are server (retryable), other
    /// 4xx are not found (non-retryable)
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let class = match status {
            408 | 429 => ErrorClass::Server,
            500..=599 => ErrorClass::Server,
            _ => ErrorClass::NotFound,
        };
        Self {
            status: Some(status),
            ..Self::new(class, message)
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::NotFound, message)
    }

    pub fn malformed_url(url: &str) -> Self {
        Self::new(ErrorClass::Validation, format!("malformed URL: {}", url))
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Validation, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorClass::Cancelled, "acquisition cancelled")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Internal, message)
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.class.is_retryable()
    }

    pub fn is_cancelled(&self) -> bool {
        self.class == ErrorClass::Cancelled
    }
}

impl From<DecodeError> for AcquisitionError {
    fn from(err: DecodeError) -> Self {
        Self::new(ErrorClass::Decode, err.to_string())
    }
}

impl From<MemoryError> for AcquisitionError {
    fn from(err: MemoryError) -> Self {
        Self::new(ErrorClass::Allocation, err.to_string())
    }
}

impl From<WorkerError> for AcquisitionError {
    fn from(err: WorkerError) -> Self {
        Self::new(ErrorClass::Internal, err.to_string())
    }
}

/// Cache persistence failure
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    /// Entry does not fit even after eviction and emergency cleanup
    #[error("Quota exceeded: {required} bytes required, {available} bytes available")]
    QuotaExceeded { required: u64, available: u64 },

    /// Persistence backend unavailable
    #[error("Storage I/O error: {0}")]
    Io(String),

    /// Stored record could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StorageError::QuotaExceeded { .. } => ErrorClass::QuotaExceeded,
            StorageError::Io(_) => ErrorClass::Storage,
            StorageError::Serialization(_) => ErrorClass::Storage,
        }
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db_err) = err {
            // SQLITE_FULL (13): database or disk is full
            if db_err.code().as_deref() == Some("13") {
                return StorageError::QuotaExceeded {
                    required: 0,
                    available: 0,
                };
            }
        }
        StorageError::Io(err.to_string())
    }
}

/// Buffer allocation failure
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MemoryError {
    /// Emergency cleanup could not free enough memory
    #[error("Out of memory: {requested} bytes requested, {available} bytes available after cleanup")]
    Allocation { requested: u64, available: u64 },

    /// Allocation id is not tracked (already released or evicted)
    #[error("Unknown allocation: {0}")]
    UnknownAllocation(AllocationId),
}

/// Trigger/jump failure
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlaybackError {
    /// Invalid time range or gain; no audio-engine side effects
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Source is neither preloaded nor cached
    #[error("Source not loaded: {0}")]
    NotLoaded(String),

    /// No source selected for the playhead channel
    #[error("No active source for playhead")]
    NoActiveSource,

    /// A newer jump on the same channel won
    #[error("Superseded by a newer jump")]
    Superseded,
}

/// Analysis worker pool failure
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkerError {
    /// Pool no longer accepts tasks
    #[error("Worker pool is shutting down")]
    ShuttingDown,

    /// Task panicked or was discarded before producing a result
    #[error("Task {0} did not produce a result")]
    TaskDropped(u64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(AcquisitionError::from_status(503, "x").class, ErrorClass::Server);
        assert_eq!(AcquisitionError::from_status(429, "x").class, ErrorClass::Server);
        assert_eq!(AcquisitionError::from_status(408, "x").class, ErrorClass::Server);
        assert_eq!(AcquisitionError::from_status(404, "x").class, ErrorClass::NotFound);
        assert_eq!(AcquisitionError::from_status(403, "x").class, ErrorClass::NotFound);
        assert_eq!(AcquisitionError::from_status(404, "x").status, Some(404));
    }

    #[test]
    fn test_decode_errors_are_not_retryable() {
        let err: AcquisitionError = DecodeError::NoAudioTrack.into();
        assert_eq!(err.class, ErrorClass::Decode);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_display_includes_attempts() {
        let err = AcquisitionError::network("connection reset").with_attempts(3);
        assert_eq!(
            err.to_string(),
            "network failure after 3 attempt(s): connection reset"
        );
    }

    #[test]
    fn test_storage_error_classes() {
        let quota = StorageError::QuotaExceeded {
            required: 10,
            available: 5,
        };
        assert_eq!(quota.class(), ErrorClass::QuotaExceeded);
        assert_eq!(StorageError::Io("disk".into()).class(), ErrorClass::Storage);
    }
}
