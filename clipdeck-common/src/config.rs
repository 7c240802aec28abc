//! Engine configuration
//!
//! All recognized options live in [`EngineConfig`]; every field has a
//! compiled default so an empty (or missing) TOML file yields a working
//! configuration.
//!
//! Config file resolution priority:
//! 1. Command-line argument (highest priority)
//! 2. `CLIPDECK_CONFIG` environment variable
//! 3. Platform config file (`~/.config/clipdeck/config.toml` on Linux)
//! 4. Compiled defaults (fallback)

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "CLIPDECK_CONFIG";

/// Application directory name under the platform config/cache roots
pub const APP_DIR: &str = "clipdeck";

/// Where the active configuration came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    CommandLine(PathBuf),
    Environment(PathBuf),
    PlatformFile(PathBuf),
    Defaults,
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub cache: CacheConfig,
    pub memory: MemoryConfig,
    pub acquisition: AcquisitionConfig,
    pub performance: PerformanceConfig,
    pub zero_crossing: ZeroCrossingConfig,
    pub playback: PlaybackConfig,
    pub logging: LoggingConfig,
}

/// Two-tier cache limits
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// In-memory tier byte budget
    pub max_memory_bytes: u64,
    /// Persistent tier byte budget
    pub max_persistent_bytes: u64,
    /// In-memory tier entry limit
    pub max_entries: usize,
    /// Entry time-to-live in seconds, measured from last access
    pub entry_ttl_secs: u64,
    /// Eviction stops once usage falls to this fraction of the budget
    pub cleanup_threshold_ratio: f64,
    /// SQLite database for the persistent tier; `None` uses the platform cache dir
    pub database_path: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: 512 * 1024 * 1024,
            max_persistent_bytes: 2 * 1024 * 1024 * 1024,
            max_entries: 50,
            entry_ttl_secs: 24 * 60 * 60,
            cleanup_threshold_ratio: 0.8,
            database_path: None,
        }
    }
}

impl CacheConfig {
    pub fn entry_ttl(&self) -> Duration {
        Duration::from_secs(self.entry_ttl_secs)
    }

    /// Resolve the persistent tier location
    pub fn resolved_database_path(&self) -> PathBuf {
        self.database_path.clone().unwrap_or_else(default_database_path)
    }
}

/// Memory manager limits and pooling policy
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct MemoryConfig {
    /// Allocations beyond this total trigger synchronous cleanup
    pub max_bytes: u64,
    /// Deallocated buffers at or above this size are released, not pooled
    pub pool_max_buffer_bytes: u64,
    /// Usage fraction above which pooling stops
    pub pressure_ratio: f64,
    /// Age-based cleanup evicts allocations older than this
    pub max_allocation_age_secs: u64,
    /// Period of the automatic cleanup timer
    pub auto_cleanup_interval_secs: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_bytes: 1024 * 1024 * 1024,
            pool_max_buffer_bytes: 10 * 1024 * 1024,
            pressure_ratio: 0.8,
            max_allocation_age_secs: 10 * 60,
            auto_cleanup_interval_secs: 30,
        }
    }
}

impl MemoryConfig {
    pub fn max_allocation_age(&self) -> Duration {
        Duration::from_secs(self.max_allocation_age_secs)
    }

    pub fn auto_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.auto_cleanup_interval_secs)
    }
}

/// Download/decode retry policy and endpoint
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Total attempts per acquisition (first try included)
    pub retry_attempts: u32,
    pub base_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    /// Fractional jitter applied to each backoff delay
    pub retry_jitter_ratio: f64,
    /// Audio endpoint for video ids; `{id}` is replaced by the video id
    pub audio_endpoint: String,
    pub request_timeout_secs: u64,
    /// Read size for local files
    pub chunk_size_bytes: usize,
    /// Distinct sources acquired concurrently
    pub max_concurrent: usize,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            base_retry_delay_ms: 1000,
            max_retry_delay_ms: 10_000,
            retry_jitter_ratio: 0.25,
            audio_endpoint: "http://localhost:3001/api/audio/{id}".to_string(),
            request_timeout_secs: 120,
            chunk_size_bytes: 64 * 1024,
            max_concurrent: 4,
        }
    }
}

impl AcquisitionConfig {
    pub fn base_retry_delay(&self) -> Duration {
        Duration::from_millis(self.base_retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Adaptive quality thresholds
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct PerformanceConfig {
    pub target_fps: f64,
    pub min_fps: f64,
    /// Score below this raises the degradation level
    pub degradation_threshold: f64,
    /// Score above this lowers the degradation level
    pub recovery_threshold: f64,
    pub max_degradation_level: u8,
    pub evaluation_interval_ms: u64,
    /// Samples kept in each sliding window
    pub window_size: usize,
    /// Single-frame fps floor for immediate warnings
    pub hard_min_fps: f64,
    /// Single-frame render ceiling for immediate warnings
    pub hard_max_render_ms: f64,
    /// Memory usage fraction counted as a hard breach
    pub hard_memory_ratio: f64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            target_fps: 60.0,
            min_fps: 30.0,
            degradation_threshold: 0.6,
            recovery_threshold: 0.8,
            max_degradation_level: 3,
            evaluation_interval_ms: 5000,
            window_size: 60,
            hard_min_fps: 15.0,
            hard_max_render_ms: 50.0,
            hard_memory_ratio: 0.9,
        }
    }
}

impl PerformanceConfig {
    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_millis(self.evaluation_interval_ms)
    }

    /// Frame budget at the target rate
    pub fn target_frame_ms(&self) -> f64 {
        1000.0 / self.target_fps
    }
}

/// Zero-crossing detection thresholds
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ZeroCrossingConfig {
    /// Minimum spacing between accepted crossings, in samples
    pub min_distance: usize,
    /// Local RMS below this is treated as silence
    pub amplitude_threshold: f32,
    /// Minimum sample-to-sample slope at the crossing
    pub slope_threshold: f32,
    /// Half-width of the RMS window, in samples
    pub rms_window: usize,
    /// Boundaries only move when click reduction exceeds this (0-1)
    pub min_improvement: f32,
    /// Search radius around each boundary when optimizing cuts
    pub search_window_ms: f64,
    /// Buffers whose crossing lists are kept
    pub result_cache_capacity: usize,
}

impl Default for ZeroCrossingConfig {
    fn default() -> Self {
        Self {
            min_distance: 32,
            amplitude_threshold: 0.01,
            slope_threshold: 0.001,
            rms_window: 64,
            min_improvement: 0.1,
            search_window_ms: 10.0,
            result_cache_capacity: 32,
        }
    }
}

/// Playback scheduling
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Output sample rate of the host audio engine
    pub sample_rate: u32,
    /// Host voice limit; the oldest voice is stolen beyond it
    pub max_voices: usize,
    /// Same-pad triggers closer than this are coalesced
    pub min_trigger_interval_ms: u64,
    /// Voice event channel capacity
    pub event_capacity: usize,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            max_voices: 32,
            min_trigger_interval_ms: 10,
            event_capacity: 256,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when RUST_LOG is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "clipdeck_engine=info".to_string(),
        }
    }
}

impl EngineConfig {
    /// Parse configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Resolve and load configuration following the priority order
    ///
    /// A missing platform file is not an error; compiled defaults are used.
    /// An explicitly named file (command line or environment) must exist.
    pub fn load(cli_path: Option<&Path>) -> Result<(Self, ConfigSource)> {
        // Priority 1: Command-line argument
        if let Some(path) = cli_path {
            let config = Self::from_file(path)?;
            info!("Loaded config from command line: {}", path.display());
            return Ok((config, ConfigSource::CommandLine(path.to_path_buf())));
        }

        // Priority 2: Environment variable
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            let path = PathBuf::from(path);
            let config = Self::from_file(&path)?;
            info!("Loaded config from {}: {}", CONFIG_ENV_VAR, path.display());
            return Ok((config, ConfigSource::Environment(path)));
        }

        // Priority 3: Platform config file
        if let Some(path) = platform_config_path() {
            if path.exists() {
                let config = Self::from_file(&path)?;
                info!("Loaded config from {}", path.display());
                return Ok((config, ConfigSource::PlatformFile(path)));
            }
        }

        // Priority 4: Compiled defaults
        warn!("No config file found, using compiled defaults");
        Ok((Self::default(), ConfigSource::Defaults))
    }

    /// Reject internally inconsistent values
    pub fn validate(&self) -> Result<()> {
        let ratio_ok = |r: f64| r > 0.0 && r <= 1.0;

        if !ratio_ok(self.cache.cleanup_threshold_ratio) {
            return Err(Error::Config(format!(
                "cache.cleanup_threshold_ratio must be in (0, 1], got {}",
                self.cache.cleanup_threshold_ratio
            )));
        }
        if self.cache.max_entries == 0 {
            return Err(Error::Config("cache.max_entries must be at least 1".to_string()));
        }
        if !ratio_ok(self.memory.pressure_ratio) {
            return Err(Error::Config(format!(
                "memory.pressure_ratio must be in (0, 1], got {}",
                self.memory.pressure_ratio
            )));
        }
        if self.acquisition.retry_attempts == 0 {
            return Err(Error::Config(
                "acquisition.retry_attempts must be at least 1".to_string(),
            ));
        }
        if self.acquisition.base_retry_delay_ms > self.acquisition.max_retry_delay_ms {
            return Err(Error::Config(
                "acquisition.base_retry_delay_ms exceeds max_retry_delay_ms".to_string(),
            ));
        }
        if !self.acquisition.audio_endpoint.contains("{id}") {
            return Err(Error::Config(
                "acquisition.audio_endpoint must contain an {id} placeholder".to_string(),
            ));
        }
        let perf = &self.performance;
        if perf.target_fps <= 0.0 || perf.min_fps <= 0.0 || perf.min_fps > perf.target_fps {
            return Err(Error::Config(format!(
                "performance fps limits invalid: min_fps={} target_fps={}",
                perf.min_fps, perf.target_fps
            )));
        }
        if perf.recovery_threshold <= perf.degradation_threshold {
            return Err(Error::Config(format!(
                "performance.recovery_threshold ({}) must exceed degradation_threshold ({})",
                perf.recovery_threshold, perf.degradation_threshold
            )));
        }
        if perf.window_size == 0 {
            return Err(Error::Config("performance.window_size must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.zero_crossing.min_improvement) {
            return Err(Error::Config(format!(
                "zero_crossing.min_improvement must be in [0, 1], got {}",
                self.zero_crossing.min_improvement
            )));
        }
        if self.playback.sample_rate == 0 || self.playback.max_voices == 0 {
            return Err(Error::Config(
                "playback.sample_rate and playback.max_voices must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Platform config file location
pub fn platform_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(APP_DIR).join("config.toml"))
}

/// Default persistent cache location
///
/// - Linux: `~/.cache/clipdeck/cache.db`
/// - macOS: `~/Library/Caches/clipdeck/cache.db`
/// - Windows: `%LOCALAPPDATA%\clipdeck\cache.db`
pub fn default_database_path() -> PathBuf {
    dirs::cache_dir()
        .map(|d| d.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from("./clipdeck_data"))
        .join("cache.db")
}
