//! Configuration resolution tests
//!
//! Covers the config file priority order and graceful fallback to compiled
//! defaults.
//!
//! Note: Uses serial_test crate to prevent ENV variable race conditions.
//! Tests that manipulate CLIPDECK_CONFIG are marked with #[serial].

use clipdeck_common::config::{ConfigSource, EngineConfig, CONFIG_ENV_VAR};
use serial_test::serial;
use std::env;
use std::io::Write;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("create temp config");
    file.write_all(contents.as_bytes()).expect("write temp config");
    file
}

#[test]
#[serial]
fn test_command_line_path_wins_over_environment() {
    let cli = write_config("[cache]\nmax_entries = 7\n");
    let envfile = write_config("[cache]\nmax_entries = 9\n");
    env::set_var(CONFIG_ENV_VAR, envfile.path());

    let (config, source) = EngineConfig::load(Some(cli.path())).unwrap();

    env::remove_var(CONFIG_ENV_VAR);
    assert_eq!(config.cache.max_entries, 7);
    assert_eq!(source, ConfigSource::CommandLine(cli.path().to_path_buf()));
}

#[test]
#[serial]
fn test_environment_path_used_without_cli() {
    let envfile = write_config("[playback]\nmax_voices = 4\n");
    env::set_var(CONFIG_ENV_VAR, envfile.path());

    let (config, source) = EngineConfig::load(None).unwrap();

    env::remove_var(CONFIG_ENV_VAR);
    assert_eq!(config.playback.max_voices, 4);
    assert!(matches!(source, ConfigSource::Environment(_)));
}

#[test]
#[serial]
fn test_missing_explicit_file_is_an_error() {
    env::remove_var(CONFIG_ENV_VAR);
    let missing = std::path::Path::new("/nonexistent/clipdeck/config.toml");
    assert!(EngineConfig::load(Some(missing)).is_err());
}

#[test]
#[serial]
fn test_invalid_values_in_file_are_rejected() {
    let file = write_config("[cache]\ncleanup_threshold_ratio = 1.5\n");
    assert!(EngineConfig::load(Some(file.path())).is_err());
}

#[test]
fn test_full_config_round_trip() {
    let file = write_config(
        r#"
        [cache]
        max_memory_bytes = 1048576
        max_persistent_bytes = 4194304
        max_entries = 3
        entry_ttl_secs = 60
        cleanup_threshold_ratio = 0.75

        [memory]
        max_bytes = 8388608

        [acquisition]
        retry_attempts = 4
        base_retry_delay_ms = 10
        max_retry_delay_ms = 100
        audio_endpoint = "http://media.local/audio/{id}.m4a"

        [performance]
        target_fps = 30.0
        min_fps = 20.0

        [zero_crossing]
        min_distance = 16
        amplitude_threshold = 0.02

        [logging]
        level = "clipdeck_engine=debug"
        "#,
    );

    let config = EngineConfig::from_file(file.path()).unwrap();
    assert_eq!(config.cache.max_memory_bytes, 1_048_576);
    assert_eq!(config.cache.entry_ttl_secs, 60);
    assert_eq!(config.memory.max_bytes, 8_388_608);
    assert_eq!(config.acquisition.retry_attempts, 4);
    assert_eq!(config.performance.target_fps, 30.0);
    assert_eq!(config.zero_crossing.min_distance, 16);
    assert_eq!(config.logging.level, "clipdeck_engine=debug");
    // Untouched tables keep their defaults
    assert_eq!(config.playback.sample_rate, 44100);
}
