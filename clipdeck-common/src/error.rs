//! Common error types for clipdeck

use thiserror::Error;

/// Common result type for clipdeck operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types shared by the engine and its consumers
#[derive(Error, Debug)]
pub enum Error {
    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid user input or parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
