//! Error types for the Turnstile admission controller.

use thiserror::Error;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Invalid or missing settings
    #[error("Configuration error: {0}")]
    Config(String),

    /// Settings file or environment could not be loaded
    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    /// Remote store operation failed
    #[error("Storage error: {0}")]
    Storage(#[from] redis::RedisError),

    /// Cleanup sweep hit an unexpected condition
    #[error("Maintenance error: {0}")]
    Maintenance(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
