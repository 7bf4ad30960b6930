//! Error types shared by the flowplane core crate.

use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised while loading configuration or parsing descriptors.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration {0:?}: expected <number><ms|s|m|h>")]
    InvalidDuration(String),

    #[error("invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("invalid pull step: {0}")]
    InvalidPullStep(String),
}
