//! Errors for configuration loading.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse configuration file '{path}': {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    #[error("Failed to read '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Configuration validation error for field '{field}': {message}")]
    Validation { field: String, message: String },
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
