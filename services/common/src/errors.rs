//! Common error types for services

use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config source could not be read or parsed
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    /// The requested instance has no section in the config source
    #[error("No configuration section for instance '{instance}'")]
    UnknownInstance {
        /// Instance identifier passed at startup
        instance: String,
    },

    /// A value is present but outside its legal range
    #[error("Invalid value for '{key}': {reason}")]
    InvalidValue {
        /// Offending key
        key: &'static str,
        /// Why the value was rejected
        reason: String,
    },
}
