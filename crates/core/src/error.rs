//! Core error types for requeue.
//!
//! All errors are explicit, typed, and recoverable - no panics allowed.

use std::path::PathBuf;

use thiserror::Error;

/// The standard Result type for requeue core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("invalid object key '{input}': {reason}")]
    InvalidKey { input: String, reason: String },

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("failed to load configuration from '{path}': {reason}")]
    ConfigLoadFailed { path: PathBuf, reason: String },
}

impl Error {
    /// Create an invalid key error.
    pub fn invalid_key(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            input: input.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid configuration error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create a configuration load error.
    pub fn config_load_failed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::ConfigLoadFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_key_display() {
        let err = Error::invalid_key("a/b/c", "too many separators");
        assert!(err.to_string().contains("a/b/c"));
        assert!(err.to_string().contains("too many separators"));
    }

    #[test]
    fn test_config_load_failed_display() {
        let err = Error::config_load_failed("/etc/requeue.toml", "missing");
        assert!(err.to_string().contains("/etc/requeue.toml"));
    }
}
