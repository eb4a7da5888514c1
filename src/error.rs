//! Error types for the bootstrap framework.

use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading, merging, and registration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {message}")]
    ParseFailed { path: PathBuf, message: String },

    #[error("Remote source '{name}' is not registered")]
    RemoteSourceNotFound { name: String },

    #[error("Reloader '{name}' is already registered")]
    ReloaderAlreadyRegistered { name: String },

    #[error("Remote source '{name}' failed: {message}")]
    RemoteFailed { name: String, message: String },

    #[error("Failed to watch config file: {0}")]
    WatchFailed(#[from] notify::Error),
}

/// Errors from hot-swappable resources.
#[derive(Error, Debug)]
pub enum ResourceError {
    /// The resource is disabled by configuration. Callers should treat this
    /// as an expected condition, not a failure.
    #[error("Resource '{section}' is disabled by configuration")]
    Disabled { section: String },

    #[error("Failed to build '{section}' instance: {message}")]
    BuildFailed { section: String, message: String },

    #[error("Failed to decode '{section}' options: {message}")]
    DecodeFailed { section: String, message: String },

    #[error("Resource '{section}' is closed")]
    Closed { section: String },
}

impl ResourceError {
    /// Returns true when the error means "unavailable by configuration"
    /// rather than an operational failure.
    pub fn is_disabled(&self) -> bool {
        matches!(self, ResourceError::Disabled { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_is_not_a_build_failure() {
        let err = ResourceError::Disabled {
            section: "http".into(),
        };
        assert!(err.is_disabled());

        let err = ResourceError::BuildFailed {
            section: "http".into(),
            message: "bind failed".into(),
        };
        assert!(!err.is_disabled());
    }

    #[test]
    fn config_errors_name_the_offender() {
        let err = ConfigError::RemoteSourceNotFound {
            name: "consul".into(),
        };
        assert!(err.to_string().contains("consul"));

        let err = ConfigError::ReloaderAlreadyRegistered { name: "http".into() };
        assert!(err.to_string().contains("http"));
    }
}
