//! Error types shared across the runtime, history and plugin layers.
//!
//! Everything below the plugin boundary reports failures as values. Only
//! [`crate::plugins::dispatch`] turns them into context annotations.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// An invalid option found while building a plugin configuration.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid value for `{key}`: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("missing required option `{0}`")]
    Missing(String),

    #[error("unrecognized option `{0}`")]
    UnknownOption(String),
}

impl ConfigError {
    pub fn invalid(key: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

/// Why a single attempt of an operation did not succeed.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AttemptError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Failed(String),

    #[error("operation panicked: {0}")]
    Panicked(String),
}

impl AttemptError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Failure to read or write the persisted state file. Never fatal.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("state file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("state file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("state file version {found} is not supported (expected {min}..={max})")]
    UnsupportedVersion { found: u32, min: u32, max: u32 },

    #[error("state writer did not finish: {0}")]
    Writer(String),
}

impl PersistenceError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_names_the_key() {
        let err = ConfigError::invalid("timeout", "must be > 0");
        assert_eq!(err.to_string(), "invalid value for `timeout`: must be > 0");
    }

    #[test]
    fn attempt_timeout_is_flagged() {
        assert!(AttemptError::Timeout(Duration::from_secs(1)).is_timeout());
        assert!(!AttemptError::Failed("boom".into()).is_timeout());
    }

    #[test]
    fn unsupported_version_message() {
        let err = PersistenceError::UnsupportedVersion {
            found: 9,
            min: 1,
            max: 1,
        };
        assert!(err.to_string().contains("version 9"));
    }
}
