//! Error taxonomy for cache operations and the coordinator

use thiserror::Error;

use crate::types::Activity;
use crate::worker::Operation;

/// Failures raised by a package cache implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Failed to open package cache: {0}")]
    Open(String),

    #[error("{0}")]
    Locked(String),

    #[error("Failed to update package lists: {0}")]
    Update(String),

    #[error("Failed to apply changes: {0}")]
    Commit(String),

    #[error("Unknown package: {0}")]
    UnknownPackage(String),

    #[error("Operation panicked: {0}")]
    Panicked(String),

    #[error("Package worker exited before reporting a result")]
    WorkerExited,
}

/// Errors reported synchronously to the caller of a coordinator method
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("Busy: {0}")]
    Busy(Activity),

    #[error("Nothing selected")]
    NothingSelected,

    #[error("Background worker is no longer running")]
    WorkerGone,

    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// A refresh or install that failed inside the worker, delivered as a normal value
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{operation} failed: {error}")]
pub struct OperationFailure {
    pub operation: Operation,
    pub error: CacheError,
}

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_failure_names_the_operation() {
        let failure = OperationFailure {
            operation: Operation::InstallSelected,
            error: CacheError::Commit("dpkg was interrupted".into()),
        };
        assert_eq!(
            failure.to_string(),
            "Install failed: Failed to apply changes: dpkg was interrupted"
        );
    }

    #[test]
    fn cache_errors_pass_through_coordinator_errors() {
        let err = CoordinatorError::from(CacheError::UnknownPackage("ghost".into()));
        assert_eq!(err.to_string(), "Unknown package: ghost");
    }
}
