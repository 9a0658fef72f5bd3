//! Error types for worm_core.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using worm_core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while managing tracked files.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error occurred during file operations.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Content does not hash to the value it was requested or recorded under.
    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    /// Object is not present in the local content store.
    #[error("Object missing from cache: {hash}")]
    MissingObject { hash: String },

    /// The depot could not be reached or rejected the request.
    #[error("Depot unavailable: {reason}")]
    DepotUnavailable { reason: String },

    /// A depot call did not finish within the configured deadline.
    #[error("Depot request timed out after {seconds}s")]
    DepotTimeout { seconds: u64 },

    /// The depot has no object for the requested hash.
    #[error("Object missing from depot: {hash}")]
    DepotMissingObject { hash: String },

    /// Persisted index could not be parsed.
    #[error("Corrupt index at {path}: {reason}")]
    IndexCorrupt { path: PathBuf, reason: String },

    /// Invalid hash format or encoding.
    #[error("Invalid hash: {reason}")]
    InvalidHash { reason: String },

    /// Path has no entry in the index.
    #[error("Not tracked: {path}")]
    NotTracked { path: String },

    /// Path resolves outside the repository working directory.
    #[error("Path is outside the repository: {path}")]
    OutsideRepository { path: PathBuf },

    /// Destination already exists.
    #[error("Path already exists: {path}")]
    PathExists { path: PathBuf },

    /// A working file exists at a tracked path but is not linked to its object.
    #[error("Dirty file at {path}: content differs from the index, refusing to overwrite")]
    DirtyFile { path: PathBuf },

    /// Configuration failed validation.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// Depot URL scheme has no registered driver.
    #[error("No depot driver registered for scheme: {scheme}")]
    UnknownDepotScheme { scheme: String },

    /// Operation needs a depot but none is configured.
    #[error("A depot must be configured before {operation}")]
    NoDepot { operation: String },

    /// No index was found at or above the given directory.
    #[error("Not a worm repository (no {index} found at or above {path})")]
    NotInitialized { path: PathBuf, index: String },

    /// Work was not attempted because the batch was cancelled.
    #[error("Cancelled before transfer")]
    Cancelled,
}

impl Error {
    /// Create a HashMismatch error.
    pub fn hash_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Error::HashMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a MissingObject error.
    pub fn missing_object(hash: impl Into<String>) -> Self {
        Error::MissingObject { hash: hash.into() }
    }

    /// Create a DepotUnavailable error.
    pub fn depot_unavailable(reason: impl Into<String>) -> Self {
        Error::DepotUnavailable {
            reason: reason.into(),
        }
    }

    /// Create an IndexCorrupt error.
    pub fn index_corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::IndexCorrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an InvalidHash error.
    pub fn invalid_hash(reason: impl Into<String>) -> Self {
        Error::InvalidHash {
            reason: reason.into(),
        }
    }

    /// Create a NotTracked error.
    pub fn not_tracked(path: impl Into<String>) -> Self {
        Error::NotTracked { path: path.into() }
    }

    /// Create an OutsideRepository error.
    pub fn outside_repository(path: impl Into<PathBuf>) -> Self {
        Error::OutsideRepository { path: path.into() }
    }

    /// Create a PathExists error.
    pub fn path_exists(path: impl Into<PathBuf>) -> Self {
        Error::PathExists { path: path.into() }
    }

    /// Create a DirtyFile error.
    pub fn dirty_file(path: impl Into<PathBuf>) -> Self {
        Error::DirtyFile { path: path.into() }
    }

    /// Create an InvalidConfig error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Error::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create a NoDepot error.
    pub fn no_depot(operation: impl Into<String>) -> Self {
        Error::NoDepot {
            operation: operation.into(),
        }
    }

    /// Whether a later invocation may succeed without any local change.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::DepotUnavailable { .. } | Error::DepotTimeout { .. }
        )
    }

    /// Whether the error is an integrity violation rather than an availability problem.
    pub fn is_integrity(&self) -> bool {
        matches!(self, Error::HashMismatch { .. })
    }
}

// Additional From implementations for external error types

impl<F> From<tempfile::PersistError<F>> for Error {
    fn from(err: tempfile::PersistError<F>) -> Self {
        Error::Io { source: err.error }
    }
}

impl From<tempfile::PathPersistError> for Error {
    fn from(err: tempfile::PathPersistError) -> Self {
        Error::Io { source: err.error }
    }
}

impl From<ignore::Error> for Error {
    fn from(err: ignore::Error) -> Self {
        // ignore::Error can wrap an io::Error or be a path error
        match err.io_error() {
            Some(io_err) => Error::Io {
                source: std::io::Error::new(io_err.kind(), io_err.to_string()),
            },
            None => Error::Io {
                source: std::io::Error::other(err.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::depot_unavailable("connection refused").is_retryable());
        assert!(Error::DepotTimeout { seconds: 5 }.is_retryable());
        assert!(!Error::hash_mismatch("aa", "bb").is_retryable());
        assert!(!Error::missing_object("aa").is_retryable());
        assert!(!Error::index_corrupt(".worm", "bad json").is_retryable());
    }

    #[test]
    fn test_integrity_classification() {
        assert!(Error::hash_mismatch("aa", "bb").is_integrity());
        assert!(!Error::depot_unavailable("down").is_integrity());
    }

    #[test]
    fn test_display_messages() {
        let err = Error::not_tracked("data/big.bin");
        assert_eq!(err.to_string(), "Not tracked: data/big.bin");

        let err = Error::no_depot("pushing");
        assert_eq!(err.to_string(), "A depot must be configured before pushing");
    }
}
