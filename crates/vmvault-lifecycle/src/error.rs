//! Error types for lifecycle operations.

use std::time::Duration;

use thiserror::Error;
use vmvault_directory::DirectoryError;

/// Result type for lifecycle operations.
pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Errors produced while driving remote tasks.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The remote task reached the error state. The hypervisor's message is
    /// passed through verbatim.
    #[error("remote operation failed: {message}")]
    RemoteOperation {
        /// Message reported by the hypervisor.
        message: String,
    },
    /// A deadline elapsed before the task reached a terminal state.
    #[error("operation timed out")]
    Timeout {
        /// Operation that exceeded its deadline.
        operation: &'static str,
        /// The configured deadline.
        limit: Duration,
    },
    /// The directory collaborator failed.
    #[error("directory failure")]
    Directory {
        /// Underlying directory error.
        #[from]
        source: DirectoryError,
    },
    /// Snapshot metadata could not be resolved after an unchanged-state
    /// response.
    #[error("failed to get information of latest snapshot")]
    SnapshotInfoUnavailable,
}
