//! Error types for VM directory collaborators.

use std::error::Error;

use thiserror::Error;

/// Primary error type for directory operations.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// No virtual machine is registered at the given path.
    #[error("virtual machine not found")]
    VmNotFound {
        /// Path that failed to resolve.
        vmx_path: String,
    },
    /// Operation failed on the management server.
    #[error("directory operation failed")]
    OperationFailed {
        /// Operation identifier.
        operation: &'static str,
        /// Underlying failure.
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
    /// Operation is not supported by the underlying directory.
    #[error("directory operation not supported")]
    Unsupported {
        /// Operation identifier.
        operation: &'static str,
    },
}

/// Convenience alias for directory operation results.
pub type DirectoryResult<T> = Result<T, DirectoryError>;
