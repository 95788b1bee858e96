//! Error types for the retrieval pipeline.

use std::time::Duration;

use thiserror::Error;
use vmvault_directory::DirectoryError;

/// Result type for retrieval operations.
pub type RetrievalResult<T> = Result<T, RetrievalError>;

/// Errors produced while retrieving datastore files.
#[derive(Debug, Error)]
pub enum RetrievalError {
    /// The management server could not be reached, or the stream broke
    /// mid-transfer.
    #[error("failed to connect to server")]
    Connection {
        /// Underlying transport error.
        #[source]
        source: reqwest::Error,
    },
    /// The server answered with a non-success status code.
    #[error("server returned status code {status}")]
    HttpStatus {
        /// The status code received.
        status: u16,
    },
    /// The server did not advertise a content length; the download cannot
    /// size its chunks without one.
    #[error("unable to get content length of remote file")]
    ContentLengthUnavailable,
    /// The snapshot descriptor did not contain a matching entry.
    #[error("unable to find file path of snapshot '{name}'")]
    SnapshotNotFound {
        /// Display name that was requested.
        name: String,
    },
    /// The machine's file layout has no snapshot descriptor file.
    #[error("cannot find snapshot descriptor file")]
    DescriptorUnavailable,
    /// A required datastore file is missing from the machine's file layout.
    #[error("cannot find {kind} file in datastore layout")]
    FileUnavailable {
        /// Logical file type that was looked for.
        kind: &'static str,
    },
    /// The artifact store rejected the file.
    #[error("failed to add file to artifact store: {message}")]
    ArtifactStore {
        /// Message reported by the store.
        message: String,
    },
    /// A local filesystem operation failed.
    #[error("filesystem operation failed during {operation}")]
    Filesystem {
        /// Operation that failed.
        operation: &'static str,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The directory collaborator failed.
    #[error("directory failure")]
    Directory {
        /// Underlying directory error.
        #[from]
        source: DirectoryError,
    },
    /// A deadline elapsed before the operation finished.
    #[error("operation timed out")]
    Timeout {
        /// Operation that exceeded its deadline.
        operation: &'static str,
        /// The configured deadline.
        limit: Duration,
    },
}
