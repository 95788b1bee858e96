//! Handoff of downloaded files to the content-addressed artifact store.

use std::path::Path;
use std::sync::Arc;

use tracing::info;
use vmvault_directory::{ArtifactRecord, ArtifactStore, StoreRequest};
use vmvault_telemetry::Metrics;

use crate::error::{RetrievalError, RetrievalResult};

/// Hands completed local files to the artifact store.
#[derive(Clone)]
pub struct ArtifactTransfer {
    store: Arc<dyn ArtifactStore>,
    metrics: Metrics,
}

impl ArtifactTransfer {
    /// Construct a transfer over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn ArtifactStore>, metrics: Metrics) -> Self {
        Self { store, metrics }
    }

    /// Hand `local_path` to the store with the given metadata.
    ///
    /// The file's parent directory permissions are relaxed once, before the
    /// handoff, so a store running as a different principal can read it.
    ///
    /// # Errors
    ///
    /// Returns [`RetrievalError::Filesystem`] if the permissions cannot be
    /// changed and [`RetrievalError::ArtifactStore`] when the store rejects
    /// the file.
    pub async fn store(
        &self,
        local_path: &Path,
        request: StoreRequest,
    ) -> RetrievalResult<ArtifactRecord> {
        relax_parent_permissions(local_path)?;

        let record = self
            .store
            .store(local_path, request)
            .await
            .map_err(|err| RetrievalError::ArtifactStore {
                message: err.to_string(),
            })?;

        self.metrics.inc_artifact_stored();
        info!(
            artifact_id = %record.artifact_id,
            name = %record.name,
            size_bytes = record.size_bytes,
            "artifact stored"
        );
        Ok(record)
    }
}

#[cfg(unix)]
fn relax_parent_permissions(path: &Path) -> RetrievalResult<()> {
    use std::os::unix::fs::PermissionsExt;

    let parent = path.parent().ok_or_else(|| RetrievalError::Filesystem {
        operation: "resolve artifact parent directory",
        source: std::io::Error::new(std::io::ErrorKind::NotFound, "path has no parent"),
    })?;
    std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o770)).map_err(|source| {
        RetrievalError::Filesystem {
            operation: "relax artifact directory permissions",
            source,
        }
    })
}

#[cfg(not(unix))]
fn relax_parent_permissions(_path: &Path) -> RetrievalResult<()> {
    Ok(())
}
