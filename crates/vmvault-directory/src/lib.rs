//! Hypervisor-agnostic collaborator traits and DTOs.
//!
//! The management server, inventory traversal, and the content-addressed
//! artifact store are external collaborators. These traits are the seams the
//! lifecycle and retrieval services are written against; concrete
//! implementations (SOAP client, test doubles) live with the hosting
//! application.

mod error;
mod model;

use std::path::Path;

use async_trait::async_trait;

pub use error::{DirectoryError, DirectoryResult};
pub use model::{
    ArtifactRecord, PowerState, SnapshotInfo, StoreRequest, TaskState, TaskStatus, VmFileEntry,
    VmFileKind, VmSummary,
};

/// Handle to a remote asynchronous operation. Observed, never mutated; the
/// hypervisor advances its state independently.
#[async_trait]
pub trait TaskHandle: Send + Sync {
    /// Fetch the task's current status.
    async fn poll(&self) -> DirectoryResult<TaskStatus>;
}

/// A virtual machine resolved from the directory.
#[async_trait]
pub trait VirtualMachine: Send + Sync {
    /// Datastore path of the machine's configuration file (no datacenter
    /// prefix).
    fn vmx_path(&self) -> &str;

    /// Current power state.
    async fn power_state(&self) -> DirectoryResult<PowerState>;

    /// Start the guest. Returns the handle of the asynchronous task.
    async fn power_on(&self) -> DirectoryResult<Box<dyn TaskHandle>>;

    /// Stop the guest.
    async fn power_off(&self) -> DirectoryResult<Box<dyn TaskHandle>>;

    /// Suspend the guest, writing its memory image to the datastore.
    async fn suspend(&self) -> DirectoryResult<Box<dyn TaskHandle>>;

    /// Create a snapshot, optionally capturing guest memory.
    async fn create_snapshot(
        &self,
        name: &str,
        description: &str,
        include_memory: bool,
    ) -> DirectoryResult<Box<dyn TaskHandle>>;

    /// Revert to the named snapshot, or to the current one when `name` is
    /// `None`.
    async fn revert_to_snapshot(&self, name: Option<&str>)
    -> DirectoryResult<Box<dyn TaskHandle>>;

    /// Existing snapshots, unordered.
    async fn snapshots(&self) -> DirectoryResult<Vec<SnapshotInfo>>;

    /// The machine's datastore file layout. `from_cache: false` forces a
    /// fresh read from the server, which matters right after a snapshot or
    /// suspend has produced new files.
    async fn file_layout(&self, from_cache: bool) -> DirectoryResult<Vec<VmFileEntry>>;
}

/// Inventory access on the management server.
#[async_trait]
pub trait VmDirectory: Send + Sync {
    /// Enumerate registered machines in a datacenter.
    async fn list_vms(&self, datacenter: &str) -> DirectoryResult<Vec<VmSummary>>;

    /// Resolve a machine by its datastore path within a datacenter.
    async fn get_vm(
        &self,
        vmx_path: &str,
        datacenter: &str,
    ) -> DirectoryResult<Box<dyn VirtualMachine>>;
}

/// Content-addressed destination for retrieved files.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Ingest a local file. The store owns hashing and deduplication; the
    /// caller keeps the file readable until this returns.
    async fn store(&self, path: &Path, request: StoreRequest) -> anyhow::Result<ArtifactRecord>;
}
