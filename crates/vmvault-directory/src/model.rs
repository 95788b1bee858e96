//! DTOs shared between the directory traits and their consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// States a remote asynchronous task moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Accepted by the hypervisor but not started.
    Queued,
    /// Executing on the hypervisor.
    Running,
    /// Finished successfully.
    Success,
    /// Finished with an error.
    Error,
}

impl TaskState {
    /// Whether the task can make no further progress.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }

    /// Stable label used for metrics and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

/// One observation of a remote task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    /// State at observation time.
    pub state: TaskState,
    /// Completion percentage when the hypervisor reports one.
    pub progress_percent: Option<u8>,
    /// Error message for tasks in the error state.
    pub error: Option<String>,
}

impl TaskStatus {
    /// Observation of a non-terminal state with no extra detail.
    #[must_use]
    pub const fn of(state: TaskState) -> Self {
        Self {
            state,
            progress_percent: None,
            error: None,
        }
    }

    /// Observation of a running task with a known percentage.
    #[must_use]
    pub const fn running_at(percent: u8) -> Self {
        Self {
            state: TaskState::Running,
            progress_percent: Some(percent),
            error: None,
        }
    }

    /// Observation of a failed task carrying the remote message.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            state: TaskState::Error,
            progress_percent: None,
            error: Some(message.into()),
        }
    }
}

/// Power states a virtual machine can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    /// Guest is running.
    PoweredOn,
    /// Guest is shut down.
    PoweredOff,
    /// Guest execution is suspended to disk.
    Suspended,
}

impl PowerState {
    /// Stable label used for messages and events.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PoweredOn => "powered_on",
            Self::PoweredOff => "powered_off",
            Self::Suspended => "suspended",
        }
    }
}

/// Logical file types appearing in a VM's datastore file layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmFileKind {
    /// Primary VM configuration file.
    Config,
    /// Descriptor file enumerating snapshot metadata.
    SnapshotList,
    /// A snapshot's backing data file (memory image).
    SnapshotData,
    /// Suspend (memory) image written when a guest is suspended.
    Suspend,
    /// Non-volatile RAM file.
    Nvram,
    /// Guest or hypervisor log file.
    Log,
    /// Anything the directory reports that we do not classify.
    Other(String),
}

/// One entry in a VM's file layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmFileEntry {
    /// Logical file type.
    pub kind: VmFileKind,
    /// Datastore path in bracketed notation, e.g. `[ds1] vm/vm.vmsn`.
    pub name: String,
    /// Size when the directory reports one.
    pub size_bytes: Option<u64>,
}

/// Metadata for an existing snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotInfo {
    /// Display name.
    pub name: String,
    /// Hypervisor-assigned unique id, when known.
    pub uid: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Summary row returned when enumerating registered machines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSummary {
    /// Full bracketed path including the datacenter.
    pub vmx_path: String,
    /// Guest display name.
    pub name: Option<String>,
    /// Guest IP address when the tools report one.
    pub ip_address: Option<String>,
    /// Guest hostname when the tools report one.
    pub hostname: Option<String>,
    /// Whether the guest is currently powered on.
    pub powered_on: bool,
}

/// Metadata accompanying a file handed to the artifact store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreRequest {
    /// Container that will own the stored artifact.
    pub owner_container_id: u64,
    /// File name to record.
    pub name: String,
    /// Type label, e.g. "vm snapshot file".
    pub type_label: String,
    /// Size of the file in bytes.
    pub size_bytes: u64,
    /// Free-form metadata forwarded to the store.
    pub metadata: serde_json::Value,
}

/// Terminal record describing a stored artifact. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRecord {
    /// Content hash or equivalent identity assigned by the store.
    pub artifact_id: String,
    /// Recorded file name.
    pub name: String,
    /// Stored size in bytes.
    pub size_bytes: u64,
    /// Container that owns the artifact.
    pub owner_container_id: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(TaskState::Success.is_terminal());
        assert!(TaskState::Error.is_terminal());
        assert!(!TaskState::Queued.is_terminal());
        assert!(!TaskState::Running.is_terminal());
    }

    #[test]
    fn status_constructors_carry_detail() {
        let status = TaskStatus::running_at(42);
        assert_eq!(status.state, TaskState::Running);
        assert_eq!(status.progress_percent, Some(42));

        let failed = TaskStatus::failed("disk full");
        assert_eq!(failed.state, TaskState::Error);
        assert_eq!(failed.error.as_deref(), Some("disk full"));
    }
}
