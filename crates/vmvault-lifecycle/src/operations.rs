//! Lifecycle operations against a virtual machine.
//!
//! Each operation checks the machine's current state first and only issues a
//! remote task when a state change is actually needed; the management API
//! rejects no-op transitions, so skipping them is treated as success.

use std::time::Duration;

use rand::{Rng, distr::Alphanumeric};
use tracing::info;
use vmvault_directory::{PowerState, SnapshotInfo, TaskHandle, VirtualMachine};
use vmvault_events::{Event, EventBus};
use vmvault_telemetry::Metrics;

use crate::error::{LifecycleError, LifecycleResult};
use crate::monitor::{TaskMonitor, TaskProgress};

/// Prefix of automatically generated snapshot names.
pub const SNAPSHOT_NAME_PREFIX: &str = "VMVAULT_Snapshot_";

/// Error text the hypervisor returns when a snapshot request is a no-op.
/// Compared verbatim against the remote message; do not reword.
pub const STATE_UNCHANGED_MESSAGE: &str = "Snapshot not taken since the state of the virtual \
                                           machine has not changed since the last snapshot \
                                           operation";

const SNAPSHOT_NAME_SUFFIX_LEN: usize = 10;

/// How an operation concluded without error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleOutcome {
    /// A remote task ran to completion.
    Completed,
    /// No task was issued because the machine was already in the requested
    /// state.
    Skipped {
        /// The state that made the operation unnecessary.
        state: PowerState,
    },
}

/// Result of a snapshot request.
#[derive(Debug, Clone)]
pub struct SnapshotOutcome {
    /// Display name of the snapshot to retrieve.
    pub name: String,
    /// Unique id, known only when an existing snapshot was reused.
    pub uid: Option<String>,
    /// Whether the hypervisor declined to create a new snapshot and the
    /// newest existing one was resolved instead.
    pub reused_existing: bool,
}

/// Drives lifecycle operations and surfaces their progress as events.
#[derive(Clone)]
pub struct LifecycleService {
    events: EventBus,
    metrics: Metrics,
    monitor: TaskMonitor,
}

impl LifecycleService {
    /// Construct a service polling at `poll_interval` with an optional
    /// per-task deadline.
    #[must_use]
    pub fn new(
        events: EventBus,
        metrics: Metrics,
        poll_interval: Duration,
        task_deadline: Option<Duration>,
    ) -> Self {
        let monitor = TaskMonitor::new(poll_interval, task_deadline, metrics.clone());
        Self {
            events,
            metrics,
            monitor,
        }
    }

    /// Start the guest unless it is already powered on.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote task fails, times out, or the
    /// directory cannot be reached.
    pub async fn start(&self, vm: &dyn VirtualMachine) -> LifecycleResult<LifecycleOutcome> {
        let state = vm.power_state().await?;
        if state == PowerState::PoweredOn {
            return self.skip("start_guest", state);
        }
        let handle = vm.power_on().await?;
        self.drive("start_guest", handle.as_ref()).await?;
        Ok(LifecycleOutcome::Completed)
    }

    /// Stop the guest unless it is already powered off.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote task fails, times out, or the
    /// directory cannot be reached.
    pub async fn stop(&self, vm: &dyn VirtualMachine) -> LifecycleResult<LifecycleOutcome> {
        let state = vm.power_state().await?;
        if state != PowerState::PoweredOn {
            return self.skip("stop_guest", state);
        }
        let handle = vm.power_off().await?;
        self.drive("stop_guest", handle.as_ref()).await?;
        Ok(LifecycleOutcome::Completed)
    }

    /// Suspend the guest unless it is already suspended.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote task fails, times out, or the
    /// directory cannot be reached.
    pub async fn suspend(&self, vm: &dyn VirtualMachine) -> LifecycleResult<LifecycleOutcome> {
        let state = vm.power_state().await?;
        if state == PowerState::Suspended {
            return self.skip("suspend_guest", state);
        }
        let handle = vm.suspend().await?;
        self.drive("suspend_guest", handle.as_ref()).await?;
        Ok(LifecycleOutcome::Completed)
    }

    /// Revert to the named snapshot, or to the current one when `snapshot`
    /// is `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote task fails, times out, or the
    /// directory cannot be reached.
    pub async fn revert(
        &self,
        vm: &dyn VirtualMachine,
        snapshot: Option<&str>,
    ) -> LifecycleResult<LifecycleOutcome> {
        let handle = vm.revert_to_snapshot(snapshot).await?;
        self.drive("revert_vm", handle.as_ref()).await?;
        info!(vm_path = vm.vmx_path(), "reverted to snapshot");
        Ok(LifecycleOutcome::Completed)
    }

    /// Take a memory-inclusive snapshot with a generated name.
    ///
    /// When the hypervisor reports that the machine state has not changed
    /// since the last snapshot, no new snapshot exists; the newest existing
    /// one is resolved instead so retrieval can still proceed.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote task fails for any other reason, or if
    /// the unchanged-state fallback cannot resolve a snapshot with a uid.
    pub async fn take_snapshot(
        &self,
        vm: &dyn VirtualMachine,
        owner_container_id: u64,
    ) -> LifecycleResult<SnapshotOutcome> {
        let name = format!(
            "{SNAPSHOT_NAME_PREFIX}{}",
            random_string(SNAPSHOT_NAME_SUFFIX_LEN)
        );
        let description = format!("Snapshot taken by vmvault for container {owner_container_id}");
        info!(vm_path = vm.vmx_path(), snapshot = %name, "creating snapshot");

        let handle = vm.create_snapshot(&name, &description, true).await?;
        match self.drive("take_snapshot", handle.as_ref()).await {
            Ok(()) => {
                self.events.publish(Event::SnapshotCreated {
                    vm_path: vm.vmx_path().to_string(),
                    name: name.clone(),
                });
                Ok(SnapshotOutcome {
                    name,
                    uid: None,
                    reused_existing: false,
                })
            }
            Err(LifecycleError::RemoteOperation { message })
                if message.contains(STATE_UNCHANGED_MESSAGE) =>
            {
                let latest = latest_snapshot(vm).await?;
                let uid = latest.uid.ok_or(LifecycleError::SnapshotInfoUnavailable)?;
                info!(
                    vm_path = vm.vmx_path(),
                    snapshot = %latest.name,
                    "machine state unchanged; reusing newest snapshot"
                );
                self.metrics.inc_lifecycle_operation("take_snapshot", "reused");
                Ok(SnapshotOutcome {
                    name: latest.name,
                    uid: Some(uid),
                    reused_existing: true,
                })
            }
            Err(err) => Err(err),
        }
    }

    fn skip(
        &self,
        action: &'static str,
        state: PowerState,
    ) -> LifecycleResult<LifecycleOutcome> {
        self.events.publish(Event::OperationSkipped {
            action: action.to_string(),
            state: state.as_str().to_string(),
        });
        self.metrics.inc_lifecycle_operation(action, "skipped");
        Ok(LifecycleOutcome::Skipped { state })
    }

    async fn drive(&self, action: &'static str, handle: &dyn TaskHandle) -> LifecycleResult<()> {
        let label = action.replace('_', " ");
        let events = self.events.clone();
        let result = self
            .monitor
            .await_task(handle, |progress| {
                let event = match progress {
                    TaskProgress::Queued => Event::TaskQueued {
                        action: label.clone(),
                    },
                    TaskProgress::RunningPercent(percent) => Event::TaskProgress {
                        action: label.clone(),
                        percent,
                    },
                    TaskProgress::RunningUnknown => Event::TaskRunning {
                        action: label.clone(),
                    },
                };
                events.publish(event);
            })
            .await;

        let outcome = if result.is_ok() { "success" } else { "failure" };
        self.metrics.inc_lifecycle_operation(action, outcome);
        result
    }
}

async fn latest_snapshot(vm: &dyn VirtualMachine) -> LifecycleResult<SnapshotInfo> {
    let snapshots = vm.snapshots().await?;
    snapshots
        .into_iter()
        .max_by_key(|snapshot| snapshot.created_at)
        .ok_or(LifecycleError::SnapshotInfoUnavailable)
}

/// Generate a random alphanumeric string of the requested length.
#[must_use]
fn random_string(len: usize) -> String {
    let mut rng = rand::rng();
    std::iter::repeat_with(|| rng.sample(Alphanumeric) as char)
        .take(len)
        .collect()
}
