//! Blocking-poll state machine for remote asynchronous tasks.

use std::time::Duration;

use tokio::time::{sleep, timeout};
use vmvault_directory::{TaskHandle, TaskState};
use vmvault_telemetry::Metrics;

use crate::error::{LifecycleError, LifecycleResult};

/// Progress notifications surfaced while a task runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskProgress {
    /// Task is queued on the hypervisor.
    Queued,
    /// Task is running at the given completion percentage.
    RunningPercent(u8),
    /// Task is running with no progress figure. Reported once per run.
    RunningUnknown,
}

/// Polls a task handle until it reaches a terminal state.
#[derive(Clone)]
pub struct TaskMonitor {
    poll_interval: Duration,
    deadline: Option<Duration>,
    metrics: Metrics,
}

impl TaskMonitor {
    /// Default interval between polls.
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

    /// Construct a monitor with the given polling interval and optional
    /// overall deadline. `None` preserves the unbounded wait of the original
    /// protocol.
    #[must_use]
    pub fn new(poll_interval: Duration, deadline: Option<Duration>, metrics: Metrics) -> Self {
        Self {
            poll_interval,
            deadline,
            metrics,
        }
    }

    /// Drive `handle` to a terminal state, reporting progress through `sink`.
    ///
    /// `queued` observations notify on every poll; `running` observations
    /// notify with a percentage whenever one is available, and otherwise
    /// exactly once for the whole run so slow tasks do not spam the sink.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::RemoteOperation`] when the task reports the
    /// error state, [`LifecycleError::Timeout`] when the deadline elapses, or
    /// a directory error if the handle itself cannot be polled.
    pub async fn await_task<F>(&self, handle: &dyn TaskHandle, sink: F) -> LifecycleResult<()>
    where
        F: FnMut(TaskProgress),
    {
        match self.deadline {
            Some(limit) => timeout(limit, self.poll_until_terminal(handle, sink))
                .await
                .map_err(|_| LifecycleError::Timeout {
                    operation: "await_task",
                    limit,
                })?,
            None => self.poll_until_terminal(handle, sink).await,
        }
    }

    async fn poll_until_terminal<F>(
        &self,
        handle: &dyn TaskHandle,
        mut sink: F,
    ) -> LifecycleResult<()>
    where
        F: FnMut(TaskProgress),
    {
        let mut running_reported = false;

        loop {
            let status = handle.poll().await?;
            self.metrics.inc_task_poll(status.state.as_str());

            match status.state {
                TaskState::Error => {
                    return Err(LifecycleError::RemoteOperation {
                        message: status.error.unwrap_or_default(),
                    });
                }
                TaskState::Success => return Ok(()),
                TaskState::Queued => sink(TaskProgress::Queued),
                TaskState::Running => {
                    if let Some(percent) = status.progress_percent {
                        sink(TaskProgress::RunningPercent(percent));
                    } else if !running_reported {
                        sink(TaskProgress::RunningUnknown);
                        running_reported = true;
                    }
                }
            }

            sleep(self.poll_interval).await;
        }
    }
}
