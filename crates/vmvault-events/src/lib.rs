//! Core event bus for the vmvault platform.
//!
//! Components publish typed progress and lifecycle events here instead of
//! logging directly, so that hosting dispatchers can forward them to whatever
//! surface they own. Internally the bus is a bounded `tokio::broadcast`
//! channel; when it overflows, the oldest events are dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::sync::broadcast::{Receiver, Sender};
use uuid::Uuid;

/// Identifier assigned to each event emitted by the platform.
pub type EventId = u64;

/// Default broadcast capacity used by [`EventBus::new`].
const DEFAULT_CAPACITY: usize = 256;

/// Typed domain events surfaced across the system.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A remote task is still queued on the hypervisor.
    TaskQueued {
        /// Human-readable action label, e.g. "take snapshot".
        action: String,
    },
    /// A remote task is running but reports no numeric progress.
    TaskRunning {
        /// Human-readable action label.
        action: String,
    },
    /// A remote task reported a completion percentage.
    TaskProgress {
        /// Human-readable action label.
        action: String,
        /// Completion percent reported by the hypervisor.
        percent: u8,
    },
    /// A lifecycle operation finished without issuing a remote task because
    /// the machine was already in the requested state.
    OperationSkipped {
        /// Operation that was skipped.
        action: String,
        /// Power state that made the operation unnecessary.
        state: String,
    },
    /// A snapshot was created on the hypervisor.
    SnapshotCreated {
        /// VM path the snapshot belongs to.
        vm_path: String,
        /// Snapshot display name.
        name: String,
    },
    /// A file retrieval run started.
    RetrievalStarted {
        /// Identifier of the retrieval run.
        run_id: Uuid,
        /// VM path the retrieval targets.
        vm_path: String,
    },
    /// A retrieval run advanced to the named step.
    RetrievalStep {
        /// Identifier of the retrieval run.
        run_id: Uuid,
        /// Step label, e.g. "resolve_descriptor".
        step: String,
    },
    /// Bytes arrived for an in-flight download.
    DownloadProgress {
        /// Identifier of the retrieval run.
        run_id: Uuid,
        /// Fraction of the advertised content length written so far.
        fraction: f64,
    },
    /// A retrieval run completed and the artifact was stored.
    RetrievalCompleted {
        /// Identifier of the retrieval run.
        run_id: Uuid,
        /// Identity assigned by the artifact store.
        artifact_id: String,
    },
    /// A retrieval run failed.
    RetrievalFailed {
        /// Identifier of the retrieval run.
        run_id: Uuid,
        /// Human-readable failure reason.
        message: String,
    },
    /// The set of degraded components changed.
    HealthChanged {
        /// Component names currently degraded; empty means recovered.
        degraded: Vec<String>,
    },
}

impl Event {
    /// Machine-friendly discriminator for downstream consumers.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Event::TaskQueued { .. } => "task_queued",
            Event::TaskRunning { .. } => "task_running",
            Event::TaskProgress { .. } => "task_progress",
            Event::OperationSkipped { .. } => "operation_skipped",
            Event::SnapshotCreated { .. } => "snapshot_created",
            Event::RetrievalStarted { .. } => "retrieval_started",
            Event::RetrievalStep { .. } => "retrieval_step",
            Event::DownloadProgress { .. } => "download_progress",
            Event::RetrievalCompleted { .. } => "retrieval_completed",
            Event::RetrievalFailed { .. } => "retrieval_failed",
            Event::HealthChanged { .. } => "health_changed",
        }
    }
}

/// Metadata wrapper around events carrying the id and emission timestamp.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct EventEnvelope {
    /// Sequential identifier assigned at publish time.
    pub id: EventId,
    /// Emission timestamp.
    pub timestamp: DateTime<Utc>,
    /// The event payload.
    pub event: Event,
}

/// Shared event bus built on top of `tokio::broadcast`.
#[derive(Clone)]
pub struct EventBus {
    sender: Sender<EventEnvelope>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    /// Construct a new bus with the provided broadcast capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "event bus capacity must be positive");
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Construct a bus with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Publish a new event to the bus, assigning it a sequential identifier.
    ///
    /// Publishing never blocks; with no subscribers the event is dropped.
    pub fn publish(&self, event: Event) -> EventId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let envelope = EventEnvelope {
            id,
            timestamp: Utc::now(),
            event,
        };
        let _ = self.sender.send(envelope);
        id
    }

    /// Subscribe to events published after this call.
    #[must_use]
    pub fn subscribe(&self) -> EventStream {
        EventStream {
            receiver: self.sender.subscribe(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream wrapper over the live broadcast channel.
pub struct EventStream {
    receiver: Receiver<EventEnvelope>,
}

impl EventStream {
    /// Receive the next event; `None` once the bus is gone.
    ///
    /// Lagged receivers skip over the dropped window and continue with the
    /// oldest event still buffered.
    pub async fn next(&mut self) -> Option<EventEnvelope> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
