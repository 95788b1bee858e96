//! Guest lifecycle operations and remote task monitoring.
//!
//! Power transitions, snapshot creation, and reverts are all asynchronous
//! tasks on the management server; [`TaskMonitor`] polls them to completion
//! and [`LifecycleService`] wraps the individual operations with state checks,
//! events, and metrics.

mod error;
mod monitor;
mod operations;

pub use error::{LifecycleError, LifecycleResult};
pub use monitor::{TaskMonitor, TaskProgress};
pub use operations::{
    LifecycleOutcome, LifecycleService, SNAPSHOT_NAME_PREFIX, STATE_UNCHANGED_MESSAGE,
    SnapshotOutcome,
};
