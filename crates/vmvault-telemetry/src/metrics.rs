//! Prometheus-backed metrics registry and snapshot helpers.
//!
//! # Design
//! - Encapsulates collector registration to keep the public API small.
//! - Exposes the counters relevant to lifecycle and retrieval services.

use anyhow::{Context, Result};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use serde::Serialize;

/// Prometheus-backed metrics registry shared across services.
#[derive(Clone)]
pub struct Metrics {
    inner: std::sync::Arc<MetricsInner>,
}

struct MetricsInner {
    registry: Registry,
    lifecycle_operations_total: IntCounterVec,
    task_polls_total: IntCounterVec,
    retrieval_steps_total: IntCounterVec,
    artifacts_stored_total: IntCounter,
    download_bytes_total: IntCounter,
    active_retrievals: IntGauge,
}

/// Snapshot of selected gauges and counters for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Number of retrieval pipeline runs currently in flight.
    pub active_retrievals: i64,
    /// Total artifacts handed to the store.
    pub artifacts_stored_total: u64,
    /// Total bytes downloaded from hypervisor datastores.
    pub download_bytes_total: u64,
}

impl Metrics {
    /// Construct a new metrics registry with the standard collectors registered.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the Prometheus collectors cannot be
    /// registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let lifecycle_operations_total = IntCounterVec::new(
            Opts::new(
                "lifecycle_operations_total",
                "Lifecycle operations executed by action and outcome",
            ),
            &["action", "outcome"],
        )?;
        let task_polls_total = IntCounterVec::new(
            Opts::new("task_polls_total", "Remote task polls observed by state"),
            &["state"],
        )?;
        let retrieval_steps_total = IntCounterVec::new(
            Opts::new(
                "retrieval_steps_total",
                "Retrieval pipeline steps executed by status",
            ),
            &["step", "status"],
        )?;
        let artifacts_stored_total = IntCounter::with_opts(Opts::new(
            "artifacts_stored_total",
            "Artifacts handed to the content-addressed store",
        ))?;
        let download_bytes_total = IntCounter::with_opts(Opts::new(
            "download_bytes_total",
            "Bytes downloaded from hypervisor datastores",
        ))?;
        let active_retrievals = IntGauge::with_opts(Opts::new(
            "active_retrievals",
            "Retrieval pipeline runs in flight",
        ))?;

        registry.register(Box::new(lifecycle_operations_total.clone()))?;
        registry.register(Box::new(task_polls_total.clone()))?;
        registry.register(Box::new(retrieval_steps_total.clone()))?;
        registry.register(Box::new(artifacts_stored_total.clone()))?;
        registry.register(Box::new(download_bytes_total.clone()))?;
        registry.register(Box::new(active_retrievals.clone()))?;

        Ok(Self {
            inner: std::sync::Arc::new(MetricsInner {
                registry,
                lifecycle_operations_total,
                task_polls_total,
                retrieval_steps_total,
                artifacts_stored_total,
                download_bytes_total,
                active_retrievals,
            }),
        })
    }

    /// Increment the lifecycle operation counter.
    pub fn inc_lifecycle_operation(&self, action: &str, outcome: &str) {
        self.inner
            .lifecycle_operations_total
            .with_label_values(&[action, outcome])
            .inc();
    }

    /// Increment the task poll counter for the observed state.
    pub fn inc_task_poll(&self, state: &str) {
        self.inner
            .task_polls_total
            .with_label_values(&[state])
            .inc();
    }

    /// Increment the retrieval pipeline step counter.
    pub fn inc_retrieval_step(&self, step: &str, status: &str) {
        self.inner
            .retrieval_steps_total
            .with_label_values(&[step, status])
            .inc();
    }

    /// Record an artifact handed to the store.
    pub fn inc_artifact_stored(&self) {
        self.inner.artifacts_stored_total.inc();
    }

    /// Record bytes downloaded from a datastore.
    pub fn add_download_bytes(&self, bytes: u64) {
        self.inner.download_bytes_total.inc_by(bytes);
    }

    /// Adjust the in-flight retrieval gauge.
    pub fn set_active_retrievals(&self, count: i64) {
        self.inner.active_retrievals.set(count);
    }

    /// Render the metrics registry using the Prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns an error if the metrics cannot be encoded or if the encoded
    /// buffer is not valid UTF-8.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.inner.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .context("failed to encode Prometheus metrics")?;
        String::from_utf8(buffer).context("metrics output was not valid UTF-8")
    }

    /// Take a point-in-time snapshot of the most relevant values.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_retrievals: self.inner.active_retrievals.get(),
            artifacts_stored_total: self.inner.artifacts_stored_total.get(),
            download_bytes_total: self.inner.download_bytes_total.get(),
        }
    }
}
