//! Multi-step retrieval of snapshot and suspend images.
//!
//! There is no API to map a snapshot name to its on-disk file, so the
//! pipeline first downloads the machine's snapshot descriptor, resolves the
//! backing file name from it, then downloads that file and hands it to the
//! artifact store. Each run owns a scoped temp directory that is removed on
//! every exit path, after the handoff, since the store copies bytes out
//! before returning. Runs keep no state between invocations; a retry
//! re-downloads everything.

use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vmvault_config::VmvaultConfig;
use vmvault_directory::{ArtifactRecord, ArtifactStore, StoreRequest, VirtualMachine, VmFileKind};
use vmvault_events::{Event, EventBus};
use vmvault_telemetry::Metrics;

use crate::artifact::ArtifactTransfer;
use crate::descriptor::resolve_snapshot_file;
use crate::download::{DownloadOutcome, Downloader};
use crate::error::{RetrievalError, RetrievalResult};
use crate::path::{FileUrl, build_file_url, file_name_from_url};

/// Type label recorded for snapshot memory images.
pub const SNAPSHOT_FILE_TYPE: &str = "vm snapshot file";

/// Type label recorded for suspend memory images.
pub const SUSPEND_FILE_TYPE: &str = "vm suspend file";

const TEMP_DIR_PREFIX: &str = "vmvault-";

/// Drives the retrieval pipeline against one management server.
#[derive(Clone)]
pub struct RetrievalService {
    server_address: String,
    temp_root: Option<PathBuf>,
    downloader: Downloader,
    transfer: ArtifactTransfer,
    events: EventBus,
    metrics: Metrics,
    degraded: Arc<Mutex<bool>>,
    active: Arc<AtomicI64>,
}

impl RetrievalService {
    /// Construct a service from the merged configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(
        config: &VmvaultConfig,
        store: Arc<dyn ArtifactStore>,
        events: EventBus,
        metrics: Metrics,
    ) -> RetrievalResult<Self> {
        let downloader = Downloader::new(
            &config.hypervisor,
            config.retrieval.download_deadline(),
            metrics.clone(),
        )?;
        let transfer = ArtifactTransfer::new(store, metrics.clone());
        Ok(Self {
            server_address: config.hypervisor.server_address.clone(),
            temp_root: config.retrieval.temp_root.clone(),
            downloader,
            transfer,
            events,
            metrics,
            degraded: Arc::new(Mutex::new(false)),
            active: Arc::new(AtomicI64::new(0)),
        })
    }

    /// Whether the last run hit an infrastructure failure (filesystem,
    /// transport, or deadline) rather than a business one.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        *self.degraded.lock().expect("degraded mutex poisoned")
    }

    /// Retrieve the memory image of the named snapshot into the artifact
    /// store.
    ///
    /// Success means the final handoff completed; a run that fails at any
    /// earlier step reports failure even though individual downloads may have
    /// succeeded along the way.
    ///
    /// # Errors
    ///
    /// Returns the first step-level error; see [`RetrievalError`] for the
    /// taxonomy. No step is retried.
    pub async fn retrieve_snapshot(
        &self,
        vm: &dyn VirtualMachine,
        datacenter: &str,
        snapshot_name: &str,
        uid: Option<&str>,
        owner_container_id: u64,
    ) -> RetrievalResult<ArtifactRecord> {
        let run_id = self.begin_run(vm);
        let result = self
            .snapshot_steps(run_id, vm, datacenter, snapshot_name, uid, owner_container_id)
            .await;
        self.finish_run(run_id, result)
    }

    /// Retrieve the machine's suspend image into the artifact store. The
    /// suspend file is addressed directly from the file layout; no descriptor
    /// step is needed.
    ///
    /// # Errors
    ///
    /// Returns the first step-level error; no step is retried.
    pub async fn retrieve_suspend_image(
        &self,
        vm: &dyn VirtualMachine,
        datacenter: &str,
        owner_container_id: u64,
    ) -> RetrievalResult<ArtifactRecord> {
        let run_id = self.begin_run(vm);
        let result = self
            .suspend_steps(run_id, vm, datacenter, owner_container_id)
            .await;
        self.finish_run(run_id, result)
    }

    async fn snapshot_steps(
        &self,
        run_id: Uuid,
        vm: &dyn VirtualMachine,
        datacenter: &str,
        snapshot_name: &str,
        uid: Option<&str>,
        owner_container_id: u64,
    ) -> RetrievalResult<ArtifactRecord> {
        self.begin_step(run_id, "locate_descriptor");
        // bypass the cache: a snapshot taken moments ago must be visible
        let layout = vm.file_layout(false).await?;
        let descriptor_entry = layout
            .iter()
            .find(|entry| entry.kind == VmFileKind::SnapshotList)
            .ok_or(RetrievalError::DescriptorUnavailable)?;

        let temp_dir = self.make_temp_dir()?;

        self.begin_step(run_id, "download_descriptor");
        let descriptor_url = build_file_url(&self.server_address, &descriptor_entry.name, datacenter);
        let descriptor_path = temp_dir
            .path()
            .join(file_name_from_url(&descriptor_url.url));
        self.download(run_id, &descriptor_url, &descriptor_path)
            .await?;

        self.begin_step(run_id, "resolve_descriptor");
        let descriptor_text = std::fs::read_to_string(&descriptor_path).map_err(|source| {
            RetrievalError::Filesystem {
                operation: "read snapshot descriptor",
                source,
            }
        })?;
        let resolved = resolve_snapshot_file(&descriptor_text, snapshot_name, uid);
        // the local descriptor copy is not needed past this point, whichever
        // way resolution went
        if let Err(err) = std::fs::remove_file(&descriptor_path) {
            debug!(error = %err, "failed to remove descriptor copy");
        }
        let data_file_name = resolved?;

        self.begin_step(run_id, "locate_snapshot_data");
        let data_entry = layout
            .iter()
            .find(|entry| {
                entry.kind == VmFileKind::SnapshotData && entry.name.contains(&data_file_name)
            })
            .ok_or(RetrievalError::FileUnavailable {
                kind: "snapshot data",
            })?;

        self.begin_step(run_id, "download_snapshot");
        let data_url = build_file_url(&self.server_address, &data_entry.name, datacenter);
        let local_name = format!(
            "{}-{}",
            sanitised_file_name(snapshot_name),
            file_name_from_url(&data_url.url)
        );
        let local_path = temp_dir.path().join(&local_name);
        let outcome = self.download(run_id, &data_url, &local_path).await?;

        self.begin_step(run_id, "store_artifact");
        let request = StoreRequest {
            owner_container_id,
            name: local_name,
            type_label: SNAPSHOT_FILE_TYPE.to_string(),
            size_bytes: outcome.bytes_written,
            metadata: serde_json::json!({
                "vmx_path": vm.vmx_path(),
                "snapshot": snapshot_name,
            }),
        };
        self.transfer.store(&outcome.local_path, request).await
        // temp_dir dropped here, after the handoff
    }

    async fn suspend_steps(
        &self,
        run_id: Uuid,
        vm: &dyn VirtualMachine,
        datacenter: &str,
        owner_container_id: u64,
    ) -> RetrievalResult<ArtifactRecord> {
        self.begin_step(run_id, "locate_suspend_image");
        let layout = vm.file_layout(false).await?;
        let suspend_entry = layout
            .iter()
            .find(|entry| entry.kind == VmFileKind::Suspend)
            .ok_or(RetrievalError::FileUnavailable {
                kind: "suspend image",
            })?;

        let temp_dir = self.make_temp_dir()?;

        self.begin_step(run_id, "download_suspend_image");
        let suspend_url = build_file_url(&self.server_address, &suspend_entry.name, datacenter);
        let local_name = file_name_from_url(&suspend_url.url).to_string();
        let local_path = temp_dir.path().join(&local_name);
        let outcome = self.download(run_id, &suspend_url, &local_path).await?;

        self.begin_step(run_id, "store_artifact");
        let request = StoreRequest {
            owner_container_id,
            name: local_name,
            type_label: SUSPEND_FILE_TYPE.to_string(),
            size_bytes: outcome.bytes_written,
            metadata: serde_json::json!({ "vmx_path": vm.vmx_path() }),
        };
        self.transfer.store(&outcome.local_path, request).await
    }

    fn begin_run(&self, vm: &dyn VirtualMachine) -> Uuid {
        let run_id = Uuid::new_v4();
        info!(%run_id, vm_path = vm.vmx_path(), "retrieval run started");
        self.events.publish(Event::RetrievalStarted {
            run_id,
            vm_path: vm.vmx_path().to_string(),
        });
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.metrics.set_active_retrievals(active);
        run_id
    }

    fn finish_run(
        &self,
        run_id: Uuid,
        result: RetrievalResult<ArtifactRecord>,
    ) -> RetrievalResult<ArtifactRecord> {
        let active = self.active.fetch_sub(1, Ordering::SeqCst) - 1;
        self.metrics.set_active_retrievals(active);

        match &result {
            Ok(record) => {
                info!(%run_id, artifact_id = %record.artifact_id, "retrieval run completed");
                self.events.publish(Event::RetrievalCompleted {
                    run_id,
                    artifact_id: record.artifact_id.clone(),
                });
                self.metrics.inc_retrieval_step("pipeline", "completed");
                self.mark_recovered();
            }
            Err(err) => {
                warn!(%run_id, error = %err, "retrieval run failed");
                self.events.publish(Event::RetrievalFailed {
                    run_id,
                    message: err.to_string(),
                });
                self.metrics.inc_retrieval_step("pipeline", "failed");
                if matches!(
                    err,
                    RetrievalError::Connection { .. }
                        | RetrievalError::Filesystem { .. }
                        | RetrievalError::Timeout { .. }
                ) {
                    self.mark_degraded();
                }
            }
        }
        result
    }

    fn begin_step(&self, run_id: Uuid, step: &str) {
        self.events.publish(Event::RetrievalStep {
            run_id,
            step: step.to_string(),
        });
        self.metrics.inc_retrieval_step(step, "started");
    }

    async fn download(
        &self,
        run_id: Uuid,
        url: &FileUrl,
        local_path: &std::path::Path,
    ) -> RetrievalResult<DownloadOutcome> {
        let events = self.events.clone();
        self.downloader
            .download(url, local_path, |fraction| {
                events.publish(Event::DownloadProgress { run_id, fraction });
            })
            .await
    }

    fn make_temp_dir(&self) -> RetrievalResult<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(TEMP_DIR_PREFIX);
        match &self.temp_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .map_err(|source| RetrievalError::Filesystem {
            operation: "create temp directory",
            source,
        })
    }

    fn mark_degraded(&self) {
        let mut degraded = self.degraded.lock().expect("degraded mutex poisoned");
        if !*degraded {
            *degraded = true;
            self.events.publish(Event::HealthChanged {
                degraded: vec!["retrieval".to_string()],
            });
        }
    }

    fn mark_recovered(&self) {
        let mut degraded = self.degraded.lock().expect("degraded mutex poisoned");
        if *degraded {
            *degraded = false;
            self.events.publish(Event::HealthChanged {
                degraded: Vec::new(),
            });
        }
    }
}

/// Replace characters that are unsafe in a file name.
fn sanitised_file_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use httpmock::prelude::*;
    use std::path::Path;
    use vmvault_config::{HypervisorConfig, RetrievalConfig, Secret};
    use vmvault_directory::{DirectoryResult, PowerState, SnapshotInfo, TaskHandle, VmFileEntry};

    const DESCRIPTOR: &str = r#"
.encoding = "UTF-8"
snapshot0.uid = "1"
snapshot0.filename = "snap-1.vmsn"
snapshot0.displayName = "Snap-A"
snapshot1.uid = "2"
snapshot1.filename = "snap-2.vmem"
snapshot1.displayName = "Snap-B"
"#;

    struct LayoutVm {
        layout: Vec<VmFileEntry>,
    }

    impl LayoutVm {
        fn with_standard_layout() -> Self {
            let entry = |kind, name: &str| VmFileEntry {
                kind,
                name: name.to_string(),
                size_bytes: None,
            };
            Self {
                layout: vec![
                    entry(VmFileKind::Config, "[datastore1] vm/vm.vmx"),
                    entry(VmFileKind::SnapshotList, "[datastore1] vm/vm.vmsd"),
                    entry(VmFileKind::SnapshotData, "[datastore1] vm/snap-1.vmsn"),
                    entry(VmFileKind::SnapshotData, "[datastore1] vm/snap-2.vmem"),
                    entry(VmFileKind::Suspend, "[datastore1] vm/vm.vmss"),
                ],
            }
        }
    }

    #[async_trait]
    impl VirtualMachine for LayoutVm {
        fn vmx_path(&self) -> &str {
            "[datastore1] vm/vm.vmx"
        }

        async fn power_state(&self) -> DirectoryResult<PowerState> {
            Ok(PowerState::PoweredOn)
        }

        async fn power_on(&self) -> DirectoryResult<Box<dyn TaskHandle>> {
            unimplemented!("not exercised")
        }

        async fn power_off(&self) -> DirectoryResult<Box<dyn TaskHandle>> {
            unimplemented!("not exercised")
        }

        async fn suspend(&self) -> DirectoryResult<Box<dyn TaskHandle>> {
            unimplemented!("not exercised")
        }

        async fn create_snapshot(
            &self,
            _name: &str,
            _description: &str,
            _include_memory: bool,
        ) -> DirectoryResult<Box<dyn TaskHandle>> {
            unimplemented!("not exercised")
        }

        async fn revert_to_snapshot(
            &self,
            _name: Option<&str>,
        ) -> DirectoryResult<Box<dyn TaskHandle>> {
            unimplemented!("not exercised")
        }

        async fn snapshots(&self) -> DirectoryResult<Vec<SnapshotInfo>> {
            Ok(Vec::new())
        }

        async fn file_layout(&self, _from_cache: bool) -> DirectoryResult<Vec<VmFileEntry>> {
            Ok(self.layout.clone())
        }
    }

    struct AcceptingStore;

    #[async_trait]
    impl ArtifactStore for AcceptingStore {
        async fn store(
            &self,
            path: &Path,
            request: StoreRequest,
        ) -> anyhow::Result<ArtifactRecord> {
            let size_bytes = std::fs::metadata(path)?.len();
            Ok(ArtifactRecord {
                artifact_id: format!("sha1:{}", request.name),
                name: request.name,
                size_bytes,
                owner_container_id: request.owner_container_id,
            })
        }
    }

    fn service(server: &MockServer, temp_root: &Path) -> (RetrievalService, EventBus) {
        let config = VmvaultConfig {
            hypervisor: HypervisorConfig {
                server_address: format!("http://{}", server.address()),
                username: "root".into(),
                password: Secret::new("secret"),
                verify_server_certificate: false,
            },
            retrieval: RetrievalConfig {
                temp_root: Some(temp_root.to_path_buf()),
                ..RetrievalConfig::default()
            },
        };
        let events = EventBus::new();
        let service = RetrievalService::new(
            &config,
            Arc::new(AcceptingStore),
            events.clone(),
            Metrics::new().expect("metrics"),
        )
        .expect("service");
        (service, events)
    }

    fn assert_no_leftover_run_dirs(temp_root: &Path) {
        let leftovers: Vec<_> = std::fs::read_dir(temp_root)
            .expect("temp root readable")
            .collect();
        assert!(leftovers.is_empty(), "temp run dirs left behind: {leftovers:?}");
    }

    #[tokio::test]
    async fn snapshot_retrieval_resolves_and_stores_the_backing_file() -> RetrievalResult<()> {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/folder/vm/vm.vmsd")
                    .query_param("dcPath", "ha-datacenter")
                    .query_param("dsName", "datastore1");
                then.status(200).body(DESCRIPTOR);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/folder/vm/snap-2.vmem");
                then.status(200).body("memory image bytes");
            })
            .await;

        let temp_root = tempfile::tempdir().expect("temp root");
        let (service, events) = service(&server, temp_root.path());
        let mut stream = events.subscribe();
        let vm = LayoutVm::with_standard_layout();

        let record = service
            .retrieve_snapshot(&vm, "ha-datacenter", "Snap-B", None, 9)
            .await?;

        assert_eq!(record.name, "Snap-B-snap-2.vmem");
        assert_eq!(record.size_bytes, "memory image bytes".len() as u64);
        assert_eq!(record.owner_container_id, 9);
        assert!(!service.is_degraded());
        assert_no_leftover_run_dirs(temp_root.path());

        let mut kinds = Vec::new();
        loop {
            let envelope = stream.next().await.expect("event expected");
            let kind = envelope.event.kind();
            kinds.push(kind);
            if kind == "retrieval_completed" {
                break;
            }
        }
        assert_eq!(kinds.first().copied(), Some("retrieval_started"));
        assert!(kinds.contains(&"retrieval_step"));
        assert!(kinds.contains(&"download_progress"));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_snapshot_fails_and_cleans_up() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/folder/vm/vm.vmsd");
                then.status(200).body(DESCRIPTOR);
            })
            .await;

        let temp_root = tempfile::tempdir().expect("temp root");
        let (service, _events) = service(&server, temp_root.path());
        let vm = LayoutVm::with_standard_layout();

        let err = service
            .retrieve_snapshot(&vm, "ha-datacenter", "Snap-C", None, 9)
            .await
            .expect_err("snapshot does not exist");
        assert!(matches!(
            err,
            RetrievalError::SnapshotNotFound { name } if name == "Snap-C"
        ));
        // business failure, not an infrastructure one
        assert!(!service.is_degraded());
        assert_no_leftover_run_dirs(temp_root.path());
    }

    #[tokio::test]
    async fn missing_descriptor_file_aborts_before_any_download() {
        let server = MockServer::start_async().await;
        let temp_root = tempfile::tempdir().expect("temp root");
        let (service, _events) = service(&server, temp_root.path());
        let vm = LayoutVm {
            layout: vec![VmFileEntry {
                kind: VmFileKind::Config,
                name: "[datastore1] vm/vm.vmx".to_string(),
                size_bytes: None,
            }],
        };

        let err = service
            .retrieve_snapshot(&vm, "ha-datacenter", "Snap-B", None, 9)
            .await
            .expect_err("no descriptor in layout");
        assert!(matches!(err, RetrievalError::DescriptorUnavailable));
        assert_no_leftover_run_dirs(temp_root.path());
    }

    #[tokio::test]
    async fn suspend_image_is_retrieved_directly() -> RetrievalResult<()> {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/folder/vm/vm.vmss");
                then.status(200).body("suspend image bytes");
            })
            .await;

        let temp_root = tempfile::tempdir().expect("temp root");
        let (service, _events) = service(&server, temp_root.path());
        let vm = LayoutVm::with_standard_layout();

        let record = service
            .retrieve_suspend_image(&vm, "ha-datacenter", 4)
            .await?;
        assert_eq!(record.name, "vm.vmss");
        assert_eq!(record.size_bytes, "suspend image bytes".len() as u64);
        assert_no_leftover_run_dirs(temp_root.path());
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_server_marks_the_service_degraded() {
        let temp_root = tempfile::tempdir().expect("temp root");
        // grab a free port and release it so connections get refused
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let address = listener.local_addr().expect("local addr");
        drop(listener);

        let config = VmvaultConfig {
            hypervisor: HypervisorConfig {
                server_address: format!("http://{address}"),
                username: "root".into(),
                password: Secret::new("secret"),
                verify_server_certificate: false,
            },
            retrieval: RetrievalConfig {
                temp_root: Some(temp_root.path().to_path_buf()),
                ..RetrievalConfig::default()
            },
        };
        let service = RetrievalService::new(
            &config,
            Arc::new(AcceptingStore),
            EventBus::new(),
            Metrics::new().expect("metrics"),
        )
        .expect("service");
        let vm = LayoutVm::with_standard_layout();

        let err = service
            .retrieve_snapshot(&vm, "ha-datacenter", "Snap-B", None, 9)
            .await
            .expect_err("server is gone");
        assert!(matches!(err, RetrievalError::Connection { .. }));
        assert!(service.is_degraded());
        assert_no_leftover_run_dirs(temp_root.path());
    }

    #[test]
    fn file_names_are_sanitised() {
        assert_eq!(sanitised_file_name("Snap B/2024"), "Snap_B_2024");
        assert_eq!(sanitised_file_name("clean-name_1.0"), "clean-name_1.0");
    }
}
