//! Retrieval of hypervisor-side artifact files.
//!
//! Turns "retrieve the memory image of snapshot X" into a stored artifact:
//! bracketed datastore paths are parsed and turned into download URLs, the
//! snapshot descriptor is fetched and resolved to a backing file name, the
//! file is downloaded in durable chunks, and the result is handed to the
//! content-addressed artifact store. Every run owns a scoped temp directory
//! that is removed on all exit paths.

mod artifact;
mod descriptor;
mod download;
mod error;
mod path;
mod pipeline;

pub use artifact::ArtifactTransfer;
pub use descriptor::resolve_snapshot_file;
pub use download::{BIG_FILE_THRESHOLD_BYTES, DownloadOutcome, Downloader};
pub use error::{RetrievalError, RetrievalResult};
pub use path::{
    DEFAULT_DATACENTER, FileUrl, ParsedVmPath, build_file_url, file_name_from_url, parse_vm_path,
};
pub use pipeline::{RetrievalService, SNAPSHOT_FILE_TYPE, SUSPEND_FILE_TYPE};
