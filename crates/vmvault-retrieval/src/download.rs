//! Authenticated streamed downloads with adaptive chunk sizing.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tracing::debug;
use vmvault_config::HypervisorConfig;
use vmvault_telemetry::Metrics;

use crate::error::{RetrievalError, RetrievalResult};
use crate::path::FileUrl;

/// Files up to this size are written as a single chunk.
pub const BIG_FILE_THRESHOLD_BYTES: u64 = 20 * 1024 * 1024;

/// Bigger files are written in chunks of this percentage of the total, so a
/// full download reports progress exactly ten times.
const CHUNK_PERCENT: u64 = 10;

/// Result of a completed download.
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    /// Total bytes written to `local_path`.
    pub bytes_written: u64,
    /// Where the file landed.
    pub local_path: PathBuf,
}

/// Downloads datastore files over authenticated HTTPS.
#[derive(Clone)]
pub struct Downloader {
    client: reqwest::Client,
    username: String,
    password: String,
    deadline: Option<Duration>,
    metrics: Metrics,
}

impl Downloader {
    /// Build a downloader from the hypervisor connection settings.
    ///
    /// # Errors
    ///
    /// Returns [`RetrievalError::Connection`] if the HTTP client cannot be
    /// constructed.
    pub fn new(
        config: &HypervisorConfig,
        deadline: Option<Duration>,
        metrics: Metrics,
    ) -> RetrievalResult<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(!config.verify_server_certificate)
            .build()
            .map_err(|source| RetrievalError::Connection { source })?;
        Ok(Self {
            client,
            username: config.username.clone(),
            password: config.password.expose().to_string(),
            deadline,
            metrics,
        })
    }

    /// Download `file_url` to `local_path`, reporting the completed fraction
    /// through `on_progress`.
    ///
    /// The total size must be advertised up front; chunk sizing depends on
    /// it. Files up to [`BIG_FILE_THRESHOLD_BYTES`] are written as one chunk,
    /// larger files in ten chunks of a tenth each. Every chunk is written,
    /// flushed, and fsynced before the next is requested, so a crash cannot
    /// lose bytes that were already reported.
    ///
    /// # Errors
    ///
    /// Fails with [`RetrievalError::Connection`] on transport errors (before
    /// or mid-stream), [`RetrievalError::HttpStatus`] on a non-success
    /// response, [`RetrievalError::ContentLengthUnavailable`] when no length
    /// is advertised (no file is written in that case), or
    /// [`RetrievalError::Timeout`] when the configured deadline elapses. A
    /// mid-stream failure fails the whole download; there is no partial
    /// success.
    pub async fn download<F>(
        &self,
        file_url: &FileUrl,
        local_path: &Path,
        on_progress: F,
    ) -> RetrievalResult<DownloadOutcome>
    where
        F: FnMut(f64),
    {
        match self.deadline {
            Some(limit) => timeout(limit, self.fetch(file_url, local_path, on_progress))
                .await
                .map_err(|_| RetrievalError::Timeout {
                    operation: "download",
                    limit,
                })?,
            None => self.fetch(file_url, local_path, on_progress).await,
        }
    }

    async fn fetch<F>(
        &self,
        file_url: &FileUrl,
        local_path: &Path,
        mut on_progress: F,
    ) -> RetrievalResult<DownloadOutcome>
    where
        F: FnMut(f64),
    {
        debug!(url = %file_url.url, path = %local_path.display(), "downloading datastore file");

        let response = self
            .client
            .get(&file_url.url)
            .query(&[
                ("dcPath", file_url.datacenter.as_str()),
                ("dsName", file_url.datastore.as_str()),
            ])
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|source| RetrievalError::Connection { source })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RetrievalError::HttpStatus {
                status: status.as_u16(),
            });
        }

        let total_bytes = response
            .content_length()
            .ok_or(RetrievalError::ContentLengthUnavailable)?;

        let chunk_bytes = if total_bytes > BIG_FILE_THRESHOLD_BYTES {
            total_bytes * CHUNK_PERCENT / 100
        } else {
            total_bytes
        }
        .max(1);

        let mut file = File::create(local_path)
            .await
            .map_err(|source| RetrievalError::Filesystem {
                operation: "create download file",
                source,
            })?;

        let mut stream = response.bytes_stream();
        let mut pending: Vec<u8> = Vec::new();
        let mut bytes_written: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|source| RetrievalError::Connection { source })?;
            pending.extend_from_slice(&chunk);
            while pending.len() as u64 >= chunk_bytes {
                let block: Vec<u8> = pending.drain(..chunk_bytes as usize).collect();
                write_block(&mut file, &block).await?;
                bytes_written += block.len() as u64;
                on_progress(bytes_written as f64 / total_bytes as f64);
            }
        }
        if !pending.is_empty() {
            write_block(&mut file, &pending).await?;
            bytes_written += pending.len() as u64;
            on_progress(bytes_written as f64 / total_bytes as f64);
        }

        self.metrics.add_download_bytes(bytes_written);
        Ok(DownloadOutcome {
            bytes_written,
            local_path: local_path.to_path_buf(),
        })
    }
}

async fn write_block(file: &mut File, block: &[u8]) -> RetrievalResult<()> {
    file.write_all(block)
        .await
        .map_err(|source| RetrievalError::Filesystem {
            operation: "write download chunk",
            source,
        })?;
    file.flush()
        .await
        .map_err(|source| RetrievalError::Filesystem {
            operation: "flush download chunk",
            source,
        })?;
    file.sync_all()
        .await
        .map_err(|source| RetrievalError::Filesystem {
            operation: "sync download chunk",
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use vmvault_config::Secret;

    fn hypervisor(server: &MockServer) -> HypervisorConfig {
        HypervisorConfig {
            server_address: format!("http://{}", server.address()),
            username: "root".into(),
            password: Secret::new("secret"),
            verify_server_certificate: false,
        }
    }

    fn downloader(server: &MockServer) -> Downloader {
        Downloader::new(&hypervisor(server), None, Metrics::new().expect("metrics"))
            .expect("downloader")
    }

    fn file_url(server: &MockServer, relative: &str) -> FileUrl {
        crate::path::build_file_url(
            &format!("http://{}", server.address()),
            &format!("[datastore1] {relative}"),
            "ha-datacenter",
        )
    }

    #[tokio::test]
    async fn big_file_reports_ten_fractions() -> RetrievalResult<()> {
        let server = MockServer::start_async().await;
        let body = vec![0x5a_u8; 25 * 1024 * 1024];
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/folder/vm/vm-Snapshot2.vmem")
                    .query_param("dcPath", "ha-datacenter")
                    .query_param("dsName", "datastore1");
                then.status(200).body(&body);
            })
            .await;

        let dir = tempfile::tempdir().expect("temp dir");
        let local = dir.path().join("vm-Snapshot2.vmem");
        let mut fractions = Vec::new();

        let outcome = downloader(&server)
            .download(
                &file_url(&server, "vm/vm-Snapshot2.vmem"),
                &local,
                |fraction| fractions.push(fraction),
            )
            .await?;

        mock.assert_async().await;
        assert_eq!(outcome.bytes_written, body.len() as u64);
        assert_eq!(fractions.len(), 10);
        for (i, fraction) in fractions.iter().enumerate() {
            let expected = (i as f64 + 1.0) / 10.0;
            assert!(
                (fraction - expected).abs() < 1e-9,
                "fraction {i} was {fraction}"
            );
        }
        assert!((fractions[9] - 1.0).abs() < 1e-9);
        assert_eq!(
            std::fs::metadata(&local).expect("downloaded file").len(),
            body.len() as u64
        );
        Ok(())
    }

    #[tokio::test]
    async fn small_file_is_a_single_chunk() -> RetrievalResult<()> {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/folder/vm/vm.vmsd");
                then.status(200).body("descriptor contents");
            })
            .await;

        let dir = tempfile::tempdir().expect("temp dir");
        let local = dir.path().join("vm.vmsd");
        let mut fractions = Vec::new();

        let outcome = downloader(&server)
            .download(&file_url(&server, "vm/vm.vmsd"), &local, |fraction| {
                fractions.push(fraction);
            })
            .await?;

        assert_eq!(fractions, vec![1.0]);
        assert_eq!(outcome.bytes_written, "descriptor contents".len() as u64);
        assert_eq!(
            std::fs::read_to_string(&local).expect("downloaded file"),
            "descriptor contents"
        );
        Ok(())
    }

    #[tokio::test]
    async fn non_success_status_fails() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/folder/vm/missing.vmem");
                then.status(404);
            })
            .await;

        let dir = tempfile::tempdir().expect("temp dir");
        let local = dir.path().join("missing.vmem");

        let err = downloader(&server)
            .download(&file_url(&server, "vm/missing.vmem"), &local, |_| {})
            .await
            .expect_err("404 should fail");
        assert!(matches!(err, RetrievalError::HttpStatus { status: 404 }));
        assert!(!local.exists());
    }

    #[tokio::test]
    async fn missing_content_length_writes_no_file() {
        // chunked transfer encoding advertises no total size
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let address = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut discard = [0_u8; 4096];
                use tokio::io::AsyncReadExt as _;
                let _ = socket.read(&mut discard).await;
                let response = "HTTP/1.1 200 OK\r\n\
                                Transfer-Encoding: chunked\r\n\
                                \r\n\
                                5\r\nhello\r\n0\r\n\r\n";
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });

        let dir = tempfile::tempdir().expect("temp dir");
        let local = dir.path().join("chunked.vmem");
        let url = FileUrl {
            url: format!("http://{address}/folder/chunked.vmem"),
            datacenter: "ha-datacenter".into(),
            datastore: "datastore1".into(),
        };
        let config = HypervisorConfig {
            server_address: format!("http://{address}"),
            username: "root".into(),
            password: Secret::new("secret"),
            verify_server_certificate: false,
        };
        let downloader =
            Downloader::new(&config, None, Metrics::new().expect("metrics")).expect("downloader");

        let err = downloader
            .download(&url, &local, |_| {})
            .await
            .expect_err("no content length should fail");
        assert!(matches!(err, RetrievalError::ContentLengthUnavailable));
        assert!(!local.exists());
    }
}
