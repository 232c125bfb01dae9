//! Streams one object from storage to local disk
//!
//! A [`DownloadWorker`] owns no state of its own between runs. Each
//! [`run`](DownloadWorker::run) moves the record it was given to a terminal status
//! in the registry and either reports the transfer or escalates a classified
//! [`TransferFailure`].

use crate::config::Config;
use crate::error::{TransferError, TransferFailure};
use crate::registry::DownloadRegistry;
use crate::storage::ObjectStore;
use crate::telemetry::{DiagnosticsProbe, HostSnapshot};
use crate::types::{DownloadId, DownloadRecord, Status, TransferReport};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};

/// Read chunk size for the storage stream (64 KiB)
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// File name used when the key has no usable last segment
const FALLBACK_FILE_NAME: &str = "object";

/// Performs object-to-disk transfers
pub struct DownloadWorker {
    store: Arc<dyn ObjectStore>,
    registry: Arc<DownloadRegistry>,
    probe: Arc<dyn DiagnosticsProbe>,
    download_dir: PathBuf,
    transfer_timeout: Option<Duration>,
    write_buffer_size: usize,
}

impl DownloadWorker {
    /// Create a worker writing under `config.download_dir`
    pub fn new(
        store: Arc<dyn ObjectStore>,
        registry: Arc<DownloadRegistry>,
        probe: Arc<dyn DiagnosticsProbe>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            registry,
            probe,
            download_dir: config.download_dir.clone(),
            transfer_timeout: config.transfer_timeout,
            write_buffer_size: config.write_buffer_size,
        }
    }

    /// Directory reserved for `id`
    ///
    /// The id is percent-encoded into a single path component, so distinct ids never
    /// share a directory and no id can escape the download root.
    pub fn destination_dir(&self, id: &DownloadId) -> PathBuf {
        self.download_dir.join(encode_component(id.as_str()))
    }

    /// File the object for `id` is written to
    pub fn destination_path(&self, id: &DownloadId) -> PathBuf {
        let file_name = id
            .as_str()
            .rsplit('/')
            .next()
            .filter(|segment| !segment.is_empty())
            .map(encode_component)
            .unwrap_or_else(|| FALLBACK_FILE_NAME.to_string());
        self.destination_dir(id).join(file_name)
    }

    /// Current host telemetry from the configured probe
    pub fn snapshot(&self) -> HostSnapshot {
        self.probe.snapshot()
    }

    /// Transfer the object for `record` end to end
    ///
    /// The record must be Pending in the registry. It ends Complete on success and
    /// Error on failure; `retried` is never touched.
    ///
    /// # Errors
    ///
    /// Returns a [`TransferFailure`] carrying the classified error and a host
    /// telemetry snapshot. Any partially written file has been removed.
    pub async fn run(&self, record: &DownloadRecord) -> Result<TransferReport, TransferFailure> {
        let started = Instant::now();
        let path = self.destination_path(&record.id);

        tracing::info!(
            id = %record.id,
            content_type = %record.content_type,
            declared_bytes = record.size_bytes,
            retried = record.retried,
            store = self.store.name(),
            path = %path.display(),
            "transfer started"
        );

        let transfer = self.transfer(&record.id, &path);
        let result = match self.transfer_timeout {
            Some(after) => match tokio::time::timeout(after, transfer).await {
                Ok(result) => result,
                Err(_) => Err(TransferError::Timeout { after }),
            },
            None => transfer.await,
        };

        match result {
            Ok(bytes_written) => {
                self.finalize(&record.id, Status::Complete).await;
                let elapsed = started.elapsed();
                if bytes_written != record.size_bytes {
                    tracing::warn!(
                        id = %record.id,
                        declared_bytes = record.size_bytes,
                        bytes_written,
                        "object size differs from declared size"
                    );
                }
                tracing::info!(
                    id = %record.id,
                    bytes = bytes_written,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "transfer complete"
                );
                Ok(TransferReport {
                    id: record.id.clone(),
                    path,
                    bytes_written,
                    elapsed,
                })
            }
            Err(error) => {
                discard_partial(&path).await;
                self.finalize(&record.id, Status::Error).await;
                let snapshot = self.probe.snapshot();
                tracing::error!(
                    id = %record.id,
                    classification = %error.classification(),
                    error = %error,
                    free_disk_bytes = ?snapshot.free_disk_bytes,
                    free_memory_bytes = ?snapshot.free_memory_bytes,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "transfer failed"
                );
                Err(TransferFailure { error, snapshot })
            }
        }
    }

    /// Pipe the remote stream into the destination file
    ///
    /// Returning early from any step drops both ends, closing the stream and the
    /// file handle.
    async fn transfer(&self, id: &DownloadId, path: &Path) -> Result<u64, TransferError> {
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(TransferError::Filesystem)?;
        }

        let mut reader = self.store.open_read_stream(id.as_str()).await?;
        let file = tokio::fs::File::create(path)
            .await
            .map_err(TransferError::Filesystem)?;
        let mut writer = BufWriter::with_capacity(self.write_buffer_size, file);

        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        let mut written: u64 = 0;
        loop {
            let n = reader
                .read(&mut buf)
                .await
                .map_err(TransferError::from_read_error)?;
            if n == 0 {
                break;
            }
            writer
                .write_all(&buf[..n])
                .await
                .map_err(TransferError::Filesystem)?;
            written += n as u64;
        }

        writer.flush().await.map_err(TransferError::Filesystem)?;
        writer
            .into_inner()
            .sync_all()
            .await
            .map_err(TransferError::Filesystem)?;

        tracing::trace!(id = %id, bytes = written, "stream drained");
        Ok(written)
    }

    async fn finalize(&self, id: &DownloadId, status: Status) {
        if let Err(e) = self.registry.finish(id, status).await {
            tracing::warn!(id = %id, status = %status, error = %e, "record no longer pending in registry");
        }
    }
}

/// Percent-encode one path component; `.`, `..` and the empty string map to
/// components that percent-encoding itself never produces
fn encode_component(raw: &str) -> String {
    let encoded = urlencoding::encode(raw).into_owned();
    match encoded.as_str() {
        "" => "%".to_string(),
        "." | ".." => encoded.replace('.', "%2E"),
        _ => encoded,
    }
}

async fn discard_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!(path = %path.display(), "removed partial file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove partial file")
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ByteStream, MemoryObjectStore};
    use crate::telemetry::{NoOpProbe, SystemProbe};
    use crate::types::{DownloadRequest, SourceToken};
    use async_trait::async_trait;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tempfile::TempDir;
    use tokio::io::{AsyncRead, ReadBuf};

    struct Fixture {
        _dir: TempDir,
        registry: Arc<DownloadRegistry>,
        store: Arc<MemoryObjectStore>,
        worker: DownloadWorker,
    }

    fn fixture_with(config: impl FnOnce(&mut Config)) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config {
            download_dir: dir.path().join("downloads"),
            quota_bytes: 1 << 30,
            ..Config::default()
        };
        config(&mut cfg);

        let registry = Arc::new(DownloadRegistry::new(cfg.quota_bytes));
        let store = Arc::new(MemoryObjectStore::new());
        let worker = DownloadWorker::new(
            store.clone(),
            registry.clone(),
            Arc::new(SystemProbe::new(dir.path())),
            &cfg,
        );
        Fixture {
            _dir: dir,
            registry,
            store,
            worker,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(|_| {})
    }

    async fn pending(registry: &DownloadRegistry, id: &str, size: u64) -> DownloadRecord {
        let record = DownloadRecord::from_request(DownloadRequest::new(
            id,
            size,
            "video/mp4",
            SourceToken::new("receipt"),
        ));
        registry.add(record.clone()).await.unwrap();
        record
    }

    #[tokio::test]
    async fn completed_transfer_writes_file_and_frees_quota() {
        let f = fixture();
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        f.store.insert("videos/a.mp4", payload.clone());
        let record = pending(&f.registry, "videos/a.mp4", payload.len() as u64).await;
        assert_eq!(f.registry.aggregate_size().await, payload.len() as u64);

        let report = f.worker.run(&record).await.unwrap();

        assert_eq!(report.bytes_written, payload.len() as u64);
        assert_eq!(tokio::fs::read(&report.path).await.unwrap(), payload);
        let stored = f.registry.get(&record.id).await.unwrap();
        assert_eq!(stored.status, Status::Complete);
        assert!(!stored.retried);

        f.registry.reconcile(&record.id).await.unwrap();
        assert_eq!(f.registry.aggregate_size().await, 0);
        assert_eq!(f.registry.usage().await.records, 0);
    }

    #[tokio::test]
    async fn stream_error_after_n_bytes_aborts_write() {
        let f = fixture();
        f.store
            .insert_truncated("broken", vec![7u8; 150_000], "connection reset by peer");
        let record = pending(&f.registry, "broken", 300_000).await;

        let failure = f.worker.run(&record).await.unwrap_err();

        assert_eq!(failure.classification(), "network");
        assert!(failure.snapshot.free_disk_bytes.is_some());
        assert!(
            !f.worker.destination_path(&record.id).exists(),
            "partial file must be removed"
        );
        let stored = f.registry.get(&record.id).await.unwrap();
        assert_eq!(stored.status, Status::Error);
        assert!(!stored.retried, "worker must not decide retries");
        assert_eq!(f.registry.aggregate_size().await, 0);
    }

    #[tokio::test]
    async fn missing_object_is_storage_service_error() {
        let f = fixture();
        let record = pending(&f.registry, "nope", 10).await;

        let failure = f.worker.run(&record).await.unwrap_err();

        assert_eq!(failure.classification(), "NoSuchKey");
        assert!(matches!(
            failure.error,
            TransferError::StorageService { .. }
        ));
        assert_eq!(
            f.registry.get(&record.id).await.unwrap().status,
            Status::Error
        );
    }

    #[tokio::test]
    async fn unwritable_destination_is_filesystem_error() {
        let f = fixture();
        // A regular file where the download root should be.
        tokio::fs::write(&f.worker.download_dir, b"not a directory")
            .await
            .unwrap();
        f.store.insert("k", b"data".to_vec());
        let record = pending(&f.registry, "k", 4).await;

        let failure = f.worker.run(&record).await.unwrap_err();

        assert_eq!(failure.classification(), "filesystem");
    }

    #[tokio::test]
    async fn stalled_stream_hits_deadline() {
        let f = fixture_with(|c| c.transfer_timeout = Some(Duration::from_millis(50)));
        f.store.insert_stalled("slow", vec![1u8; 1024]);
        let record = pending(&f.registry, "slow", 4096).await;

        let failure = f.worker.run(&record).await.unwrap_err();

        assert!(matches!(failure.error, TransferError::Timeout { .. }));
        assert_eq!(failure.classification(), "timeout");
        assert!(!f.worker.destination_path(&record.id).exists());
    }

    /// Store whose stream fails with a provider error wrapped in the io::Error
    struct ThrottlingStore;

    struct ThrottledReader {
        sent: bool,
    }

    impl AsyncRead for ThrottledReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            if !self.sent {
                self.sent = true;
                buf.put_slice(b"partial");
                return Poll::Ready(Ok(()));
            }
            Poll::Ready(Err(std::io::Error::other(TransferError::StorageService {
                code: "SlowDown".to_string(),
                message: "Please reduce your request rate.".to_string(),
            })))
        }
    }

    #[async_trait]
    impl ObjectStore for ThrottlingStore {
        async fn open_read_stream(&self, _key: &str) -> Result<ByteStream, TransferError> {
            Ok(Box::pin(ThrottledReader { sent: false }))
        }

        fn name(&self) -> &'static str {
            "throttling"
        }
    }

    #[tokio::test]
    async fn provider_code_survives_mid_stream_failure() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            download_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let registry = Arc::new(DownloadRegistry::new(1000));
        let worker = DownloadWorker::new(
            Arc::new(ThrottlingStore),
            registry.clone(),
            Arc::new(NoOpProbe),
            &config,
        );
        let record = pending(&registry, "hot-key", 100).await;

        let failure = worker.run(&record).await.unwrap_err();

        assert_eq!(failure.classification(), "SlowDown");
        assert_eq!(failure.snapshot, HostSnapshot::default());
    }

    #[test]
    fn destinations_are_distinct_and_contained() {
        let f = fixture();
        let root = f.worker.download_dir.clone();

        let ids = ["a/b", "a_b", "a%2Fb", "..", ".", "../../etc/passwd", "dir/"];
        let dirs: Vec<PathBuf> = ids
            .iter()
            .map(|id| f.worker.destination_dir(&DownloadId::new(*id)))
            .collect();

        for dir in &dirs {
            assert_eq!(dir.parent(), Some(root.as_path()), "{dir:?} escapes root");
        }
        let mut unique = dirs.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), dirs.len(), "ids collided: {dirs:?}");

        assert!(
            f.worker
                .destination_path(&DownloadId::new("dir/"))
                .ends_with(FALLBACK_FILE_NAME)
        );
        assert!(
            f.worker
                .destination_path(&DownloadId::new("videos/clip.mp4"))
                .ends_with("clip.mp4")
        );
    }
}
