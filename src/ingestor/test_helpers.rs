//! Shared test helpers for creating Ingestor instances in tests.

use crate::alerts::{Alert, AlertSink};
use crate::config::{BackoffConfig, Config};
use crate::error::{Error, Result, TransferError};
use crate::ingestor::Ingestor;
use crate::mutex::Mutex;
use crate::storage::{ByteStream, MemoryObjectStore, ObjectStore};
use crate::telemetry::NoOpProbe;
use crate::types::{DownloadRequest, Event, SourceToken};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::{TempDir, tempdir};
use tokio::sync::{Semaphore, broadcast};

/// Quota used by test ingestors
pub(crate) const TEST_QUOTA: u64 = 1000;

/// Alert sink that records every alert it is given
#[derive(Default)]
pub(crate) struct RecordingAlertSink {
    alerts: Mutex<Vec<Alert>>,
    fail: bool,
}

impl RecordingAlertSink {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Records alerts but reports every delivery as failed
    pub(crate) fn failing() -> Self {
        Self {
            alerts: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub(crate) async fn alerts(&self) -> Vec<Alert> {
        self.alerts.with_lock(|alerts| alerts.clone()).await
    }
}

#[async_trait]
impl AlertSink for RecordingAlertSink {
    async fn notify(&self, alert: &Alert) -> Result<()> {
        self.alerts.with_lock(|alerts| alerts.push(alert.clone())).await;
        if self.fail {
            Err(Error::Alert("pager offline".to_string()))
        } else {
            Ok(())
        }
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

/// Store whose opens block until permits are released with [`GatedObjectStore::open`]
pub(crate) struct GatedObjectStore {
    pub(crate) inner: MemoryObjectStore,
    gate: Semaphore,
}

impl GatedObjectStore {
    pub(crate) fn new() -> Self {
        Self {
            inner: MemoryObjectStore::new(),
            gate: Semaphore::new(0),
        }
    }

    /// Let `n` blocked or future opens proceed
    pub(crate) fn open(&self, n: usize) {
        self.gate.add_permits(n);
    }
}

#[async_trait]
impl ObjectStore for GatedObjectStore {
    async fn open_read_stream(&self, key: &str) -> std::result::Result<ByteStream, TransferError> {
        match self.gate.acquire().await {
            Ok(permit) => permit.forget(),
            Err(_) => return Err(TransferError::Unknown("gate closed".to_string())),
        }
        self.inner.open_read_stream(key).await
    }

    fn name(&self) -> &'static str {
        "gated"
    }
}

/// Store that fails the first `failures` opens with a network error
pub(crate) struct FlakyObjectStore {
    pub(crate) inner: MemoryObjectStore,
    failures_left: AtomicUsize,
    opens: AtomicUsize,
}

impl FlakyObjectStore {
    pub(crate) fn new(failures: usize) -> Self {
        Self {
            inner: MemoryObjectStore::new(),
            failures_left: AtomicUsize::new(failures),
            opens: AtomicUsize::new(0),
        }
    }

    pub(crate) fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for FlakyObjectStore {
    async fn open_read_stream(&self, key: &str) -> std::result::Result<ByteStream, TransferError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            return Err(TransferError::Network("connection reset by peer".to_string()));
        }
        self.inner.open_read_stream(key).await
    }

    fn name(&self) -> &'static str {
        "flaky"
    }
}

/// Store whose opens panic
pub(crate) struct PanickingObjectStore;

#[async_trait]
impl ObjectStore for PanickingObjectStore {
    async fn open_read_stream(&self, key: &str) -> std::result::Result<ByteStream, TransferError> {
        panic!("storage client bug while opening {key}");
    }

    fn name(&self) -> &'static str {
        "panicking"
    }
}

/// Configuration tuned for fast tests, rooted in `dir`
pub(crate) fn test_config(dir: &TempDir) -> Config {
    let mut config = Config {
        download_dir: dir.path().join("downloads"),
        quota_bytes: TEST_QUOTA,
        shutdown_timeout: Duration::from_secs(5),
        ..Config::default()
    };
    config.admission.max_wait = Some(Duration::from_secs(5));
    config.admission.backoff = BackoffConfig {
        initial_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        backoff_multiplier: 2.0,
        jitter: false,
    };
    config.retry.retry_delay = Duration::from_millis(10);
    config.alerts.webhooks.clear();
    config
}

/// Helper to create a test Ingestor over `store` with a recording alert sink.
/// Returns the ingestor, the sink and the tempdir (which must be kept alive).
pub(crate) async fn create_test_ingestor_with(
    store: Arc<dyn ObjectStore>,
    configure: impl FnOnce(&mut Config),
) -> (Ingestor, Arc<RecordingAlertSink>, TempDir) {
    let temp_dir = tempdir().unwrap();
    let mut config = test_config(&temp_dir);
    configure(&mut config);

    let alerts = Arc::new(RecordingAlertSink::new());
    let ingestor = Ingestor::with_components(config, store, alerts.clone(), Arc::new(NoOpProbe))
        .await
        .unwrap();
    (ingestor, alerts, temp_dir)
}

/// Helper to create a test Ingestor over an in-memory store
pub(crate) async fn create_test_ingestor() -> (
    Ingestor,
    Arc<MemoryObjectStore>,
    Arc<RecordingAlertSink>,
    TempDir,
) {
    let store = Arc::new(MemoryObjectStore::new());
    let (ingestor, alerts, temp_dir) = create_test_ingestor_with(store.clone(), |_| {}).await;
    (ingestor, store, alerts, temp_dir)
}

/// Request with a token derived from the id
pub(crate) fn request(id: &str, size_bytes: u64) -> DownloadRequest {
    DownloadRequest::new(
        id,
        size_bytes,
        "application/octet-stream",
        SourceToken::new(format!("token-{id}")),
    )
}

/// Receive events until one matches, failing the test after five seconds
pub(crate) async fn wait_for_event(
    rx: &mut broadcast::Receiver<Event>,
    mut matches: impl FnMut(&Event) -> bool,
) -> Event {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event channel closed: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}
