//! Admission entry point split into focused submodules.
//!
//! The `Ingestor` struct and its methods are organized by concern:
//! - [`admission`] - Request admission, quota deferral and worker dispatch
//! - [`supervisor`] - Outcome handling, alerting and the retry policy
//! - [`lifecycle`] - Graceful shutdown

mod admission;
mod lifecycle;
mod supervisor;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

use crate::alerts::{AlertSink, FanoutAlertSink};
use crate::config::Config;
use crate::error::{Error, Result, TransferFailure};
use crate::mutex::Mutex;
use crate::registry::DownloadRegistry;
use crate::storage::ObjectStore;
use crate::telemetry::{DiagnosticsProbe, SystemProbe};
use crate::types::{DownloadId, DownloadRecord, Event, TransferReport};
use crate::worker::DownloadWorker;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Result of one dispatched worker run, sent to the supervisor
pub(crate) struct Outcome {
    pub(crate) record: DownloadRecord,
    pub(crate) result: std::result::Result<TransferReport, TransferFailure>,
}

/// Per-id retry bookkeeping
#[derive(Debug, Default)]
pub(crate) struct RetryLedger {
    /// Ids whose single retry has been used (scheduled or running)
    pub(crate) retried: HashSet<DownloadId>,
    /// Ids whose scheduled retry has not fired yet; a redelivery takes it over
    pub(crate) pending_retries: HashSet<DownloadId>,
    /// Ids that failed on their retry and are refused from now on
    pub(crate) permanently_failed: HashSet<DownloadId>,
}

/// Task tracking and shutdown signalling
#[derive(Clone)]
pub(crate) struct Supervision {
    /// Sender half of the outcome channel (one per dispatched worker clone)
    pub(crate) outcome_tx: mpsc::UnboundedSender<Outcome>,
    /// Worker runs and scheduled retries
    pub(crate) tasks: TaskTracker,
    /// Cancelled when shutdown starts; wakes deferred admissions and pending retries
    pub(crate) shutdown: CancellationToken,
    /// Cancelled once in-flight tasks drained; the supervisor then empties its queue and exits
    pub(crate) supervisor_stop: CancellationToken,
    /// Handle of the supervisor task, taken by shutdown
    pub(crate) supervisor: Arc<Mutex<Option<JoinHandle<()>>>>,
    /// Flag to indicate whether new submissions are accepted (false during shutdown)
    pub(crate) accepting_new: Arc<AtomicBool>,
    /// Retry policy state
    pub(crate) ledger: Arc<Mutex<RetryLedger>>,
}

/// Main ingestion instance (cloneable - all fields are Arc-wrapped)
#[derive(Clone)]
pub struct Ingestor {
    /// Configuration (wrapped in Arc for sharing across tasks)
    pub(crate) config: Arc<Config>,
    /// In-flight ledger shared with the workers
    pub(crate) registry: Arc<DownloadRegistry>,
    /// Transfer executor
    pub(crate) worker: Arc<DownloadWorker>,
    /// Failure alert destination (trait object for pluggable implementations)
    pub(crate) alerts: Arc<dyn AlertSink>,
    /// Event broadcast channel sender (multiple subscribers supported)
    pub(crate) event_tx: broadcast::Sender<Event>,
    /// Task tracking and retry state
    pub(crate) supervision: Supervision,
}

impl Ingestor {
    /// Create a new Ingestor reading objects from `store`
    ///
    /// This initializes all core components:
    /// - Validates the configuration and creates the download directory
    /// - Builds alert sinks from `config.alerts`
    /// - Sets up the event broadcast channel
    /// - Starts the supervisor task that observes every transfer outcome
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for invalid settings and [`Error::Io`] if the
    /// download directory cannot be created.
    pub async fn new(config: Config, store: Arc<dyn ObjectStore>) -> Result<Self> {
        let alerts: Arc<dyn AlertSink> = Arc::new(FanoutAlertSink::from_config(&config.alerts));
        let probe: Arc<dyn DiagnosticsProbe> =
            Arc::new(SystemProbe::new(config.download_dir.clone()));
        Self::with_components(config, store, alerts, probe).await
    }

    /// Create an Ingestor with explicit alert sink and diagnostics probe
    ///
    /// # Errors
    ///
    /// Same as [`Ingestor::new`].
    pub async fn with_components(
        config: Config,
        store: Arc<dyn ObjectStore>,
        alerts: Arc<dyn AlertSink>,
        probe: Arc<dyn DiagnosticsProbe>,
    ) -> Result<Self> {
        config.validate()?;

        tokio::fs::create_dir_all(&config.download_dir)
            .await
            .map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!(
                        "Failed to create download directory '{}': {}",
                        config.download_dir.display(),
                        e
                    ),
                ))
            })?;

        let (event_tx, _rx) = broadcast::channel(config.event_channel_capacity);
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();

        let registry = Arc::new(DownloadRegistry::new(config.quota_bytes));
        let worker = Arc::new(DownloadWorker::new(
            store.clone(),
            registry.clone(),
            probe,
            &config,
        ));

        let supervision = Supervision {
            outcome_tx,
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            supervisor_stop: CancellationToken::new(),
            supervisor: Arc::new(Mutex::new(None)),
            accepting_new: Arc::new(AtomicBool::new(true)),
            ledger: Arc::new(Mutex::new(RetryLedger::default())),
        };

        tracing::info!(
            download_dir = %config.download_dir.display(),
            quota_bytes = config.quota_bytes,
            store = store.name(),
            alert_sink = alerts.name(),
            "ingestor starting"
        );

        let ingestor = Self {
            config: Arc::new(config),
            registry,
            worker,
            alerts,
            event_tx,
            supervision,
        };

        let handle = ingestor.spawn_supervisor(outcome_rx);
        ingestor
            .supervision
            .supervisor
            .with_lock(|slot| *slot = Some(handle))
            .await;

        Ok(ingestor)
    }

    /// Subscribe to ingestion events
    ///
    /// Returns a receiver that gets all events emitted after this call. Slow
    /// subscribers lose the oldest events once the channel capacity is reached.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Shared registry handle for inspection
    pub fn registry(&self) -> Arc<DownloadRegistry> {
        self.registry.clone()
    }

    /// Effective configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Whether submissions are currently accepted
    pub fn is_accepting(&self) -> bool {
        self.supervision.accepting_new.load(Ordering::SeqCst)
    }

    /// Emit an event to all subscribers
    ///
    /// Having no subscribers is not an error.
    pub(crate) fn emit_event(&self, event: Event) {
        self.event_tx.send(event).ok();
    }
}
