//! Outcome handling for dispatched transfers.
//!
//! A single supervisor task receives every worker outcome. For each one it logs,
//! alerts on failure, applies the retry policy, reconciles the record out of the
//! registry and emits the event that hands the `source_token` back to the caller.

use crate::alerts::Alert;
use crate::error::TransferFailure;
use crate::retry::IsRetryable;
use crate::types::{DownloadRecord, Event, TransferReport};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{Ingestor, Outcome};

impl Ingestor {
    /// Start the task that observes every transfer outcome
    pub(crate) fn spawn_supervisor(
        &self,
        mut outcomes: mpsc::UnboundedReceiver<Outcome>,
    ) -> JoinHandle<()> {
        let ingestor = self.clone();
        tokio::spawn(async move {
            let stop = ingestor.supervision.supervisor_stop.clone();
            loop {
                tokio::select! {
                    biased;
                    Some(outcome) = outcomes.recv() => ingestor.handle_outcome(outcome).await,
                    _ = stop.cancelled() => break,
                }
            }

            // Outcomes sent just before the stop signal
            while let Ok(outcome) = outcomes.try_recv() {
                ingestor.handle_outcome(outcome).await;
            }
            tracing::debug!("supervisor stopped");
        })
    }

    pub(crate) async fn handle_outcome(&self, outcome: Outcome) {
        let Outcome { record, result } = outcome;
        match result {
            Ok(report) => self.on_completed(record, report).await,
            Err(failure) => self.on_failed(record, failure).await,
        }
    }

    async fn on_completed(&self, record: DownloadRecord, report: TransferReport) {
        tracing::info!(
            id = %record.id,
            bytes = report.bytes_written,
            elapsed_ms = report.elapsed.as_millis() as u64,
            retried = record.retried,
            path = %report.path.display(),
            "download complete"
        );

        self.supervision
            .ledger
            .with_lock(|ledger| {
                ledger.retried.remove(&record.id);
                ledger.pending_retries.remove(&record.id);
            })
            .await;
        self.registry.reconcile(&record.id).await;

        self.emit_event(Event::Completed {
            id: record.id,
            source_token: record.source_token,
            path: report.path,
            bytes: report.bytes_written,
        });
    }

    async fn on_failed(&self, record: DownloadRecord, failure: TransferFailure) {
        let classification = failure.classification();
        let message = failure.error.to_string();
        let will_retry = self.config.retry.enabled
            && !record.retried
            && failure.error.is_retryable()
            && self.is_accepting();

        if will_retry {
            tracing::warn!(
                id = %record.id,
                classification = %classification,
                error = %message,
                retry_in_ms = self.config.retry.retry_delay.as_millis() as u64,
                "download failed, scheduling retry"
            );
        } else {
            tracing::error!(
                id = %record.id,
                classification = %classification,
                error = %message,
                retried = record.retried,
                "download failed"
            );
        }

        self.supervision
            .ledger
            .with_lock(|ledger| {
                if will_retry {
                    ledger.retried.insert(record.id.clone());
                    ledger.pending_retries.insert(record.id.clone());
                } else if record.retried {
                    ledger.retried.remove(&record.id);
                    ledger.pending_retries.remove(&record.id);
                    ledger.permanently_failed.insert(record.id.clone());
                }
            })
            .await;

        let alert = Alert::new(
            record.id.clone(),
            classification.clone(),
            message.clone(),
            record.retried,
            !will_retry,
            failure.snapshot,
        );
        if let Err(e) = self.alerts.notify(&alert).await {
            tracing::warn!(
                id = %record.id,
                sink = self.alerts.name(),
                error = %e,
                "failed to deliver alert"
            );
            self.emit_event(Event::AlertFailed {
                id: record.id.clone(),
                error: e.to_string(),
            });
        }

        self.registry.reconcile(&record.id).await;

        self.emit_event(Event::Failed {
            id: record.id.clone(),
            source_token: record.source_token.clone(),
            classification,
            error: message,
            will_retry,
            snapshot: failure.snapshot,
        });

        if will_retry {
            self.schedule_retry(record);
        }
    }

    /// Re-admit `record` once after the configured retry delay
    ///
    /// Skipped if a redelivered request for the same id was admitted first.
    fn schedule_retry(&self, record: DownloadRecord) {
        let ingestor = self.clone();
        let delay = self.config.retry.retry_delay;

        self.supervision.tasks.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = ingestor.supervision.shutdown.cancelled() => {
                    tracing::warn!(id = %record.id, "shutdown started, retry abandoned");
                    return;
                }
            }

            // A redelivery may have used the retry meanwhile, and finished it.
            let still_due = ingestor
                .supervision
                .ledger
                .with_lock(|ledger| {
                    !ledger.permanently_failed.contains(&record.id)
                        && ledger.pending_retries.remove(&record.id)
                })
                .await;
            if !still_due {
                tracing::debug!(id = %record.id, "retry superseded by a redelivery");
                return;
            }

            let retry = record.for_retry();
            let id = retry.id.clone();
            let max_wait = ingestor.config.admission.max_wait;
            match ingestor.admit(retry, max_wait).await {
                Ok(()) => tracing::debug!(id = %id, "retry dispatched"),
                Err(e) => tracing::warn!(id = %id, error = %e, "retry could not be admitted"),
            }
        });
    }
}
