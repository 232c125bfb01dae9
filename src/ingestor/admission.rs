//! Request admission, quota deferral and worker dispatch.

use crate::error::{Error, Result, TransferError, TransferFailure};
use crate::retry::Backoff;
use crate::types::{DownloadRecord, DownloadRequest, Event, Status};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::time::Instant;

use super::{Ingestor, Outcome};

impl Ingestor {
    /// Admit a request and start its transfer
    ///
    /// The record is registered Pending and its transfer is dispatched in the
    /// background; this returns as soon as the record is registered and never waits
    /// for the transfer itself. Its outcome is reported as [`Event::Completed`] or
    /// [`Event::Failed`], both carrying the request's `source_token`.
    ///
    /// While admitting the request would exceed the quota, the call waits for
    /// capacity to free up (re-polling with exponential backoff) for at most
    /// `admission.max_wait`.
    ///
    /// # Errors
    ///
    /// - [`Error::Duplicate`] if the same id is already in flight
    /// - [`Error::QuotaExceeded`] if no capacity freed up within `admission.max_wait`;
    ///   leave the message for redelivery
    /// - [`Error::ExceedsQuota`] if the object is larger than the whole quota
    /// - [`Error::PermanentlyFailed`] if the id already failed on its retry
    /// - [`Error::InvalidRequest`] for an empty id
    /// - [`Error::ShuttingDown`] once shutdown has started
    pub async fn submit(&self, request: DownloadRequest) -> Result<()> {
        let record = self.prepare_record(request).await?;
        self.admit(record, self.config.admission.max_wait).await
    }

    /// Admit a request only if capacity is available right now
    ///
    /// Same as [`submit`](Self::submit) except that quota pressure returns
    /// [`Error::QuotaExceeded`] immediately instead of waiting.
    ///
    /// # Errors
    ///
    /// Same as [`submit`](Self::submit).
    pub async fn try_submit(&self, request: DownloadRequest) -> Result<()> {
        let record = self.prepare_record(request).await?;
        self.admit(record, Some(Duration::ZERO)).await
    }

    /// Turn a request into a first-attempt record, applying retry bookkeeping
    async fn prepare_record(&self, request: DownloadRequest) -> Result<DownloadRecord> {
        if !self.supervision.accepting_new.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        if request.id.as_str().is_empty() {
            return Err(Error::InvalidRequest("download id must not be empty".to_string()));
        }

        let mut record = DownloadRecord::from_request(request);
        let (blocked, retry_used) = self
            .supervision
            .ledger
            .with_lock(|ledger| {
                let blocked = ledger.permanently_failed.contains(&record.id);
                let retry_used = ledger.retried.contains(&record.id);
                if retry_used && !blocked {
                    // This delivery is the retry; the scheduled one stands down.
                    ledger.pending_retries.remove(&record.id);
                }
                (blocked, retry_used)
            })
            .await;

        if blocked {
            let error = Error::PermanentlyFailed {
                id: record.id.to_string(),
            };
            tracing::warn!(id = %record.id, "rejecting submission of permanently failed download");
            self.emit_event(Event::Rejected {
                id: record.id,
                reason: error.to_string(),
            });
            return Err(error);
        }

        // A redelivered message does not get a second retry.
        record.retried = retry_used;
        Ok(record)
    }

    /// Register `record`, deferring on quota pressure for at most `max_wait`
    ///
    /// `None` waits indefinitely. Fails with [`Error::ShuttingDown`] as soon as
    /// shutdown has started, including between quota re-checks.
    pub(crate) async fn admit(
        &self,
        record: DownloadRecord,
        max_wait: Option<Duration>,
    ) -> Result<()> {
        let started = Instant::now();
        // A wait too long to represent as an instant has no deadline.
        let deadline = max_wait.and_then(|wait| started.checked_add(wait));
        let mut backoff = Backoff::new(&self.config.admission.backoff);
        let mut deferred = false;

        loop {
            // Nothing may be dispatched once shutdown has closed the task tracker.
            if self.supervision.shutdown.is_cancelled() || !self.is_accepting() {
                tracing::debug!(id = %record.id, "shutdown started, admission abandoned");
                return Err(Error::ShuttingDown);
            }

            // Register interest before checking so a release between the check and
            // the wait is not missed.
            let capacity = self.registry.capacity_changed();
            tokio::pin!(capacity);
            capacity.as_mut().enable();

            let error = match self.registry.try_admit(record.clone()).await {
                Ok(()) => {
                    tracing::info!(
                        id = %record.id,
                        bytes = record.size_bytes,
                        retried = record.retried,
                        waited_ms = started.elapsed().as_millis() as u64,
                        "download admitted"
                    );
                    self.emit_event(Event::Admitted {
                        id: record.id.clone(),
                        size_bytes: record.size_bytes,
                        retried: record.retried,
                    });
                    self.dispatch(record);
                    return Ok(());
                }
                Err(e) => e,
            };

            match error {
                Error::QuotaExceeded {
                    requested,
                    in_flight,
                    quota,
                } => {
                    let mut wait = backoff.next_delay();
                    if let Some(deadline) = deadline {
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        if remaining.is_zero() {
                            tracing::warn!(
                                id = %record.id,
                                requested,
                                in_flight,
                                quota,
                                attempts = backoff.attempts(),
                                "quota still exceeded, leaving request for redelivery"
                            );
                            return Err(Error::QuotaExceeded {
                                requested,
                                in_flight,
                                quota,
                            });
                        }
                        wait = wait.min(remaining);
                    }

                    if !deferred {
                        deferred = true;
                        tracing::info!(
                            id = %record.id,
                            requested,
                            in_flight,
                            quota,
                            "quota exceeded, deferring admission"
                        );
                        self.emit_event(Event::Deferred {
                            id: record.id.clone(),
                            requested,
                            in_flight,
                            quota,
                        });
                    }

                    tokio::select! {
                        _ = &mut capacity => {
                            tracing::trace!(id = %record.id, "capacity released, re-checking quota");
                        }
                        _ = tokio::time::sleep(wait) => {}
                        _ = self.supervision.shutdown.cancelled() => {
                            return Err(Error::ShuttingDown);
                        }
                    }
                }
                other => {
                    tracing::warn!(id = %record.id, error = %other, "download rejected");
                    self.emit_event(Event::Rejected {
                        id: record.id.clone(),
                        reason: other.to_string(),
                    });
                    return Err(other);
                }
            }
        }
    }

    /// Start the transfer for an admitted record without waiting for it
    ///
    /// The outcome, including a panic inside the worker, always reaches the
    /// supervisor.
    pub(crate) fn dispatch(&self, record: DownloadRecord) {
        let worker = self.worker.clone();
        let registry = self.registry.clone();
        let outcome_tx = self.supervision.outcome_tx.clone();

        self.supervision.tasks.spawn(async move {
            let result = match AssertUnwindSafe(worker.run(&record)).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    tracing::error!(id = %record.id, panic = %message, "transfer task panicked");
                    if let Err(e) = registry.finish(&record.id, Status::Error).await {
                        tracing::debug!(id = %record.id, error = %e, "record already finalized");
                    }
                    Err(TransferFailure {
                        error: TransferError::Unknown(format!("worker panicked: {message}")),
                        snapshot: worker.snapshot(),
                    })
                }
            };

            let id = record.id.clone();
            if outcome_tx.send(Outcome { record, result }).is_err() {
                tracing::error!(id = %id, "supervisor stopped, transfer outcome dropped");
            }
        });
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
