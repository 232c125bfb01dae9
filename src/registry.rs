//! In-memory ledger of in-flight downloads and their aggregate footprint
//!
//! The registry is the only shared mutable state of an ingestor. Every mutation
//! runs inside one critical section of the crate's FIFO [`Mutex`], so concurrent
//! admissions and completions are linearizable and the byte counter never loses an
//! update.
//!
//! Accounting rule: the aggregate size is the sum of `size_bytes` over records in
//! [`Status::Pending`]. Finalizing a record subtracts its bytes immediately; the
//! terminal record then stays visible until it is reconciled (removed).

use crate::error::{Error, Result};
use crate::mutex::Mutex;
use crate::types::{DownloadId, DownloadRecord, Status};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;

/// Point-in-time view of registry usage
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct RegistryUsage {
    /// Bytes held by Pending records
    pub in_flight_bytes: u64,
    /// Number of Pending records
    pub pending: usize,
    /// Records of any status not yet reconciled
    pub records: usize,
    /// Configured quota
    pub quota: u64,
}

#[derive(Debug, Default)]
struct RegistryState {
    // arrival order
    records: Vec<DownloadRecord>,
    in_flight: u64,
}

impl RegistryState {
    fn position(&self, id: &DownloadId) -> Option<usize> {
        self.records.iter().position(|r| &r.id == id)
    }

    fn pending_position(&self, id: &DownloadId) -> Option<usize> {
        self.records
            .iter()
            .position(|r| &r.id == id && r.status == Status::Pending)
    }

    fn pending_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.status == Status::Pending)
            .count()
    }

    /// Insert after the duplicate check, replacing a stale terminal record for the id
    fn insert(&mut self, record: DownloadRecord) -> Result<()> {
        if self.pending_position(&record.id).is_some() {
            return Err(Error::Duplicate {
                id: record.id.to_string(),
            });
        }
        if let Some(stale) = self.position(&record.id) {
            self.records.remove(stale);
        }
        if record.status == Status::Pending {
            self.in_flight = self.in_flight.saturating_add(record.size_bytes);
        }
        self.records.push(record);
        Ok(())
    }
}

/// Authoritative bookkeeping of in-flight downloads
#[derive(Debug)]
pub struct DownloadRegistry {
    quota: u64,
    state: Mutex<RegistryState>,
    capacity: Notify,
}

impl DownloadRegistry {
    /// Create an empty registry with a byte quota
    pub fn new(quota: u64) -> Self {
        Self {
            quota,
            state: Mutex::new(RegistryState::default()),
            capacity: Notify::new(),
        }
    }

    /// Configured quota in bytes
    pub fn quota(&self) -> u64 {
        self.quota
    }

    /// Register a record without consulting the quota
    ///
    /// # Errors
    ///
    /// [`Error::Duplicate`] if a Pending record with the same id exists; the
    /// registry is left unchanged.
    pub async fn add(&self, record: DownloadRecord) -> Result<()> {
        let id = record.id.clone();
        let size = record.size_bytes;
        self.state.with_lock(|state| state.insert(record)).await?;
        tracing::debug!(id = %id, bytes = size, "registered download");
        Ok(())
    }

    /// Register a record only if it is not a duplicate and fits in the quota
    ///
    /// The duplicate check, the quota check and the insert happen in one critical
    /// section.
    ///
    /// # Errors
    ///
    /// - [`Error::ExceedsQuota`] if the object alone is larger than the quota
    /// - [`Error::Duplicate`] if a Pending record with the same id exists
    /// - [`Error::QuotaExceeded`] if admitting it now would exceed the quota
    pub async fn try_admit(&self, record: DownloadRecord) -> Result<()> {
        if record.size_bytes > self.quota {
            return Err(Error::ExceedsQuota {
                requested: record.size_bytes,
                quota: self.quota,
            });
        }

        let quota = self.quota;
        let id = record.id.clone();
        let size = record.size_bytes;
        let in_flight = self
            .state
            .with_lock(|state| {
                if state.pending_position(&record.id).is_some() {
                    return Err(Error::Duplicate {
                        id: record.id.to_string(),
                    });
                }
                if state.in_flight.saturating_add(record.size_bytes) > quota {
                    return Err(Error::QuotaExceeded {
                        requested: record.size_bytes,
                        in_flight: state.in_flight,
                        quota,
                    });
                }
                state.insert(record)?;
                Ok(state.in_flight)
            })
            .await?;

        tracing::debug!(id = %id, bytes = size, in_flight, quota, "admitted download");
        Ok(())
    }

    /// Move a Pending record to a terminal status and release its bytes
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if no Pending record with this id exists (it was removed
    /// or already finalized).
    pub async fn finish(&self, id: &DownloadId, status: Status) -> Result<DownloadRecord> {
        if !status.is_terminal() {
            return Err(Error::Other(format!(
                "cannot finish download {id} with non-terminal status {status}"
            )));
        }

        let finished = self
            .state
            .with_lock(|state| {
                let pos = state
                    .pending_position(id)
                    .ok_or_else(|| Error::NotFound(id.to_string()))?;
                let record = &mut state.records[pos];
                record.status = status;
                let snapshot = record.clone();
                state.in_flight = state.in_flight.saturating_sub(snapshot.size_bytes);
                Ok::<_, Error>(snapshot)
            })
            .await?;

        self.capacity.notify_waiters();
        Ok(finished)
    }

    /// Remove the record for `id`, whatever its status
    ///
    /// Absent ids are a no-op. Bytes are subtracted only if the record was still
    /// Pending.
    pub async fn remove(&self, id: &DownloadId) -> Option<DownloadRecord> {
        let removed = self
            .state
            .with_lock(|state| {
                let pos = state.position(id)?;
                let record = state.records.remove(pos);
                if record.status == Status::Pending {
                    state.in_flight = state.in_flight.saturating_sub(record.size_bytes);
                }
                Some(record)
            })
            .await;

        if removed.as_ref().is_some_and(|r| r.status == Status::Pending) {
            self.capacity.notify_waiters();
        }
        removed
    }

    /// Remove the record for `id` only if it reached a terminal status
    ///
    /// A Pending record (for example a newer admission of the same id) is left alone.
    pub async fn reconcile(&self, id: &DownloadId) -> Option<DownloadRecord> {
        self.state
            .with_lock(|state| {
                let pos = state.position(id)?;
                if state.records[pos].status.is_terminal() {
                    Some(state.records.remove(pos))
                } else {
                    None
                }
            })
            .await
    }

    /// Total bytes held by Pending records
    pub async fn aggregate_size(&self) -> u64 {
        self.state.with_lock(|state| state.in_flight).await
    }

    /// Number of Pending records
    pub async fn count(&self) -> usize {
        self.state.with_lock(|state| state.pending_count()).await
    }

    /// Whether admitting `size_bytes` more would exceed the quota
    pub async fn would_exceed_quota(&self, size_bytes: u64) -> bool {
        let quota = self.quota;
        self.state
            .with_lock(|state| state.in_flight.saturating_add(size_bytes) > quota)
            .await
    }

    /// Consistent usage figures taken in one critical section
    pub async fn usage(&self) -> RegistryUsage {
        let quota = self.quota;
        self.state
            .with_lock(|state| RegistryUsage {
                in_flight_bytes: state.in_flight,
                pending: state.pending_count(),
                records: state.records.len(),
                quota,
            })
            .await
    }

    /// Copy of the record for `id`
    pub async fn get(&self, id: &DownloadId) -> Option<DownloadRecord> {
        self.state
            .with_lock(|state| state.position(id).map(|pos| state.records[pos].clone()))
            .await
    }

    /// Copies of all records in arrival order
    pub async fn snapshot(&self) -> Vec<DownloadRecord> {
        self.state.with_lock(|state| state.records.clone()).await
    }

    /// Future resolved the next time Pending bytes are released
    ///
    /// Create (and `enable`) it *before* checking the quota so a release that
    /// happens in between is not missed.
    pub fn capacity_changed(&self) -> Notified<'_> {
        self.capacity.notified()
    }
}
