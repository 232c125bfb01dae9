//! Core types for blob-ingest

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::telemetry::HostSnapshot;

/// Identifier of an object being ingested; also its storage key
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DownloadId(pub String);

impl DownloadId {
    /// Create a new DownloadId
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id as the storage key
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DownloadId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for DownloadId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl PartialEq<str> for DownloadId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for DownloadId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

impl std::fmt::Display for DownloadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque reference back to the message that requested a download
///
/// The crate never interprets it. It is handed back in [`Event::Completed`] and
/// [`Event::Failed`] so the embedding application can acknowledge or release
/// the upstream message.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceToken(pub String);

impl SourceToken {
    /// Wrap an upstream receipt handle
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

/// Lifecycle state of a download record
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Admitted and transferring
    Pending,
    /// All bytes written to disk
    Complete,
    /// Transfer failed
    Error,
}

impl Status {
    /// Whether the record reached a terminal state
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Status::Pending)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Pending => "pending",
            Status::Complete => "complete",
            Status::Error => "error",
        };
        f.write_str(s)
    }
}

/// Inbound request to ingest one object
///
/// Deserializable so a consumer can decode it straight from a queue message body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRequest {
    /// Object id / storage key
    pub id: DownloadId,
    /// Declared size of the object in bytes
    pub size_bytes: u64,
    /// Advisory content type
    #[serde(default)]
    pub content_type: String,
    /// Handle of the originating message
    #[serde(default)]
    pub source_token: SourceToken,
}

impl DownloadRequest {
    /// Build a request
    pub fn new(
        id: impl Into<DownloadId>,
        size_bytes: u64,
        content_type: impl Into<String>,
        source_token: SourceToken,
    ) -> Self {
        Self {
            id: id.into(),
            size_bytes,
            content_type: content_type.into(),
            source_token,
        }
    }
}

/// One tracked download
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRecord {
    /// Object id / storage key
    pub id: DownloadId,
    /// Declared size used for quota accounting
    pub size_bytes: u64,
    /// Advisory content type
    pub content_type: String,
    /// Handle of the originating message
    pub source_token: SourceToken,
    /// Lifecycle state
    pub status: Status,
    /// Whether this is the single allowed retry for the id
    pub retried: bool,
}

impl DownloadRecord {
    /// Fresh Pending record for a first attempt
    pub fn from_request(request: DownloadRequest) -> Self {
        Self {
            id: request.id,
            size_bytes: request.size_bytes,
            content_type: request.content_type,
            source_token: request.source_token,
            status: Status::Pending,
            retried: false,
        }
    }

    /// Pending copy of this record for its one retry attempt
    pub(crate) fn for_retry(&self) -> Self {
        Self {
            status: Status::Pending,
            retried: true,
            ..self.clone()
        }
    }
}

/// Result of a successful transfer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferReport {
    /// Object id
    pub id: DownloadId,
    /// Where the bytes landed
    pub path: PathBuf,
    /// Number of bytes written
    pub bytes_written: u64,
    /// Wall time of the transfer
    pub elapsed: Duration,
}

/// Event emitted during the ingestion lifecycle
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Record registered and its transfer dispatched
    Admitted {
        /// Object id
        id: DownloadId,
        /// Declared size
        size_bytes: u64,
        /// Whether this admission is the retry attempt
        retried: bool,
    },

    /// Admission postponed because the quota would be exceeded
    Deferred {
        /// Object id
        id: DownloadId,
        /// Bytes requested
        requested: u64,
        /// Bytes currently in flight
        in_flight: u64,
        /// Configured quota
        quota: u64,
    },

    /// Request dropped at admission
    Rejected {
        /// Object id
        id: DownloadId,
        /// Why it was dropped
        reason: String,
    },

    /// Transfer finished and the file is on disk
    Completed {
        /// Object id
        id: DownloadId,
        /// Handle of the originating message (ready to acknowledge)
        source_token: SourceToken,
        /// Destination file
        path: PathBuf,
        /// Bytes written
        bytes: u64,
    },

    /// Transfer failed
    Failed {
        /// Object id
        id: DownloadId,
        /// Handle of the originating message
        source_token: SourceToken,
        /// Error classification code
        classification: String,
        /// Error message
        error: String,
        /// Whether a retry attempt has been scheduled
        will_retry: bool,
        /// Host telemetry at failure time
        snapshot: HostSnapshot,
    },

    /// Delivering an alert failed (transfer outcome unaffected)
    AlertFailed {
        /// Object id the alert was about
        id: DownloadId,
        /// Sink error
        error: String,
    },

    /// Ingestor is shutting down
    Shutdown,
}
