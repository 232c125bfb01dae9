//! Error types for blob-ingest
//!
//! This module provides:
//! - The crate-level [`Error`] returned by admission, configuration and alerting
//! - [`TransferError`], the best-effort classification of a failed object transfer
//! - [`TransferFailure`], a transfer error escalated together with host telemetry

use crate::telemetry::HostSnapshot;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for blob-ingest operations
pub type Result<T> = std::result::Result<T, Error>;

/// Storage error codes that are known to be permanent (no point retrying)
const PERMANENT_STORAGE_CODES: &[&str] = &[
    "NoSuchKey",
    "NoSuchBucket",
    "AccessDenied",
    "InvalidAccessKeyId",
    "SignatureDoesNotMatch",
    "HTTP_400",
    "HTTP_401",
    "HTTP_403",
    "HTTP_404",
    "HTTP_410",
];

/// Main error type for blob-ingest
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "quota_bytes")
        key: Option<String>,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A Pending record with the same id is already in flight
    #[error("duplicate download: {id} is already in flight")]
    Duplicate {
        /// The id that is already registered
        id: String,
    },

    /// Admitting the request now would exceed the quota (backpressure, retry later)
    #[error("quota exceeded: requested {requested} bytes with {in_flight} in flight, quota {quota}")]
    QuotaExceeded {
        /// Bytes the request needs
        requested: u64,
        /// Bytes currently held by Pending records
        in_flight: u64,
        /// Configured quota
        quota: u64,
    },

    /// The object alone is larger than the whole quota and can never be admitted
    #[error("object of {requested} bytes exceeds the quota of {quota} bytes")]
    ExceedsQuota {
        /// Bytes the request needs
        requested: u64,
        /// Configured quota
        quota: u64,
    },

    /// The id already failed on its retry and will not be attempted again
    #[error("download {id} permanently failed")]
    PermanentlyFailed {
        /// The id that failed terminally
        id: String,
    },

    /// No record with this id is registered
    #[error("download not found: {0}")]
    NotFound(String),

    /// The request cannot be ingested as given (e.g. empty id)
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Alert delivery failed
    #[error("alert delivery failed: {0}")]
    Alert(String),

    /// HTTP client error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Shutdown in progress - not accepting new downloads
    #[error("shutdown in progress: not accepting new downloads")]
    ShuttingDown,

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this error is backpressure the caller should wait out, not a failure
    pub fn is_backpressure(&self) -> bool {
        matches!(self, Error::QuotaExceeded { .. })
    }
}

/// Classification of a failed object transfer
///
/// Classification is best effort: it inspects error kinds, HTTP status codes and
/// provider error codes, and falls back to [`TransferError::Unknown`].
#[derive(Debug, Error)]
pub enum TransferError {
    /// Connection, DNS or stream-level transport failure
    #[error("network error: {0}")]
    Network(String),

    /// The storage service answered with an error
    #[error("storage service error {code}: {message}")]
    StorageService {
        /// Provider error code (e.g. "NoSuchKey") or "HTTP_<status>"
        code: String,
        /// Provider message
        message: String,
    },

    /// Local disk failure (create directory, open, write, flush)
    #[error("filesystem error: {0}")]
    Filesystem(#[source] std::io::Error),

    /// The per-transfer deadline elapsed
    #[error("transfer timed out after {after:?}")]
    Timeout {
        /// Configured deadline
        after: Duration,
    },

    /// Anything else
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl TransferError {
    /// Stable, non-empty code for diagnostics and alerts
    pub fn classification(&self) -> String {
        match self {
            TransferError::Network(_) => "network".to_string(),
            TransferError::StorageService { code, .. } if !code.is_empty() => code.clone(),
            TransferError::StorageService { .. } => "storage_service".to_string(),
            TransferError::Filesystem(_) => "filesystem".to_string(),
            TransferError::Timeout { .. } => "timeout".to_string(),
            TransferError::Unknown(_) => "unknown".to_string(),
        }
    }

    /// Whether the storage service reported a permanent condition
    pub fn is_permanent_storage_error(&self) -> bool {
        match self {
            TransferError::StorageService { code, .. } => {
                PERMANENT_STORAGE_CODES.contains(&code.as_str())
            }
            _ => false,
        }
    }

    /// Classify a `reqwest` failure
    pub fn from_reqwest(e: &reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return TransferError::StorageService {
                code: format!("HTTP_{}", status.as_u16()),
                message: e.to_string(),
            };
        }
        if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() || e.is_decode() {
            return TransferError::Network(e.to_string());
        }
        TransferError::Unknown(e.to_string())
    }

    /// Classify an error raised while reading the remote stream
    ///
    /// Storage implementations may wrap a [`TransferError`] or a `reqwest::Error` in the
    /// `io::Error` their reader yields; those are unwrapped first.
    pub fn from_read_error(e: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let kind = e.kind();
        if e.get_ref().is_some_and(|inner| inner.is::<TransferError>()) {
            if let Some(inner) = e.into_inner() {
                return match inner.downcast::<TransferError>() {
                    Ok(transfer) => *transfer,
                    Err(other) => Self::from_message(&other.to_string()),
                };
            }
            return TransferError::Unknown("empty I/O error".to_string());
        }
        if let Some(req) = e
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<reqwest::Error>())
        {
            return Self::from_reqwest(req);
        }
        match kind {
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionRefused
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::TimedOut
            | ErrorKind::UnexpectedEof => TransferError::Network(e.to_string()),
            _ => Self::from_message(&e.to_string()),
        }
    }

    /// Best-effort classification by inspecting an error message
    pub fn from_message(message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        if let Some(code) = PERMANENT_STORAGE_CODES
            .iter()
            .chain(["SlowDown", "InternalError", "ServiceUnavailable"].iter())
            .find(|code| message.contains(**code))
        {
            return TransferError::StorageService {
                code: (*code).to_string(),
                message: message.to_string(),
            };
        }
        if lower.contains("connection")
            || lower.contains("timed out")
            || lower.contains("econnreset")
            || lower.contains("dns")
            || lower.contains("socket")
        {
            return TransferError::Network(message.to_string());
        }
        TransferError::Unknown(message.to_string())
    }
}

/// A transfer error escalated together with point-in-time host telemetry
#[derive(Debug, Error)]
#[error("{error}")]
pub struct TransferFailure {
    /// What went wrong
    #[source]
    pub error: TransferError,
    /// Free disk and memory when the failure was observed
    pub snapshot: HostSnapshot,
}

impl TransferFailure {
    /// Classification code of the underlying error
    pub fn classification(&self) -> String {
        self.error.classification()
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn classification_is_never_empty() {
        let errors = [
            TransferError::Network("reset".into()),
            TransferError::StorageService {
                code: String::new(),
                message: "boom".into(),
            },
            TransferError::Filesystem(io::Error::other("disk")),
            TransferError::Timeout {
                after: Duration::from_secs(1),
            },
            TransferError::Unknown("?".into()),
        ];

        for e in &errors {
            assert!(!e.classification().is_empty(), "empty code for {e:?}");
        }
    }

    #[test]
    fn storage_code_is_the_classification() {
        let e = TransferError::StorageService {
            code: "NoSuchKey".into(),
            message: "The specified key does not exist.".into(),
        };
        assert_eq!(e.classification(), "NoSuchKey");
        assert!(e.is_permanent_storage_error());

        let transient = TransferError::StorageService {
            code: "HTTP_503".into(),
            message: "slow down".into(),
        };
        assert!(!transient.is_permanent_storage_error());
    }

    #[test]
    fn read_error_unwraps_wrapped_transfer_error() {
        let wrapped = io::Error::other(TransferError::StorageService {
            code: "AccessDenied".into(),
            message: "denied".into(),
        });

        match TransferError::from_read_error(wrapped) {
            TransferError::StorageService { code, .. } => assert_eq!(code, "AccessDenied"),
            other => panic!("expected StorageService, got {other:?}"),
        }
    }

    #[test]
    fn read_error_connection_kinds_are_network() {
        let e = io::Error::new(io::ErrorKind::ConnectionReset, "peer reset");
        assert!(matches!(
            TransferError::from_read_error(e),
            TransferError::Network(_)
        ));
    }

    #[test]
    fn message_inspection() {
        assert!(matches!(
            TransferError::from_message("read ECONNRESET"),
            TransferError::Network(_)
        ));
        match TransferError::from_message("S3 said: <Code>NoSuchBucket</Code>") {
            TransferError::StorageService { code, .. } => assert_eq!(code, "NoSuchBucket"),
            other => panic!("expected StorageService, got {other:?}"),
        }
        assert!(matches!(
            TransferError::from_message("something odd"),
            TransferError::Unknown(_)
        ));
    }

    #[test]
    fn quota_exceeded_is_backpressure() {
        let e = Error::QuotaExceeded {
            requested: 600,
            in_flight: 600,
            quota: 1000,
        };
        assert!(e.is_backpressure());
        assert!(
            !Error::Duplicate {
                id: "a".into()
            }
            .is_backpressure()
        );
        assert_eq!(
            e.to_string(),
            "quota exceeded: requested 600 bytes with 600 in flight, quota 1000"
        );
    }
}
