//! # blob-ingest
//!
//! Quota-gated ingestion of objects from blob storage to local disk.
//!
//! ## Design Philosophy
//!
//! blob-ingest is designed to be:
//! - **Backpressure-aware** - Total in-flight bytes never exceed a fixed quota;
//!   requests wait for capacity instead of failing
//! - **Fire-and-forget** - Submitting returns once the transfer is registered;
//!   outcomes arrive as events
//! - **Library-first** - No CLI, purely a Rust crate for embedding in a queue
//!   consumer
//! - **Event-driven** - Every outcome carries the originating message's token so
//!   the consumer can acknowledge or release it
//!
//! ## Quick Start
//!
//! ```no_run
//! use blob_ingest::{Config, DownloadRequest, Event, HttpObjectStore, Ingestor, SourceToken};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config {
//!         quota_bytes: 2 * 1024 * 1024 * 1024,
//!         ..Default::default()
//!     };
//!     let store = Arc::new(HttpObjectStore::new("https://bucket.example.com"));
//!     let ingestor = Ingestor::new(config, store).await?;
//!
//!     // Acknowledge messages once their object is on disk
//!     let mut events = ingestor.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             if let Event::Completed { source_token, .. } = event {
//!                 println!("ack {}", source_token.0);
//!             }
//!         }
//!     });
//!
//!     ingestor
//!         .submit(DownloadRequest::new(
//!             "videos/intro.mp4",
//!             52_428_800,
//!             "video/mp4",
//!             SourceToken::new("receipt-1"),
//!         ))
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Failure alert sinks
pub mod alerts;
/// Configuration types
pub mod config;
/// Error types
pub mod error;
/// Admission entry point (decomposed into focused submodules)
pub mod ingestor;
/// Asynchronous FIFO mutex
pub mod mutex;
/// In-flight download ledger and quota accounting
pub mod registry;
/// Backoff schedules and retry classification
pub mod retry;
/// Object storage readers
pub mod storage;
/// Host diagnostics
pub mod telemetry;
/// Core types and events
pub mod types;
/// Object-to-disk transfer
pub mod worker;

// Re-export commonly used types
pub use alerts::{Alert, AlertSink, FanoutAlertSink, LogAlertSink, WebhookAlertSink};
pub use config::{AdmissionConfig, AlertConfig, Config, RetryPolicyConfig, StorageConfig};
pub use error::{Error, Result, TransferError, TransferFailure};
pub use ingestor::Ingestor;
pub use registry::{DownloadRegistry, RegistryUsage};
pub use storage::{ByteStream, HttpObjectStore, MemoryObjectStore, ObjectStore};
pub use telemetry::{DiagnosticsProbe, HostSnapshot, NoOpProbe, SystemProbe};
pub use types::{
    DownloadId, DownloadRecord, DownloadRequest, Event, SourceToken, Status, TransferReport,
};
pub use worker::DownloadWorker;

/// Helper function to run the ingestor with graceful signal handling.
///
/// Waits for a termination signal and then calls the ingestor's `shutdown()` method.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use blob_ingest::{Config, Ingestor, MemoryObjectStore, run_with_shutdown};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let ingestor = Ingestor::new(Config::default(), Arc::new(MemoryObjectStore::new())).await?;
///
///     // Run with automatic signal handling
///     run_with_shutdown(ingestor).await?;
///
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(ingestor: Ingestor) -> Result<()> {
    wait_for_signal().await;
    ingestor.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Signal registration may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
