//! Out-of-band failure alerts
//!
//! Alerts are best effort: a sink that fails is logged and reported as
//! [`Event::AlertFailed`](crate::Event::AlertFailed), but never changes the outcome
//! recorded for the transfer.

use crate::config::{AlertConfig, WebhookConfig};
use crate::error::{Error, Result};
use crate::telemetry::HostSnapshot;
use crate::types::DownloadId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Alert payload describing a failed transfer
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Alert {
    /// Object id
    pub id: DownloadId,
    /// One-line summary
    pub summary: String,
    /// Error classification code
    pub classification: String,
    /// Error message
    pub message: String,
    /// Whether the failed attempt was already the retry
    pub retried: bool,
    /// Whether the id will not be attempted again
    pub terminal: bool,
    /// Host telemetry at failure time
    pub snapshot: HostSnapshot,
    /// Unix timestamp (seconds)
    pub timestamp: i64,
}

impl Alert {
    /// Build an alert stamped with the current time
    pub fn new(
        id: DownloadId,
        classification: impl Into<String>,
        message: impl Into<String>,
        retried: bool,
        terminal: bool,
        snapshot: HostSnapshot,
    ) -> Self {
        let classification = classification.into();
        let summary = if terminal {
            format!("download {id} failed permanently ({classification})")
        } else {
            format!("download {id} failed ({classification})")
        };
        Self {
            id,
            summary,
            classification,
            message: message.into(),
            retried,
            terminal,
            snapshot,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

/// Destination for failure alerts
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Deliver an alert
    ///
    /// # Errors
    ///
    /// Returns [`Error::Alert`] if delivery failed. Callers log the error and move on.
    async fn notify(&self, alert: &Alert) -> Result<()>;

    /// Human-readable name for logging
    fn name(&self) -> &'static str;
}

/// Sink that writes alerts to the log at error level
#[derive(Clone, Copy, Debug, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn notify(&self, alert: &Alert) -> Result<()> {
        tracing::error!(
            id = %alert.id,
            classification = %alert.classification,
            retried = alert.retried,
            terminal = alert.terminal,
            free_disk_bytes = ?alert.snapshot.free_disk_bytes,
            free_memory_bytes = ?alert.snapshot.free_memory_bytes,
            error = %alert.message,
            "{}",
            alert.summary
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// Sink that POSTs the alert as JSON to a webhook
#[derive(Clone, Debug)]
pub struct WebhookAlertSink {
    client: reqwest::Client,
    webhook: WebhookConfig,
}

impl WebhookAlertSink {
    /// Create a sink for one webhook
    pub fn new(webhook: WebhookConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook,
        }
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn notify(&self, alert: &Alert) -> Result<()> {
        let mut request = self
            .client
            .post(&self.webhook.url)
            .json(alert)
            .timeout(self.webhook.timeout);

        if let Some(auth) = &self.webhook.auth_header {
            request = request.header("Authorization", auth);
        }

        let url = &self.webhook.url;
        let timeout = self.webhook.timeout;
        match tokio::time::timeout(timeout, request.send()).await {
            Ok(Ok(response)) => {
                if response.status().is_success() {
                    tracing::debug!(url = %url, id = %alert.id, "alert webhook sent");
                    Ok(())
                } else {
                    let error_msg = format!(
                        "Webhook returned status {}: {}",
                        response.status(),
                        response.text().await.unwrap_or_default()
                    );
                    Err(Error::Alert(error_msg))
                }
            }
            Ok(Err(e)) => Err(Error::Alert(format!("Failed to send webhook: {}", e))),
            Err(_) => Err(Error::Alert(format!(
                "Webhook timed out after {:?}",
                timeout
            ))),
        }
    }

    fn name(&self) -> &'static str {
        "webhook"
    }
}

/// Sink that forwards every alert to several sinks
///
/// All sinks are attempted even if one fails; the failures are joined into a
/// single error.
#[derive(Clone, Default)]
pub struct FanoutAlertSink {
    sinks: Vec<Arc<dyn AlertSink>>,
}

impl FanoutAlertSink {
    /// Combine sinks
    pub fn new(sinks: Vec<Arc<dyn AlertSink>>) -> Self {
        Self { sinks }
    }

    /// Build the sinks described by configuration
    pub fn from_config(config: &AlertConfig) -> Self {
        let mut sinks: Vec<Arc<dyn AlertSink>> = Vec::new();
        if config.log_alerts {
            sinks.push(Arc::new(LogAlertSink));
        }
        for webhook in &config.webhooks {
            sinks.push(Arc::new(WebhookAlertSink::new(webhook.clone())));
        }
        Self { sinks }
    }

    /// Number of configured sinks
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Whether no sink is configured
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl AlertSink for FanoutAlertSink {
    async fn notify(&self, alert: &Alert) -> Result<()> {
        let mut failures = Vec::new();
        for sink in &self.sinks {
            if let Err(e) = sink.notify(alert).await {
                tracing::warn!(sink = sink.name(), id = %alert.id, error = %e, "alert sink failed");
                failures.push(format!("{}: {}", sink.name(), e));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Alert(failures.join("; ")))
        }
    }

    fn name(&self) -> &'static str {
        "fanout"
    }
}
