//! Configuration types for blob-ingest

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for [`Ingestor`](crate::Ingestor)
///
/// Every field has a default, so an empty JSON object is a valid configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Root directory for downloaded objects (default: "./downloads")
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    /// Maximum bytes allowed in flight at once (default: 10 GiB)
    #[serde(default = "default_quota_bytes")]
    pub quota_bytes: u64,

    /// Per-transfer deadline (default: none, a stalled stream waits for the transport)
    #[serde(default, with = "optional_duration_serde")]
    pub transfer_timeout: Option<Duration>,

    /// Size of the buffered file writer (default: 1 MiB)
    #[serde(default = "default_write_buffer_size")]
    pub write_buffer_size: usize,

    /// How long shutdown waits for in-flight transfers (default: 30 seconds)
    #[serde(default = "default_shutdown_timeout", with = "duration_serde")]
    pub shutdown_timeout: Duration,

    /// Capacity of the event broadcast channel (default: 1000)
    #[serde(default = "default_event_capacity")]
    pub event_channel_capacity: usize,

    /// Quota gate behavior
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Single-retry policy
    #[serde(default)]
    pub retry: RetryPolicyConfig,

    /// Failure alerting
    #[serde(default)]
    pub alerts: AlertConfig,

    /// HTTP object store settings
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            quota_bytes: default_quota_bytes(),
            transfer_timeout: None,
            write_buffer_size: default_write_buffer_size(),
            shutdown_timeout: default_shutdown_timeout(),
            event_channel_capacity: default_event_capacity(),
            admission: AdmissionConfig::default(),
            retry: RetryPolicyConfig::default(),
            alerts: AlertConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Config {
    /// Parse and validate a JSON configuration
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON configuration file
    pub async fn from_json_file(path: &Path) -> Result<Self> {
        let json = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to read config file '{}': {}", path.display(), e),
            ))
        })?;
        Self::from_json_str(&json)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.quota_bytes == 0 {
            return Err(config_error("quota_bytes must be greater than 0", "quota_bytes"));
        }
        if self.write_buffer_size == 0 {
            return Err(config_error(
                "write_buffer_size must be greater than 0",
                "write_buffer_size",
            ));
        }
        if self.event_channel_capacity == 0 {
            return Err(config_error(
                "event_channel_capacity must be greater than 0",
                "event_channel_capacity",
            ));
        }
        if self.transfer_timeout.is_some_and(|t| t.is_zero()) {
            return Err(config_error(
                "transfer_timeout must be positive when set",
                "transfer_timeout",
            ));
        }

        let backoff = &self.admission.backoff;
        if !backoff.backoff_multiplier.is_finite() || backoff.backoff_multiplier < 1.0 {
            return Err(config_error(
                "backoff_multiplier must be a finite number of at least 1.0",
                "admission.backoff.backoff_multiplier",
            ));
        }
        if backoff.initial_delay.is_zero() || backoff.initial_delay > backoff.max_delay {
            return Err(config_error(
                "initial_delay must be positive and not exceed max_delay",
                "admission.backoff.initial_delay",
            ));
        }

        for webhook in &self.alerts.webhooks {
            if !(webhook.url.starts_with("http://") || webhook.url.starts_with("https://")) {
                return Err(config_error(
                    format!("webhook url '{}' must be http(s)", webhook.url),
                    "alerts.webhooks.url",
                ));
            }
        }

        if !self.storage.base_url.is_empty()
            && !(self.storage.base_url.starts_with("http://")
                || self.storage.base_url.starts_with("https://"))
        {
            return Err(config_error(
                format!("storage base_url '{}' must be http(s)", self.storage.base_url),
                "storage.base_url",
            ));
        }

        Ok(())
    }
}

fn config_error(message: impl Into<String>, key: &str) -> Error {
    Error::Config {
        message: message.into(),
        key: Some(key.to_string()),
    }
}

/// Quota gate behavior
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Longest a request waits for capacity before `QuotaExceeded` is returned
    /// (default: 300 seconds, `null` waits until capacity frees or shutdown)
    #[serde(
        default = "default_admission_max_wait",
        with = "optional_duration_serde"
    )]
    pub max_wait: Option<Duration>,

    /// Re-poll schedule while waiting for capacity
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_wait: default_admission_max_wait(),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Exponential backoff schedule
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// First delay (default: 250 ms)
    #[serde(default = "default_initial_delay", with = "duration_millis_serde")]
    pub initial_delay: Duration,

    /// Delay ceiling (default: 10 seconds)
    #[serde(default = "default_max_delay", with = "duration_millis_serde")]
    pub max_delay: Duration,

    /// Multiplier applied after each wait (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Single-retry policy for failed transfers
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    /// Re-admit a failed id once (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Pause before the retry attempt (default: 5 seconds)
    #[serde(default = "default_retry_delay", with = "duration_serde")]
    pub retry_delay: Duration,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retry_delay: default_retry_delay(),
        }
    }
}

/// Failure alerting
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Webhooks notified on every failed transfer
    #[serde(default)]
    pub webhooks: Vec<WebhookConfig>,

    /// Also log alerts at error level (default: true)
    #[serde(default = "default_true")]
    pub log_alerts: bool,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            webhooks: Vec::new(),
            log_alerts: true,
        }
    }
}

/// Webhook configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// URL to POST to
    pub url: String,

    /// Optional authentication header value
    #[serde(default)]
    pub auth_header: Option<String>,

    /// Timeout for webhook requests (default: 30 seconds)
    #[serde(default = "default_webhook_timeout", with = "duration_serde")]
    pub timeout: Duration,
}

/// HTTP object store settings
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base URL objects are addressed under; the key is appended as a path
    #[serde(default)]
    pub base_url: String,

    /// Optional `Authorization` header value
    #[serde(default)]
    pub auth_header: Option<String>,

    /// Timeout for establishing the connection (default: none)
    #[serde(default, with = "optional_duration_serde")]
    pub connect_timeout: Option<Duration>,
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_quota_bytes() -> u64 {
    10 * 1024 * 1024 * 1024
}

fn default_write_buffer_size() -> usize {
    1024 * 1024
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_event_capacity() -> usize {
    1000
}

fn default_admission_max_wait() -> Option<Duration> {
    Some(Duration::from_secs(300))
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(250)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_webhook_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_true() -> bool {
    true
}

// Duration serialization helper
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Millisecond Duration serialization helper (backoff delays are sub-second)
mod duration_millis_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

// Optional Duration serialization helper
mod optional_duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<u64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}
