//! Backoff schedules and transient-failure classification
//!
//! [`Backoff`] produces the exponential, optionally jittered delays used while a
//! request waits for quota. [`IsRetryable`] decides whether a failed transfer is
//! worth its single retry attempt.

use crate::config::BackoffConfig;
use crate::error::TransferError;
use rand::Rng;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (network resets, timeouts, throttling) should return `true`.
/// Permanent failures (missing object, denied access) should return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for TransferError {
    fn is_retryable(&self) -> bool {
        match self {
            TransferError::Network(_) => true,
            TransferError::Timeout { .. } => true,
            // Throttling and 5xx are transient, missing keys and auth failures are not
            TransferError::StorageService { .. } => !self.is_permanent_storage_error(),
            // A full or read-only disk needs operator action
            TransferError::Filesystem(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock
            ),
            // Unclassified failures, including worker panics
            TransferError::Unknown(_) => true,
        }
    }
}

/// Exponential backoff state
///
/// # Example
///
/// ```
/// use blob_ingest::config::BackoffConfig;
/// use blob_ingest::retry::Backoff;
/// use std::time::Duration;
///
/// let mut backoff = Backoff::new(&BackoffConfig {
///     initial_delay: Duration::from_millis(100),
///     max_delay: Duration::from_millis(300),
///     backoff_multiplier: 2.0,
///     jitter: false,
/// });
/// assert_eq!(backoff.next_delay(), Duration::from_millis(100));
/// assert_eq!(backoff.next_delay(), Duration::from_millis(200));
/// assert_eq!(backoff.next_delay(), Duration::from_millis(300));
/// ```
#[derive(Clone, Debug)]
pub struct Backoff {
    config: BackoffConfig,
    delay: Duration,
    attempt: u32,
}

impl Backoff {
    /// Start a schedule at the configured initial delay
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            config: config.clone(),
            delay: config.initial_delay,
            attempt: 0,
        }
    }

    /// Delay to wait now; advances the schedule
    pub fn next_delay(&mut self) -> Duration {
        let current = self.delay;
        self.attempt += 1;

        // Past the representable range the schedule is simply saturated.
        let next = self.delay.as_secs_f64() * self.config.backoff_multiplier;
        self.delay = Duration::try_from_secs_f64(next)
            .unwrap_or(self.config.max_delay)
            .min(self.config.max_delay);

        if self.config.jitter {
            add_jitter(current).min(self.config.max_delay.max(current))
        } else {
            current
        }
    }

    /// Number of delays handed out so far
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Restart from the initial delay
    pub fn reset(&mut self) {
        self.delay = self.config.initial_delay;
        self.attempt = 0;
    }
}

/// Add random jitter to a delay to prevent thundering herd
///
/// Jitter is uniformly distributed between 0% and 100% of the delay.
/// This means the actual delay will be between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    let jittered_secs = delay.as_secs_f64() * (1.0 + jitter_factor);
    Duration::try_from_secs_f64(jittered_secs).unwrap_or(delay)
}
