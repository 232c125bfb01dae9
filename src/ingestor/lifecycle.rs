//! Shutdown coordination.

use crate::error::Result;
use crate::types::Event;
use std::sync::atomic::Ordering;

use super::Ingestor;

impl Ingestor {
    /// Gracefully shut down the ingestor
    ///
    /// This method performs a graceful shutdown sequence:
    /// 1. Stops accepting submissions (they fail with `ShuttingDown`)
    /// 2. Wakes deferred admissions and abandons scheduled retries
    /// 3. Waits for in-flight transfers to finish, bounded by `shutdown_timeout`
    /// 4. Lets the supervisor handle the remaining outcomes, then stops it
    /// 5. Emits [`Event::Shutdown`]
    ///
    /// Calling it again is harmless.
    ///
    /// # Errors
    ///
    /// Currently always succeeds; the sequence logs and continues past any step
    /// that does not complete.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Initiating graceful shutdown");

        // 1. Stop accepting new submissions
        self.supervision
            .accepting_new
            .store(false, Ordering::SeqCst);
        tracing::info!("Stopped accepting new downloads");

        // 2. Release waiters
        self.supervision.shutdown.cancel();

        // 3. Wait for in-flight transfers with timeout
        self.supervision.tasks.close();
        let shutdown_timeout = self.config.shutdown_timeout;
        match tokio::time::timeout(shutdown_timeout, self.supervision.tasks.wait()).await {
            Ok(()) => tracing::info!("All in-flight transfers finished"),
            Err(_) => tracing::warn!(
                remaining = self.supervision.tasks.len(),
                "Timeout waiting for transfers to finish, proceeding with shutdown"
            ),
        }

        // 4. Drain and stop the supervisor
        self.supervision.supervisor_stop.cancel();
        let handle = self
            .supervision
            .supervisor
            .with_lock(|slot| slot.take())
            .await;
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            tracing::error!(error = %e, "supervisor task ended abnormally");
        }

        let usage = self.registry.usage().await;
        if usage.records > 0 {
            tracing::warn!(
                records = usage.records,
                in_flight_bytes = usage.in_flight_bytes,
                "shutting down with transfers still registered"
            );
        }

        // 5. Emit shutdown event
        self.emit_event(Event::Shutdown);

        tracing::info!("Graceful shutdown complete");
        Ok(())
    }
}
