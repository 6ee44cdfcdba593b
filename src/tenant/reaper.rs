//! Background expiry sweeper.
//!
//! Sleeps for the cleanup interval, then runs one sweep in its own task so a
//! panicking sweep cannot take the loop down with it. Ends only when the
//! shutdown signal fires, its sender is dropped, or the registry is gone.

use std::sync::Weak;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::tenant::registry::TenantRegistry;

pub(crate) struct Reaper {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl Reaper {
    pub(crate) fn spawn(
        registry: Weak<TenantRegistry>,
        interval: Duration,
        backoff: Duration,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run(registry, interval, backoff, shutdown_rx));
        Self {
            shutdown_tx: Some(shutdown_tx),
            task,
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal shutdown and wait up to `timeout`, then abort.
    pub(crate) async fn stop(mut self, timeout: Duration) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        match tokio::time::timeout(timeout, &mut self.task).await {
            Ok(Ok(())) => tracing::info!("Background cleanup worker stopped"),
            Ok(Err(e)) => tracing::warn!("Background cleanup worker ended abnormally: {}", e),
            Err(_) => {
                tracing::warn!(
                    timeout_secs = timeout.as_secs(),
                    "Background cleanup worker did not stop in time, aborting"
                );
                self.task.abort();
            }
        }
    }
}

async fn run(
    registry: Weak<TenantRegistry>,
    interval: Duration,
    backoff: Duration,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let Some(registry) = registry.upgrade() else {
            tracing::debug!("Tenant registry dropped, cleanup worker exiting");
            break;
        };

        let sweep = tokio::spawn(async move { registry.cleanup_expired_instances().await });
        match sweep.await {
            Ok(evicted) => tracing::debug!(evicted, "Expiry sweep finished"),
            Err(e) => {
                tracing::error!("Error in cleanup worker: {}", e);
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }
}
