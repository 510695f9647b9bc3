//! Background sync loop.
//!
//! Runs discovery, then batches until nothing eligible remains, then sleeps
//! until the next rediscovery or an explicit [`SyncEngine::request_sync`].
//! The download block is honoured before every batch and while waiting
//! between batches.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::engine::SyncEngine;

/// Back-off applied while batches make no progress.
#[derive(Debug, Clone)]
pub struct FailureBackoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for FailureBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
        }
    }
}

impl FailureBackoff {
    /// Delay after `attempt` consecutive failed batches (0-indexed).
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.multiplier.powi(attempt.min(32) as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }
}

enum Wake {
    Elapsed,
    Blocked,
    Shutdown,
}

/// Wait until downloads are unblocked. `false` on shutdown.
async fn wait_unblocked(
    blocked: &mut watch::Receiver<bool>,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    loop {
        if !*blocked.borrow_and_update() {
            return true;
        }
        debug!("Sync waiting for downloads to be unblocked");
        tokio::select! {
            changed = blocked.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
            _ = shutdown.changed() => return false,
        }
    }
}

/// Sleep for `delay`, cut short by a block or shutdown.
async fn sleep_unless_blocked(
    delay: Duration,
    blocked: &mut watch::Receiver<bool>,
    shutdown: &mut watch::Receiver<bool>,
) -> Wake {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            () = &mut sleep => return Wake::Elapsed,
            changed = blocked.changed() => {
                if changed.is_err() {
                    return Wake::Shutdown;
                }
                if *blocked.borrow_and_update() {
                    return Wake::Blocked;
                }
            }
            _ = shutdown.changed() => return Wake::Shutdown,
        }
    }
}

/// Spawn the sync loop.
pub fn spawn_sync_scheduler(
    engine: Arc<SyncEngine>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let backoff = FailureBackoff {
            initial_delay: engine.config().batch_backoff(),
            ..FailureBackoff::default()
        };
        let batch_size = engine.config().batch_size.max(1);
        let mut blocked = engine.subscribe_blocked();
        let mut failures: u32 = 0;

        info!(batch_size, "Sync scheduler started");

        loop {
            if let Err(e) = engine.discover().await {
                warn!(error = %e, "Catalog discovery failed; using the local mirror");
            }

            // Batches until nothing eligible remains.
            loop {
                if !wait_unblocked(&mut blocked, &mut shutdown).await {
                    info!("Sync scheduler shutting down");
                    return;
                }

                let delay = match engine.download_batch(batch_size).await {
                    Ok(report) if report.blocked => continue,
                    Ok(report) if report.remaining == 0 => {
                        failures = 0;
                        break;
                    }
                    Ok(report) => {
                        if report.downloaded == 0 && report.errors > 0 {
                            failures = failures.saturating_add(1);
                            backoff.delay_for_attempt(failures - 1)
                        } else {
                            failures = 0;
                            backoff.initial_delay
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Download batch failed");
                        failures = failures.saturating_add(1);
                        backoff.delay_for_attempt(failures - 1)
                    }
                };

                match sleep_unless_blocked(delay, &mut blocked, &mut shutdown).await {
                    Wake::Elapsed | Wake::Blocked => {}
                    Wake::Shutdown => {
                        info!("Sync scheduler shutting down");
                        return;
                    }
                }
            }

            debug!("Catalog mirrored; idle until rediscovery");
            tokio::select! {
                () = tokio::time::sleep(engine.config().rediscovery_interval()) => {}
                () = engine.sync_requested() => debug!("Sync requested"),
                _ = shutdown.changed() => {
                    info!("Sync scheduler shutting down");
                    return;
                }
            }
        }
    })
}
