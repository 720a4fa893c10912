//! Periodic expiry sweep, kept off the read path.

use super::manager::GenerationCache;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

/// Handle to a running sweeper task. Dropping it stops the task.
pub struct SweeperHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    _guard: DropGuard,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for the task to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Spawn a task that calls [`GenerationCache::sweep_expired`] every `interval`.
///
/// The first sweep runs after one full interval. Failures are logged and the
/// loop keeps going.
#[must_use = "dropping the handle stops the sweeper"]
pub fn spawn_sweeper(cache: Arc<GenerationCache>, interval: Duration) -> SweeperHandle {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let period = interval.max(Duration::from_millis(1));
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => match cache.sweep_expired().await {
                    Ok(n) => debug!(removed = n, "sweeper pass complete"),
                    Err(e) => warn!(error = %e, "sweeper pass failed"),
                },
            }
        }
    });
    SweeperHandle {
        _guard: cancel.clone().drop_guard(),
        cancel,
        task,
    }
}
