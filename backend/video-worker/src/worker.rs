/// Worker loop
///
/// Each worker runs an independent serial fetch → process → ack loop over
/// its own queue adapter. Failed iterations cool down briefly so a broken
/// broker never turns into a tight loop.
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::services::processor::TaskProcessor;

/// Pause after a failed iteration
pub const ITERATION_COOLDOWN: Duration = Duration::from_millis(500);

/// Run one worker until the shutdown signal flips. An iteration in flight
/// when the signal arrives is abandoned; its message reappears on the
/// broker after the visibility window or group reclaim.
pub async fn run_worker_loop(mut processor: TaskProcessor, mut shutdown: watch::Receiver<bool>) {
    let worker_id = processor.worker_id().to_string();
    info!(worker_id = %worker_id, "worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            result = processor.run_once() => {
                if let Err(err) = result {
                    warn!(worker_id = %worker_id, error = %err, "iteration failed, cooling down");
                    tokio::time::sleep(ITERATION_COOLDOWN).await;
                }
            }
        }
    }

    info!(worker_id = %worker_id, "worker stopped");
}
