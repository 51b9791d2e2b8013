//! Broadcast hub heartbeat: reaps sessions that stop responding.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info};

use pulse_core::{defaults, BroadcastHub};

use crate::WorkerHandle;

/// Start the heartbeat loop. Sessions with no inbound traffic for a
/// full ping cycle are terminated. The transport-level pings themselves
/// are sent by the connection handlers; this task only enforces the
/// deadline.
pub fn start_heartbeat(hub: Arc<BroadcastHub>) -> WorkerHandle {
    start_heartbeat_with(hub, Duration::from_secs(defaults::HEARTBEAT_INTERVAL_SECS))
}

/// Heartbeat with an explicit cycle, for tests.
pub fn start_heartbeat_with(hub: Arc<BroadcastHub>, cycle: Duration) -> WorkerHandle {
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
    let handle = tokio::spawn(async move {
        info!(
            subsystem = "broadcast",
            cycle_secs = cycle.as_secs(),
            "heartbeat started"
        );
        let mut ticker = tokio::time::interval(cycle);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => {
                    // One full cycle of silence is the liveness budget:
                    // a session must answer the previous ping by now.
                    let reaped = hub.reap_stale(cycle * 2);
                    if reaped > 0 {
                        debug!(subsystem = "broadcast", reaped, "reaped stale sessions");
                    }
                }
            }
        }
        info!(subsystem = "broadcast", "heartbeat stopped");
    });
    WorkerHandle::new(shutdown_tx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_heartbeat_reaps_silent_sessions() {
        let hub = Arc::new(BroadcastHub::new(8));
        let (_id, _rx) = hub.attach();
        assert_eq!(hub.session_count(), 1);

        let handle = start_heartbeat_with(hub.clone(), Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(hub.session_count(), 0);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_live_sessions() {
        let hub = Arc::new(BroadcastHub::new(8));
        let (id, _rx) = hub.attach();

        let handle = start_heartbeat_with(hub.clone(), Duration::from_millis(30));
        for _ in 0..5 {
            hub.touch(id);
            tokio::time::sleep(Duration::from_millis(15)).await;
        }
        assert_eq!(hub.session_count(), 1);
        handle.shutdown().await;
    }
}
