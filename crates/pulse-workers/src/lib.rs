//! # pulse-workers
//!
//! The moving parts of the pulse pipeline: the bounded ingest queue
//! with its drainer, the rolling spike detector, the periodic
//! aggregation worker that materializes incidents, and the batched AI
//! summarization worker.
//!
//! Workers are owned objects constructed once at startup; `start()`
//! hands back a [`WorkerHandle`] whose `shutdown()` lets the in-flight
//! unit of work finish before the task exits.

pub mod aggregation;
pub mod heartbeat;
pub mod queue;
pub mod spike;
pub mod summarize;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use aggregation::{AggregationConfig, AggregationWorker, RunReport};
pub use heartbeat::start_heartbeat;
pub use queue::{EnqueueOutcome, EventQueue, QueueConfig, QueueTelemetry, QueueWorker};
pub use spike::{evaluate_window, SpikeConfig, SpikeDetector, SpikeLevel, SpikeResult};
pub use summarize::{SummarizationWorker, SummarizeConfig};

/// Handle for controlling a running worker task.
pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl WorkerHandle {
    pub(crate) fn new(shutdown_tx: mpsc::Sender<()>, handle: JoinHandle<()>) -> Self {
        Self {
            shutdown_tx,
            handle,
        }
    }

    /// Signal the worker to stop and wait for it to finish its
    /// in-flight unit of work.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.handle.await;
    }
}
