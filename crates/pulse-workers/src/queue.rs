//! Bounded ingestion queue with batched persistence and broadcast
//! staging.
//!
//! `enqueue` is synchronous and non-blocking; a full queue rejects
//! rather than waits, and the caller translates rejection into
//! backpressure. A single drainer task bulk-inserts batches and stages
//! persisted events for the broadcast hub. On bulk-insert failure the
//! batch is dropped and counted — redelivery would risk duplicates
//! under the at-most-once semantics the system exposes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

use pulse_core::{defaults, BroadcastHub, Event, EventRepository};

use crate::WorkerHandle;

/// Queue tuning.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_queue_size: usize,
    pub batch_size: usize,
    pub batch_interval: Duration,
    pub broadcast_batch_size: usize,
    pub broadcast_batch_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: defaults::QUEUE_MAX_SIZE,
            batch_size: defaults::QUEUE_BATCH_SIZE,
            batch_interval: Duration::from_millis(defaults::QUEUE_BATCH_INTERVAL_MS),
            broadcast_batch_size: defaults::BROADCAST_BATCH_SIZE,
            broadcast_batch_interval: Duration::from_millis(defaults::BROADCAST_BATCH_INTERVAL_MS),
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `QUEUE_MAX_SIZE` | `10000` |
    /// | `QUEUE_BATCH_SIZE` | `100` |
    /// | `QUEUE_BATCH_INTERVAL_MS` | `1000` |
    /// | `BROADCAST_BATCH_SIZE` | `10` |
    /// | `BROADCAST_BATCH_INTERVAL_MS` | `100` |
    pub fn from_env() -> Self {
        fn var<T: std::str::FromStr>(name: &str, default: T) -> T {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        }
        Self {
            max_queue_size: var("QUEUE_MAX_SIZE", defaults::QUEUE_MAX_SIZE),
            batch_size: var("QUEUE_BATCH_SIZE", defaults::QUEUE_BATCH_SIZE),
            batch_interval: Duration::from_millis(var(
                "QUEUE_BATCH_INTERVAL_MS",
                defaults::QUEUE_BATCH_INTERVAL_MS,
            )),
            broadcast_batch_size: var("BROADCAST_BATCH_SIZE", defaults::BROADCAST_BATCH_SIZE),
            broadcast_batch_interval: Duration::from_millis(var(
                "BROADCAST_BATCH_INTERVAL_MS",
                defaults::BROADCAST_BATCH_INTERVAL_MS,
            )),
        }
    }
}

/// Result of a synchronous enqueue attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Accepted {
        queue_size: usize,
    },
    /// Capacity reached (or the queue is flushing for shutdown).
    Rejected {
        reason: &'static str,
        queue_size: usize,
    },
}

impl EnqueueOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, EnqueueOutcome::Accepted { .. })
    }
}

/// Load telemetry surfaced to the admission gate and health endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueTelemetry {
    pub queue_size: usize,
    pub max_queue_size: usize,
    pub utilization: f64,
    pub under_pressure: bool,
    pub dropped_batches: u64,
    pub persisted_events: u64,
    pub rejected_events: u64,
}

/// Shared handle for producers: bounded buffer plus counters.
pub struct EventQueue {
    buffer: Mutex<VecDeque<Event>>,
    max_size: usize,
    accepting: AtomicBool,
    notify: Notify,
    dropped_batches: AtomicU64,
    persisted_events: AtomicU64,
    rejected_events: AtomicU64,
}

impl EventQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            buffer: Mutex::new(VecDeque::new()),
            max_size,
            accepting: AtomicBool::new(true),
            notify: Notify::new(),
            dropped_batches: AtomicU64::new(0),
            persisted_events: AtomicU64::new(0),
            rejected_events: AtomicU64::new(0),
        }
    }

    /// Synchronous, non-blocking admission. Never panics, never waits.
    pub fn enqueue(&self, event: Event) -> EnqueueOutcome {
        if !self.accepting.load(Ordering::SeqCst) {
            let queue_size = self.len();
            self.rejected_events.fetch_add(1, Ordering::Relaxed);
            return EnqueueOutcome::Rejected {
                reason: "shutting_down",
                queue_size,
            };
        }
        let mut buffer = self.buffer.lock();
        if buffer.len() >= self.max_size {
            drop(buffer);
            self.rejected_events.fetch_add(1, Ordering::Relaxed);
            return EnqueueOutcome::Rejected {
                reason: "queue_full",
                queue_size: self.max_size,
            };
        }
        buffer.push_back(event);
        let queue_size = buffer.len();
        drop(buffer);
        self.notify.notify_one();
        EnqueueOutcome::Accepted { queue_size }
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Fraction of capacity in use, 0.0..=1.0.
    pub fn utilization(&self) -> f64 {
        self.len() as f64 / self.max_size as f64
    }

    /// Utilization at or above the pressure threshold (80%).
    pub fn under_pressure(&self) -> bool {
        self.utilization() >= defaults::QUEUE_PRESSURE_THRESHOLD
    }

    pub fn telemetry(&self) -> QueueTelemetry {
        let queue_size = self.len();
        let utilization = queue_size as f64 / self.max_size as f64;
        QueueTelemetry {
            queue_size,
            max_queue_size: self.max_size,
            utilization,
            under_pressure: utilization >= defaults::QUEUE_PRESSURE_THRESHOLD,
            dropped_batches: self.dropped_batches.load(Ordering::Relaxed),
            persisted_events: self.persisted_events.load(Ordering::Relaxed),
            rejected_events: self.rejected_events.load(Ordering::Relaxed),
        }
    }

    fn pop_batch(&self, n: usize) -> Vec<Event> {
        let mut buffer = self.buffer.lock();
        let take = n.min(buffer.len());
        buffer.drain(..take).collect()
    }

    fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }
}

/// The single logical drainer plus the broadcast stager.
pub struct QueueWorker {
    queue: Arc<EventQueue>,
    store: Arc<dyn EventRepository>,
    hub: Arc<BroadcastHub>,
    config: QueueConfig,
    staged: VecDeque<Event>,
}

impl QueueWorker {
    pub fn new(
        queue: Arc<EventQueue>,
        store: Arc<dyn EventRepository>,
        hub: Arc<BroadcastHub>,
        config: QueueConfig,
    ) -> Self {
        Self {
            queue,
            store,
            hub,
            config,
            staged: VecDeque::new(),
        }
    }

    /// Start the drain/dispatch loop and return a control handle.
    /// Shutdown flushes: enqueues are blocked first, then the queue is
    /// drained to empty and all staged frames dispatched.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let handle = tokio::spawn(self.run(shutdown_rx));
        WorkerHandle::new(shutdown_tx, handle)
    }

    async fn run(mut self, mut shutdown_rx: mpsc::Receiver<()>) {
        info!(
            subsystem = "queue",
            max_queue_size = self.queue.max_size,
            batch_size = self.config.batch_size,
            "event queue worker started"
        );
        let mut batch_timer = tokio::time::interval(self.config.batch_interval);
        let mut broadcast_timer = tokio::time::interval(self.config.broadcast_batch_interval);
        let queue = self.queue.clone();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    self.flush().await;
                    break;
                }
                _ = queue.notify.notified() => {
                    self.drain_once().await;
                    // Immediate reschedule while work remains; the
                    // select stays responsive to the other arms.
                    if !queue.is_empty() {
                        queue.notify.notify_one();
                    }
                }
                _ = batch_timer.tick() => {
                    if !self.queue.is_empty() {
                        self.drain_once().await;
                    }
                }
                _ = broadcast_timer.tick() => {
                    self.dispatch_staged();
                }
            }
        }
        info!(subsystem = "queue", "event queue worker stopped");
    }

    /// Drain up to one batch: a single unordered bulk insert, then
    /// stage the persisted events for broadcast.
    async fn drain_once(&mut self) {
        let batch = self.queue.pop_batch(self.config.batch_size);
        if batch.is_empty() {
            return;
        }
        let batch_len = batch.len();
        match self.store.insert_many(&batch).await {
            Ok(report) => {
                self.queue
                    .persisted_events
                    .fetch_add(report.inserted as u64, Ordering::Relaxed);
                if !report.failed.is_empty() {
                    warn!(
                        subsystem = "queue",
                        op = "drain",
                        failed = report.failed.len(),
                        "bulk insert rejected rows"
                    );
                }
                let failed_indexes: std::collections::HashSet<usize> =
                    report.failed.iter().map(|f| f.index).collect();
                for (index, event) in batch.into_iter().enumerate() {
                    if !failed_indexes.contains(&index) {
                        self.staged.push_back(event);
                    }
                }
                debug!(
                    subsystem = "queue",
                    op = "drain",
                    event_count = batch_len,
                    queue_size = self.queue.len(),
                    "batch persisted"
                );
            }
            Err(e) => {
                // At-most-once: the batch is gone, not redelivered.
                self.queue.dropped_batches.fetch_add(1, Ordering::Relaxed);
                error!(
                    subsystem = "queue",
                    op = "drain",
                    event_count = batch_len,
                    error = %e,
                    "bulk insert failed, dropping batch"
                );
            }
        }
    }

    /// Dispatch up to one broadcast batch from the staging buffer.
    fn dispatch_staged(&mut self) {
        for _ in 0..self.config.broadcast_batch_size {
            match self.staged.pop_front() {
                Some(event) => self.hub.publish_event(&event),
                None => break,
            }
        }
    }

    /// Deterministic shutdown drain: block enqueues, drain to empty,
    /// dispatch everything staged.
    async fn flush(&mut self) {
        self.queue.stop_accepting();
        info!(
            subsystem = "queue",
            op = "flush",
            queue_size = self.queue.len(),
            "flushing event queue"
        );
        while !self.queue.is_empty() {
            self.drain_once().await;
        }
        while !self.staged.is_empty() {
            self.dispatch_staged();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pulse_db::MemoryStore;
    use serde_json::json;
    use uuid::Uuid;

    fn event(service: &str) -> Event {
        Event {
            id: Uuid::now_v7(),
            service: service.to_string(),
            severity: 3,
            timestamp: Utc::now(),
            metadata: json!({}),
            tags: vec![],
            incident_id: None,
        }
    }

    fn small_config() -> QueueConfig {
        QueueConfig {
            max_queue_size: 100,
            batch_size: 10,
            batch_interval: Duration::from_millis(20),
            broadcast_batch_size: 10,
            broadcast_batch_interval: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_enqueue_bounded_rejects_at_capacity() {
        let queue = EventQueue::new(3);
        for _ in 0..3 {
            assert!(queue.enqueue(event("api")).is_accepted());
        }
        let outcome = queue.enqueue(event("api"));
        match outcome {
            EnqueueOutcome::Rejected { reason, queue_size } => {
                assert_eq!(reason, "queue_full");
                assert_eq!(queue_size, 3);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        // The buffer never exceeds its bound.
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.telemetry().rejected_events, 1);
    }

    #[test]
    fn test_pressure_thresholds() {
        let queue = EventQueue::new(10);
        for _ in 0..7 {
            queue.enqueue(event("api"));
        }
        assert!(!queue.under_pressure());
        queue.enqueue(event("api"));
        assert!(queue.under_pressure());
        assert!((queue.utilization() - 0.8).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_drain_persists_and_broadcasts_in_order() {
        let queue = Arc::new(EventQueue::new(100));
        let store = Arc::new(MemoryStore::new());
        let hub = Arc::new(BroadcastHub::new(64));
        let (_session, mut rx) = hub.attach();
        rx.recv().await.unwrap(); // greeting

        let events: Vec<Event> = (0..5).map(|_| event("api")).collect();
        for e in &events {
            queue.enqueue(e.clone());
        }

        let worker = QueueWorker::new(queue.clone(), store.clone(), hub.clone(), small_config());
        let handle = worker.start();

        // Wait for the drainer to pick the batch up and stage it out.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.event_count(), 5);
        assert_eq!(queue.len(), 0);
        for expected in &events {
            match rx.recv().await.unwrap() {
                pulse_core::Frame::Event { data, .. } => assert_eq!(data.id, expected.id),
                other => panic!("expected event frame, got {other:?}"),
            }
        }
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_insert_failure_drops_batch() {
        let queue = Arc::new(EventQueue::new(100));
        let store = Arc::new(MemoryStore::new());
        store.set_fail_events(true);
        let hub = Arc::new(BroadcastHub::new(64));

        for _ in 0..5 {
            queue.enqueue(event("api"));
        }
        let worker = QueueWorker::new(queue.clone(), store.clone(), hub, small_config());
        let handle = worker.start();

        tokio::time::sleep(Duration::from_millis(80)).await;
        let telemetry = queue.telemetry();
        assert_eq!(telemetry.queue_size, 0);
        assert!(telemetry.dropped_batches >= 1);
        assert_eq!(telemetry.persisted_events, 0);

        // The store recovering does not resurrect the dropped batch.
        store.set_fail_events(false);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.event_count(), 0);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_rows_not_rebroadcast() {
        let queue = Arc::new(EventQueue::new(100));
        let store = Arc::new(MemoryStore::new());
        let hub = Arc::new(BroadcastHub::new(64));
        let (_session, mut rx) = hub.attach();
        rx.recv().await.unwrap();

        let dup = event("api");
        queue.enqueue(dup.clone());
        queue.enqueue(dup.clone());
        queue.enqueue(event("api"));

        let worker = QueueWorker::new(queue.clone(), store.clone(), hub, small_config());
        let handle = worker.start();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Two unique rows persisted; only persisted rows were staged.
        assert_eq!(store.event_count(), 2);
        let mut frames = 0;
        while rx.try_recv().is_ok() {
            frames += 1;
        }
        assert_eq!(frames, 2);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_flush_drains_everything_and_blocks_enqueues() {
        let queue = Arc::new(EventQueue::new(1000));
        let store = Arc::new(MemoryStore::new());
        let hub = Arc::new(BroadcastHub::new(1024));

        for _ in 0..35 {
            queue.enqueue(event("api"));
        }
        let worker = QueueWorker::new(queue.clone(), store.clone(), hub, small_config());
        let handle = worker.start();
        handle.shutdown().await;

        assert_eq!(queue.len(), 0);
        assert_eq!(store.event_count(), 35);
        assert!(!queue.enqueue(event("api")).is_accepted());
    }
}
