//! Centralized default constants for the pulse pipeline.
//!
//! **This module is the single source of truth** for all shared default
//! values. Crates reference these constants instead of defining their
//! own magic numbers. When adding new constants, place them in the
//! appropriate section.

// =============================================================================
// EVENT QUEUE
// =============================================================================

/// Maximum buffered events before enqueues are rejected.
pub const QUEUE_MAX_SIZE: usize = 10_000;

/// Events drained per bulk insert.
pub const QUEUE_BATCH_SIZE: usize = 100;

/// Drain timer when the queue is idle.
pub const QUEUE_BATCH_INTERVAL_MS: u64 = 1_000;

/// Events dispatched to the broadcast hub per staging tick.
pub const BROADCAST_BATCH_SIZE: usize = 10;

/// Broadcast staging timer.
pub const BROADCAST_BATCH_INTERVAL_MS: u64 = 100;

/// Queue utilization above which the system reports pressure and the
/// summarization worker skips its next tick.
pub const QUEUE_PRESSURE_THRESHOLD: f64 = 0.80;

/// Queue utilization above which ingestion is rejected outright.
pub const QUEUE_REJECT_THRESHOLD: f64 = 0.90;

/// Queue utilization above which responses carry a warning load level.
pub const QUEUE_WARNING_THRESHOLD: f64 = 0.70;

// =============================================================================
// AGGREGATION
// =============================================================================

/// Aggregation worker tick interval.
pub const AGGREGATION_INTERVAL_MS: u64 = 30_000;

/// Look-back window for "recent" unassigned events.
pub const AGGREGATION_WINDOW_MS: i64 = 300_000;

/// Spike-detector cleanup runs every Nth aggregation run.
pub const AGGREGATION_CLEANUP_EVERY: u64 = 10;

// =============================================================================
// SPIKE DETECTION
// =============================================================================

/// Width of one counting window.
pub const SPIKE_WINDOW_MS: i64 = 300_000;

/// Windows of history retained per service (12 × 5 min = 1 h).
pub const SPIKE_HISTORY_WINDOWS: i64 = 12;

/// Standard deviations above the mean that count as a spike.
pub const SPIKE_STDDEV_THRESHOLD: f64 = 2.0;

/// Minimum retained windows before spike verdicts are produced.
pub const SPIKE_MIN_DATA_POINTS: usize = 3;

// =============================================================================
// SUMMARIZATION
// =============================================================================

/// Summarization worker tick interval.
pub const SUMMARIZATION_INTERVAL_MS: u64 = 30_000;

/// Incidents per AI batch prompt.
pub const SUMMARIZATION_BATCH_SIZE: usize = 5;

/// Retry attempts per AI call.
pub const SUMMARIZATION_MAX_RETRIES: u32 = 3;

/// Only incidents created within this window are summarized.
pub const SUMMARIZATION_LOOKBACK_MS: i64 = 24 * 60 * 60 * 1_000;

/// Most-recent events fetched per incident for the prompt.
pub const SUMMARIZATION_EVENTS_PER_INCIDENT: i64 = 50;

/// Base retry backoff.
pub const AI_BACKOFF_BASE_MS: u64 = 1_000;

/// Backoff ceiling.
pub const AI_BACKOFF_MAX_MS: u64 = 30_000;

/// AI call timeout.
pub const AI_TIMEOUT_SECS: u64 = 60;

// =============================================================================
// CIRCUIT BREAKER
// =============================================================================

/// Consecutive failures in closed state that open the breaker.
pub const BREAKER_FAILURE_THRESHOLD: u32 = 5;

/// Successes in half-open state that close the breaker.
pub const BREAKER_SUCCESS_THRESHOLD: u32 = 2;

/// Cooldown before an open breaker permits a probe.
pub const BREAKER_TIMEOUT_MS: u64 = 60_000;

/// State transitions retained for the audit trail.
pub const BREAKER_AUDIT_LEN: usize = 10;

// =============================================================================
// BROADCAST HUB
// =============================================================================

/// Per-session outbound frame buffer; overflowing sessions are closed.
pub const SESSION_BUFFER_SIZE: usize = 256;

/// Liveness ping cycle; sessions silent for a full cycle are reaped.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

// =============================================================================
// SERVER
// =============================================================================

/// Default HTTP server port.
pub const SERVER_PORT: u16 = 3000;

/// Sliding rate-limit window.
pub const RATE_LIMIT_WINDOW_MS: u64 = 60_000;

/// Requests per client per window.
pub const RATE_LIMIT_MAX_REQUESTS: usize = 1_000;

/// Retry hint attached to 503 responses.
pub const OVERLOAD_RETRY_AFTER_SECS: u64 = 5;

/// Store call timeout.
pub const STORE_TIMEOUT_SECS: u64 = 5;

/// Maximum request body size in bytes (1 MB; events are small).
pub const MAX_BODY_SIZE_BYTES: usize = 1024 * 1024;

/// Default page size for list endpoints.
pub const PAGE_LIMIT: i64 = 50;

/// Hard cap on requested page sizes.
pub const PAGE_LIMIT_MAX: i64 = 500;
