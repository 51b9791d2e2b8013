//! Structured logging field name constants for the pulse pipeline.
//!
//! All crates use these constants for consistent structured logging so
//! log aggregation tools can query by standardized field names.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue, automatic fallback applied |
//! | INFO  | Lifecycle events (startup, shutdown), run completions |
//! | DEBUG | Decision points, intermediate values, config choices |
//! | TRACE | Per-item iteration (per-event, per-frame) |

/// Correlation ID propagated across request → worker → sub-calls.
pub const REQUEST_ID: &str = "request_id";

/// Subsystem originating the log event.
/// Values: "api", "queue", "aggregation", "summarization", "spike",
/// "broadcast", "db", "ai"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
pub const COMPONENT: &str = "component";

/// Logical operation name, e.g. "drain", "cluster", "summarize_batch".
pub const OPERATION: &str = "op";

/// Event UUID being operated on.
pub const EVENT_ID: &str = "event_id";

/// Incident UUID being operated on.
pub const INCIDENT_ID: &str = "incident_id";

/// Service identifier in scope.
pub const SERVICE: &str = "service";

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Number of events in a batch or cluster.
pub const EVENT_COUNT: &str = "event_count";

/// Number of clusters produced by an aggregation run.
pub const CLUSTER_COUNT: &str = "cluster_count";

/// Current queue depth.
pub const QUEUE_SIZE: &str = "queue_size";

/// AI model name used for a call.
pub const MODEL: &str = "model";

/// Circuit breaker state at a decision point.
pub const BREAKER_STATE: &str = "breaker_state";

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";
