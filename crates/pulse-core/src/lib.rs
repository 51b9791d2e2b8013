//! # pulse-core
//!
//! Core types, traits, and pure computation for the pulse incident
//! pipeline.
//!
//! This crate provides the domain model (events, incidents, rolling
//! service stats), the error taxonomy, the broadcast hub, and the pure
//! transformations (PII redaction, severity scoring, error-type
//! affinity) that the worker and API crates build on.

pub mod affinity;
pub mod broadcast;
pub mod defaults;
pub mod error;
pub mod logging;
pub mod models;
pub mod redact;
pub mod scoring;
pub mod traits;

// Re-export commonly used types at crate root
pub use affinity::error_type;
pub use broadcast::{BroadcastHub, ClientFrame, Frame, HubMetricsSnapshot, SessionId};
pub use error::{Error, FieldError, Result};
pub use models::*;
pub use redact::{redact, redact_events, redact_value, RedactionCounts};
pub use scoring::{
    score_event, score_incident, Classification, EventScore, FrequencyLevel, IncidentScore,
    ScoringConfig, SpikeContext,
};
pub use traits::*;
