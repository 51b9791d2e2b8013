//! Error types for the pulse pipeline.

use thiserror::Error;

/// Result type alias using pulse's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// A single field-level validation failure, surfaced as
/// `{field, message, value}` at the API boundary.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            value: None,
        }
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }
}

/// Core error type for pulse operations.
///
/// The variants follow the stable taxonomy used across the system:
/// validation, rate limiting, overload, not-found, conflict, store
/// unavailability, external (AI provider) unavailability, and internal
/// faults. Transport-level errors from sqlx/reqwest are translated at
/// the wrapper boundary.
#[derive(Error, Debug)]
pub enum Error {
    /// Rejected at the boundary; carries the per-field failures.
    #[error("Validation failed: {}", format_fields(.0))]
    Validation(Vec<FieldError>),

    /// Client exceeded its sliding-window quota.
    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Queue full or admission gate closed; retryable.
    #[error("Overloaded: {reason}, retry after {retry_after_secs}s")]
    Overloaded {
        reason: String,
        retry_after_secs: u64,
    },

    /// Unknown id lookup.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Duplicate key.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Transient store I/O failure.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// AI provider failure; recorded on the circuit breaker.
    #[error("External service unavailable: {0}")]
    ExternalUnavailable(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database operation failed (wraps sqlx::Error).
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// File I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Programming error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Single-field validation shorthand.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation(vec![FieldError::new(field, message)])
    }

    /// True if a retry hint should be surfaced to the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::RateLimited { .. }
                | Error::Overloaded { .. }
                | Error::StoreUnavailable(_)
                | Error::ExternalUnavailable(_)
        )
    }
}

fn format_fields(fields: &[FieldError]) -> String {
    fields
        .iter()
        .map(|f| format!("{}: {}", f.field, f.message))
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::ExternalUnavailable(e.to_string())
    }
}
