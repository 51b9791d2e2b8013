//! HTTP mapping of the core error taxonomy.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use pulse_core::{defaults, Error};

/// Handler result alias.
pub type ApiResult<T> = Result<T, ApiError>;

/// Wrapper giving the core error an axum response mapping.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, retry_after, body) = match &self.0 {
            Error::Validation(fields) => (
                StatusCode::BAD_REQUEST,
                None,
                json!({ "error": "validation_failed", "errors": fields }),
            ),
            Error::RateLimited { retry_after_secs } => (
                StatusCode::TOO_MANY_REQUESTS,
                Some(*retry_after_secs),
                json!({ "error": "rate_limited", "retryAfter": retry_after_secs }),
            ),
            Error::Overloaded {
                reason,
                retry_after_secs,
            } => (
                StatusCode::SERVICE_UNAVAILABLE,
                Some(*retry_after_secs),
                json!({ "error": "overloaded", "reason": reason, "retryAfter": retry_after_secs }),
            ),
            Error::NotFound(what) => (
                StatusCode::NOT_FOUND,
                None,
                json!({ "error": "not_found", "message": what }),
            ),
            Error::Conflict(message) => (
                StatusCode::CONFLICT,
                None,
                json!({ "error": "conflict", "message": message }),
            ),
            Error::StoreUnavailable(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                Some(defaults::OVERLOAD_RETRY_AFTER_SECS),
                json!({ "error": "store_unavailable" }),
            ),
            Error::ExternalUnavailable(message) => (
                StatusCode::SERVICE_UNAVAILABLE,
                None,
                json!({ "error": "ai_unavailable", "message": message }),
            ),
            Error::Database(e) => {
                tracing::error!(subsystem = "api", error = %e, "database error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    None,
                    json!({ "error": "internal" }),
                )
            }
            other => {
                tracing::error!(subsystem = "api", error = %other, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    None,
                    json!({ "error": "internal" }),
                )
            }
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_maps_to_404() {
        let response = ApiError(Error::NotFound("incident x".into())).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_overloaded_carries_retry_after() {
        let response = ApiError(Error::Overloaded {
            reason: "queue_full".into(),
            retry_after_secs: 5,
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            &HeaderValue::from_static("5")
        );
    }

    #[test]
    fn test_rate_limited_maps_to_429() {
        let response = ApiError(Error::RateLimited {
            retry_after_secs: 30,
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key(header::RETRY_AFTER));
    }

    #[test]
    fn test_internal_details_not_leaked() {
        let response =
            ApiError(Error::Internal("stack details here".into())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
