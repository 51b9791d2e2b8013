//! Event ingestion and query handlers.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use pulse_core::{
    defaults, CreateEventRequest, Error, Event, EventFilter, FieldError,
};
use pulse_workers::{EnqueueOutcome, QueueTelemetry};

use crate::admission::{LoadLevel, RateDecision};
use crate::error::{ApiError, ApiResult};
use crate::AppState;

/// Client identity for rate limiting: proxy header first, socket next.
fn client_id(headers: &HeaderMap, addr: Option<&SocketAddr>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| {
            addr.map(|a| a.ip().to_string())
                .unwrap_or_else(|| "unknown".to_string())
        })
}

/// Load and rate-limit headers attached to every ingestion response.
fn ingestion_headers(decision: &RateDecision, telemetry: &QueueTelemetry) -> HeaderMap {
    let level = LoadLevel::from_utilization(telemetry.utilization);
    let mut headers = HeaderMap::new();
    let mut put = |name: &'static str, value: String| {
        if let Ok(v) = HeaderValue::from_str(&value) {
            headers.insert(name, v);
        }
    };
    put("x-load-level", level.as_str().to_string());
    put(
        "x-queue-utilization",
        format!("{}%", (telemetry.utilization * 100.0).round() as u64),
    );
    put("x-ratelimit-limit", decision.limit.to_string());
    put("x-ratelimit-remaining", decision.remaining.to_string());
    put("x-ratelimit-reset", decision.reset_secs.to_string());
    headers
}

fn validate(req: &CreateEventRequest) -> Vec<FieldError> {
    let mut errors = Vec::new();
    if req.service.trim().is_empty() {
        errors.push(FieldError::new("service", "must not be empty"));
    }
    if req.service.len() > 200 {
        errors.push(
            FieldError::new("service", "must be at most 200 characters")
                .with_value(format!("{} chars", req.service.len())),
        );
    }
    if !(1..=5).contains(&req.severity) {
        errors.push(
            FieldError::new("severity", "must be between 1 and 5")
                .with_value(req.severity.to_string()),
        );
    }
    errors
}

/// `POST /events` — the admission gate then the bounded queue.
/// Never blocks: over-limit clients get 429, a hot or full queue 503,
/// both with a retry hint.
pub async fn create_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    addr: Option<ConnectInfo<SocketAddr>>,
    Json(req): Json<CreateEventRequest>,
) -> Response {
    let client = client_id(&headers, addr.as_ref().map(|c| &c.0));
    let decision = state.limiter.check(&client);
    let telemetry = state.queue.telemetry();
    let response_headers = ingestion_headers(&decision, &telemetry);

    if !decision.allowed {
        // ApiError's mapping already attaches Retry-After.
        return (
            response_headers,
            ApiError(Error::RateLimited {
                retry_after_secs: decision.retry_after_secs.unwrap_or(1),
            }),
        )
            .into_response();
    }

    let errors = validate(&req);
    if !errors.is_empty() {
        return (response_headers, ApiError(Error::Validation(errors))).into_response();
    }

    // Queue-pressure gate: at critical utilization new events are shed
    // before they touch the queue.
    if LoadLevel::from_utilization(telemetry.utilization).rejects() {
        return (
            response_headers,
            ApiError(Error::Overloaded {
                reason: "queue_pressure".to_string(),
                retry_after_secs: defaults::OVERLOAD_RETRY_AFTER_SECS,
            }),
        )
            .into_response();
    }

    let event = Event::from_request(req);
    match state.queue.enqueue(event.clone()) {
        EnqueueOutcome::Accepted { queue_size } => {
            tracing::debug!(
                subsystem = "api",
                event_id = %event.id,
                service = %event.service,
                queue_size,
                "event accepted"
            );
            (StatusCode::CREATED, response_headers, Json(event)).into_response()
        }
        EnqueueOutcome::Rejected { reason, .. } => (
            response_headers,
            ApiError(Error::Overloaded {
                reason: reason.to_string(),
                retry_after_secs: defaults::OVERLOAD_RETRY_AFTER_SECS,
            }),
        )
            .into_response(),
    }
}

/// Query parameters for `GET /events`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventListQuery {
    pub service: Option<String>,
    pub severity: Option<i16>,
    pub min_severity: Option<i16>,
    pub max_severity: Option<i16>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    /// Comma-separated tag list.
    pub tags: Option<String>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
    pub sort: Option<String>,
}

impl EventListQuery {
    fn into_filter(self) -> EventFilter {
        EventFilter {
            service: self.service,
            severity: self.severity,
            min_severity: self.min_severity,
            max_severity: self.max_severity,
            start_date: self.start_date,
            end_date: self.end_date,
            tags: self.tags.map(|csv| {
                csv.split(',')
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
                    .collect()
            }),
            page: self.page,
            limit: self.limit,
            sort: self.sort,
        }
    }
}

/// `GET /events` — filtered, paginated listing.
pub async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<EventListQuery>,
) -> ApiResult<Json<pulse_core::EventPage>> {
    let page = state.events.list(&query.into_filter()).await?;
    Ok(Json(page))
}

/// Query parameters for `GET /events/stats`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatsQuery {
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

/// `GET /events/stats` — totals plus severity/service distributions.
pub async fn event_stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let stats = state.events.stats(query.start_date, query.end_date).await?;
    Ok(Json(json!({
        "total": stats.total,
        "bySeverity": stats.by_severity,
        "byService": stats.by_service,
    })))
}

/// `GET /events/:id`.
pub async fn get_event(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Event>> {
    let event = state
        .events
        .find_by_id(id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("event {id}")))?;
    Ok(Json(event))
}
