//! Incident query and operator-action handlers.

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use pulse_core::{
    Error, Event, Incident, IncidentAction, IncidentFilter, IncidentPage, IncidentPatch,
    IncidentStatus,
};

use crate::error::ApiResult;
use crate::AppState;

/// Query parameters for `GET /incidents`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IncidentListQuery {
    pub status: Option<String>,
    pub min_severity: Option<i16>,
    pub service: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
    pub sort: Option<String>,
}

impl IncidentListQuery {
    fn into_filter(self) -> Result<IncidentFilter, Error> {
        let status = match self.status.as_deref() {
            None => None,
            Some(raw) => Some(IncidentStatus::parse(raw).ok_or_else(|| {
                Error::validation("status", "must be one of active, investigating, resolved")
            })?),
        };
        Ok(IncidentFilter {
            status,
            min_severity: self.min_severity,
            service: self.service,
            start_date: self.start_date,
            end_date: self.end_date,
            page: self.page,
            limit: self.limit,
            sort: self.sort,
        })
    }
}

/// `GET /incidents` — filtered, paginated listing.
pub async fn list_incidents(
    State(state): State<AppState>,
    Query(query): Query<IncidentListQuery>,
) -> ApiResult<Json<IncidentPage>> {
    let filter = query.into_filter()?;
    let page = state.incidents.list(&filter).await?;
    Ok(Json(page))
}

/// `GET /incidents/active` — open incidents, severity desc.
pub async fn active_incidents(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<Incident>>> {
    let incidents = state.incidents.find_active().await?;
    Ok(Json(incidents))
}

/// Incident plus its populated member events.
#[derive(Debug, Serialize)]
pub struct IncidentDetail {
    #[serde(flatten)]
    pub incident: Incident,
    pub events: Vec<Event>,
}

/// `GET /incidents/:id` — incident with populated events.
pub async fn get_incident(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<IncidentDetail>> {
    let incident = state
        .incidents
        .find_by_id(id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("incident {id}")))?;
    let events = state
        .events
        .find_by_ids(&incident.event_ids, incident.event_ids.len().max(1) as i64)
        .await?;
    Ok(Json(IncidentDetail { incident, events }))
}

/// `PATCH /incidents/:id` — operator mutation. Resolving stamps
/// `resolved_at`; assignment stamps `acknowledged_at`. The mutation is
/// broadcast to all subscribers.
pub async fn patch_incident(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(patch): Json<IncidentPatch>,
) -> ApiResult<Json<Incident>> {
    if patch.is_empty() {
        return Err(Error::validation(
            "body",
            "at least one of status, assignedTo, resolution, rootCause is required",
        )
        .into());
    }

    let updated = state.incidents.apply_patch(id, &patch).await?;
    let action = if updated.status == IncidentStatus::Resolved {
        IncidentAction::Resolved
    } else {
        IncidentAction::Updated
    };
    state.hub.publish_incident(&updated, action);
    Ok(Json(updated))
}
