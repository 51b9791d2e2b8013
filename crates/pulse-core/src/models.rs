//! Domain models for the pulse pipeline: events, incidents, and
//! rolling service statistics.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Lowest accepted event severity.
pub const SEVERITY_MIN: i16 = 1;

/// Highest accepted event severity.
pub const SEVERITY_MAX: i16 = 5;

/// Clamp a raw severity into the accepted 1..=5 range.
pub fn clamp_severity(raw: i64) -> i16 {
    raw.clamp(SEVERITY_MIN as i64, SEVERITY_MAX as i64) as i16
}

// =============================================================================
// EVENT
// =============================================================================

/// A single observation emitted by an upstream service.
///
/// Events are immutable once written except for the one-time
/// `incident_id` assignment performed by the aggregation worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: Uuid,
    /// Short service identifier, e.g. `"payment-service"`.
    pub service: String,
    /// Severity in 1..=5, clamped on ingestion.
    pub severity: i16,
    pub timestamp: DateTime<Utc>,
    /// Free-form metadata tree (scalars, maps, lists).
    pub metadata: JsonValue,
    pub tags: Vec<String>,
    /// Back-reference set exactly once by the aggregation worker.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incident_id: Option<Uuid>,
}

impl Event {
    /// Build a new event from an ingestion request, stamping id and
    /// timestamp and clamping severity.
    pub fn from_request(req: CreateEventRequest) -> Self {
        let mut metadata = req.metadata.unwrap_or(JsonValue::Null);
        if let Some(raw) = req.raw_payload {
            if let JsonValue::Object(ref mut map) = metadata {
                map.insert("raw_payload".to_string(), JsonValue::String(raw));
            } else if metadata.is_null() {
                metadata = serde_json::json!({ "raw_payload": raw });
            }
        }
        Self {
            id: Uuid::now_v7(),
            service: req.service,
            severity: clamp_severity(req.severity),
            timestamp: Utc::now(),
            metadata,
            tags: req.tags.unwrap_or_default(),
            incident_id: None,
        }
    }
}

/// Body of `POST /events`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEventRequest {
    pub service: String,
    pub severity: i64,
    #[serde(default)]
    pub metadata: Option<JsonValue>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub raw_payload: Option<String>,
}

/// Filters for listing events.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventFilter {
    pub service: Option<String>,
    pub severity: Option<i16>,
    pub min_severity: Option<i16>,
    pub max_severity: Option<i16>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    /// Events carrying any of these tags.
    pub tags: Option<Vec<String>>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
    /// `"<field>:<asc|desc>"`, field one of `timestamp`, `severity`.
    pub sort: Option<String>,
}

/// One page of events plus the total match count.
#[derive(Debug, Clone, Serialize)]
pub struct EventPage {
    pub events: Vec<Event>,
    pub total: i64,
    pub page: i64,
    pub limit: i64,
}

/// Aggregate counts for `GET /events/stats`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EventStats {
    pub total: i64,
    /// Count per severity value 1..=5.
    pub by_severity: HashMap<i16, i64>,
    /// Count per service.
    pub by_service: HashMap<String, i64>,
}

// =============================================================================
// INCIDENT
// =============================================================================

/// Incident lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    Active,
    Investigating,
    Resolved,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Active => "active",
            IncidentStatus::Investigating => "investigating",
            IncidentStatus::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(IncidentStatus::Active),
            "investigating" => Some(IncidentStatus::Investigating),
            "resolved" => Some(IncidentStatus::Resolved),
            _ => None,
        }
    }

    /// Active and investigating incidents still accept new events.
    pub fn is_open(&self) -> bool {
        !matches!(self, IncidentStatus::Resolved)
    }
}

/// A coalesced group of related events sharing service/error-type
/// affinity and a short time window.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Incident {
    pub id: Uuid,
    /// Ordered member events, duplicates forbidden.
    pub event_ids: Vec<Uuid>,
    pub status: IncidentStatus,
    /// 1..=5; monotonically non-decreasing while the incident is open.
    pub severity_score: i16,
    /// Non-empty set of affected service identifiers.
    pub affected_services: Vec<String>,
    /// Deterministic, locally-generated description.
    pub summary: String,
    /// AI-authored summary; empty until produced.
    #[serde(rename = "aiGeneratedSummary", skip_serializing_if = "Option::is_none")]
    pub ai_summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_cause: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    pub suggested_actions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Incident {
    /// Create a fresh active incident for a cluster of events.
    pub fn new(
        event_ids: Vec<Uuid>,
        severity_score: i16,
        affected_services: Vec<String>,
        summary: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            event_ids,
            status: IncidentStatus::Active,
            severity_score,
            affected_services,
            summary,
            ai_summary: None,
            root_cause: None,
            resolution: None,
            suggested_actions: Vec::new(),
            assigned_to: None,
            created_at: now,
            updated_at: now,
            acknowledged_at: None,
            resolved_at: None,
        }
    }

    /// True once an AI summary has been written.
    pub fn has_ai_summary(&self) -> bool {
        self.ai_summary.as_deref().is_some_and(|s| !s.is_empty())
    }
}

/// Broadcast action attached to incident frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentAction {
    Created,
    Updated,
    SummaryUpdated,
    Resolved,
}

impl IncidentAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentAction::Created => "created",
            IncidentAction::Updated => "updated",
            IncidentAction::SummaryUpdated => "summary_updated",
            IncidentAction::Resolved => "resolved",
        }
    }
}

/// Filters for listing incidents.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IncidentFilter {
    pub status: Option<IncidentStatus>,
    pub min_severity: Option<i16>,
    /// Exact service match against `affected_services`.
    pub service: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
    /// `"<field>:<asc|desc>"`, field one of `created_at`, `severity_score`.
    pub sort: Option<String>,
}

/// One page of incidents plus the total match count.
#[derive(Debug, Clone, Serialize)]
pub struct IncidentPage {
    pub incidents: Vec<Incident>,
    pub total: i64,
    pub page: i64,
    pub limit: i64,
}

/// Operator PATCH body for `PATCH /incidents/:id`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentPatch {
    pub status: Option<IncidentStatus>,
    pub assigned_to: Option<String>,
    pub resolution: Option<String>,
    pub root_cause: Option<String>,
}

impl IncidentPatch {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.assigned_to.is_none()
            && self.resolution.is_none()
            && self.root_cause.is_none()
    }
}

// =============================================================================
// SERVICE STATS
// =============================================================================

/// Rolling-window event counter for one service, unique on
/// `(service, window_key)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStats {
    pub service: String,
    /// Canonical window bucket, `"w_" + floor(t/window)*window` in ms.
    pub window_key: String,
    pub count: i64,
    pub timestamp: DateTime<Utc>,
}

/// Per-service critical classification used by the severity scorer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriticalService {
    pub multiplier: f64,
    #[serde(default, rename = "alertThreshold")]
    pub alert_threshold: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_severity_bounds() {
        assert_eq!(clamp_severity(0), 1);
        assert_eq!(clamp_severity(1), 1);
        assert_eq!(clamp_severity(3), 3);
        assert_eq!(clamp_severity(5), 5);
        assert_eq!(clamp_severity(99), 5);
        assert_eq!(clamp_severity(-7), 1);
    }

    #[test]
    fn test_event_from_request_clamps_and_stamps() {
        let event = Event::from_request(CreateEventRequest {
            service: "auth-service".to_string(),
            severity: 9,
            metadata: Some(serde_json::json!({"errorType": "Timeout"})),
            tags: Some(vec!["prod".to_string()]),
            raw_payload: None,
        });
        assert_eq!(event.severity, 5);
        assert_eq!(event.service, "auth-service");
        assert!(event.incident_id.is_none());
        assert_eq!(event.tags, vec!["prod".to_string()]);
    }

    #[test]
    fn test_event_from_request_folds_raw_payload_into_metadata() {
        let event = Event::from_request(CreateEventRequest {
            service: "api".to_string(),
            severity: 2,
            metadata: None,
            tags: None,
            raw_payload: Some("stack trace...".to_string()),
        });
        assert_eq!(event.metadata["raw_payload"], "stack trace...");
    }

    #[test]
    fn test_incident_status_roundtrip() {
        for status in [
            IncidentStatus::Active,
            IncidentStatus::Investigating,
            IncidentStatus::Resolved,
        ] {
            assert_eq!(IncidentStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(IncidentStatus::parse("closed"), None);
    }

    #[test]
    fn test_incident_status_is_open() {
        assert!(IncidentStatus::Active.is_open());
        assert!(IncidentStatus::Investigating.is_open());
        assert!(!IncidentStatus::Resolved.is_open());
    }

    #[test]
    fn test_incident_new_defaults() {
        let ids = vec![Uuid::now_v7(), Uuid::now_v7()];
        let incident = Incident::new(
            ids.clone(),
            3,
            vec!["order-service".to_string()],
            "2 DeadlockDetected events from order-service. Severity: MEDIUM".to_string(),
        );
        assert_eq!(incident.status, IncidentStatus::Active);
        assert_eq!(incident.event_ids, ids);
        assert!(!incident.has_ai_summary());
        assert!(incident.resolved_at.is_none());
    }

    #[test]
    fn test_incident_serializes_status_lowercase() {
        let incident = Incident::new(vec![], 1, vec!["a".to_string()], "s".to_string());
        let json = serde_json::to_string(&incident).unwrap();
        assert!(json.contains(r#""status":"active"#));
    }

    #[test]
    fn test_incident_action_wire_names() {
        assert_eq!(IncidentAction::SummaryUpdated.as_str(), "summary_updated");
        let json = serde_json::to_string(&IncidentAction::SummaryUpdated).unwrap();
        assert_eq!(json, r#""summary_updated""#);
    }

    #[test]
    fn test_incident_patch_is_empty() {
        assert!(IncidentPatch::default().is_empty());
        let patch = IncidentPatch {
            status: Some(IncidentStatus::Resolved),
            ..Default::default()
        };
        assert!(!patch.is_empty());
    }
}
