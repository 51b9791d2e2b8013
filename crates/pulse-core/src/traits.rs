//! Store traits for the pulse pipeline.
//!
//! These traits define the persistence contract; any backend satisfying
//! them is acceptable. The PostgreSQL implementation lives in pulse-db
//! alongside an in-memory implementation for tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::*;

// =============================================================================
// EVENT REPOSITORY
// =============================================================================

/// One failed row from an unordered bulk insert.
#[derive(Debug, Clone)]
pub struct RowError {
    /// Index into the submitted batch.
    pub index: usize,
    pub message: String,
}

/// Outcome of an unordered bulk insert; no rollback on partial failure.
#[derive(Debug, Clone, Default)]
pub struct BulkInsertReport {
    pub inserted: usize,
    pub failed: Vec<RowError>,
}

impl BulkInsertReport {
    pub fn all_ok(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Repository for event persistence and queries.
#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Unordered bulk insert. Rows that fail (e.g. duplicate ids) are
    /// reported per-row; the rest are committed.
    async fn insert_many(&self, events: &[Event]) -> Result<BulkInsertReport>;

    /// Events with `timestamp >= since` and no incident, newest first.
    async fn find_recent_unassigned(&self, since: DateTime<Utc>) -> Result<Vec<Event>>;

    /// Fetch by id set, most recent first, capped at `limit`.
    async fn find_by_ids(&self, ids: &[Uuid], limit: i64) -> Result<Vec<Event>>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Event>>;

    /// Filtered, paginated listing.
    async fn list(&self, filter: &EventFilter) -> Result<EventPage>;

    /// Aggregate counts for the stats endpoint.
    async fn stats(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<EventStats>;

    /// Single bulk update setting `incident_id` on every listed event.
    /// Returns the number of rows updated.
    async fn assign_incident(&self, event_ids: &[Uuid], incident_id: Uuid) -> Result<u64>;
}

// =============================================================================
// INCIDENT REPOSITORY
// =============================================================================

/// Field-scoped patch applied when the aggregation worker extends an
/// existing incident. Only the aggregation-owned columns are written.
#[derive(Debug, Clone)]
pub struct IncidentExtension {
    /// Full deduplicated member list after the merge.
    pub event_ids: Vec<Uuid>,
    /// New score; the store keeps the maximum of old and new.
    pub severity_score: i16,
    pub affected_services: Vec<String>,
    pub summary: String,
}

/// Field-scoped patch applied by the summarization worker. Only the
/// summarization-owned columns are written.
#[derive(Debug, Clone)]
pub struct AiSummaryPatch {
    pub ai_summary: String,
    pub root_cause: Option<String>,
    pub suggested_actions: Vec<String>,
}

/// Repository for incident persistence and queries.
#[async_trait]
pub trait IncidentRepository: Send + Sync {
    async fn create(&self, incident: &Incident) -> Result<()>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Incident>>;

    /// An open incident affecting `service`, created at or after
    /// `created_after`, eligible for extension. Newest first.
    async fn find_extension_candidate(
        &self,
        service: &str,
        created_after: DateTime<Utc>,
    ) -> Result<Option<Incident>>;

    /// Open incidents without an AI summary, created at or after
    /// `created_after`, ordered severity desc then created desc.
    async fn find_summary_needed(
        &self,
        created_after: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Incident>>;

    /// Open incidents sorted severity desc, created desc.
    async fn find_active(&self) -> Result<Vec<Incident>>;

    /// Filtered, paginated listing.
    async fn list(&self, filter: &IncidentFilter) -> Result<IncidentPage>;

    /// Aggregation-side extension; severity is raised monotonically.
    async fn extend(&self, id: Uuid, patch: &IncidentExtension) -> Result<()>;

    /// Summarization-side update; never touches aggregation fields.
    async fn apply_summary(&self, id: Uuid, patch: &AiSummaryPatch) -> Result<()>;

    /// Operator PATCH. Setting status to resolved stamps `resolved_at`;
    /// setting `assigned_to` stamps `acknowledged_at` on first assignment.
    async fn apply_patch(&self, id: Uuid, patch: &IncidentPatch) -> Result<Incident>;
}

// =============================================================================
// STATS REPOSITORY
// =============================================================================

/// Repository for rolling per-service window counters.
#[async_trait]
pub trait StatsRepository: Send + Sync {
    /// Upsert `(service, window_key)` adding `count` and touching the
    /// row timestamp.
    async fn upsert_count(&self, service: &str, window_key: &str, count: i64) -> Result<()>;

    /// Most recent rows for a service, newest first, capped at `limit`.
    async fn find_recent(&self, service: &str, limit: i64) -> Result<Vec<ServiceStats>>;

    /// Delete rows older than `cutoff`; returns the number removed.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}
