//! In-memory store implementing the repository traits.
//!
//! Used by worker and API tests that exercise pipeline behavior without
//! a PostgreSQL instance. Mirrors the semantics of the Pg
//! implementations: duplicate ids are reported per row, incident
//! assignment is at-most-once, and incident mutations are field-scoped.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use pulse_core::{
    defaults, AiSummaryPatch, BulkInsertReport, Error, Event, EventFilter, EventPage,
    EventRepository, EventStats, Incident, IncidentExtension, IncidentFilter, IncidentPage,
    IncidentPatch, IncidentRepository, IncidentStatus, Result, RowError, ServiceStats,
    StatsRepository,
};

/// In-memory implementation of all three store traits.
#[derive(Default)]
pub struct MemoryStore {
    events: Mutex<Vec<Event>>,
    incidents: Mutex<HashMap<Uuid, Incident>>,
    stats: Mutex<HashMap<(String, String), ServiceStats>>,
    /// When set, event operations fail with StoreUnavailable.
    fail_events: AtomicBool,
    /// When set, stats operations fail with StoreUnavailable.
    fail_stats: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make event operations fail, to exercise drop-batch paths.
    pub fn set_fail_events(&self, fail: bool) {
        self.fail_events.store(fail, Ordering::SeqCst);
    }

    /// Make stats operations fail, to exercise detector degradation.
    pub fn set_fail_stats(&self, fail: bool) {
        self.fail_stats.store(fail, Ordering::SeqCst);
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn incident_count(&self) -> usize {
        self.incidents.lock().len()
    }

    /// Snapshot of all stored events, unordered.
    pub fn all_events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Snapshot of all stored incidents, unordered.
    pub fn all_incidents(&self) -> Vec<Incident> {
        self.incidents.lock().values().cloned().collect()
    }

    /// Seed a stats row directly (tests construct window history).
    pub fn seed_stats(&self, service: &str, window_key: &str, count: i64, at: DateTime<Utc>) {
        self.stats.lock().insert(
            (service.to_string(), window_key.to_string()),
            ServiceStats {
                service: service.to_string(),
                window_key: window_key.to_string(),
                count,
                timestamp: at,
            },
        );
    }

    fn check_events(&self) -> Result<()> {
        if self.fail_events.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable("injected event failure".into()));
        }
        Ok(())
    }

    fn check_stats(&self) -> Result<()> {
        if self.fail_stats.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable("injected stats failure".into()));
        }
        Ok(())
    }
}

fn matches_event(event: &Event, filter: &EventFilter) -> bool {
    if let Some(ref service) = filter.service {
        if &event.service != service {
            return false;
        }
    }
    if let Some(severity) = filter.severity {
        if event.severity != severity {
            return false;
        }
    }
    if let Some(min) = filter.min_severity {
        if event.severity < min {
            return false;
        }
    }
    if let Some(max) = filter.max_severity {
        if event.severity > max {
            return false;
        }
    }
    if let Some(start) = filter.start_date {
        if event.timestamp < start {
            return false;
        }
    }
    if let Some(end) = filter.end_date {
        if event.timestamp > end {
            return false;
        }
    }
    if let Some(ref tags) = filter.tags {
        if !tags.is_empty() && !tags.iter().any(|t| event.tags.contains(t)) {
            return false;
        }
    }
    true
}

fn matches_incident(incident: &Incident, filter: &IncidentFilter) -> bool {
    if let Some(status) = filter.status {
        if incident.status != status {
            return false;
        }
    }
    if let Some(min) = filter.min_severity {
        if incident.severity_score < min {
            return false;
        }
    }
    if let Some(ref service) = filter.service {
        if !incident.affected_services.contains(service) {
            return false;
        }
    }
    if let Some(start) = filter.start_date {
        if incident.created_at < start {
            return false;
        }
    }
    if let Some(end) = filter.end_date {
        if incident.created_at > end {
            return false;
        }
    }
    true
}

#[async_trait]
impl EventRepository for MemoryStore {
    async fn insert_many(&self, events: &[Event]) -> Result<BulkInsertReport> {
        self.check_events()?;
        let mut store = self.events.lock();
        let mut existing: HashSet<Uuid> = store.iter().map(|e| e.id).collect();
        let mut report = BulkInsertReport::default();
        for (index, event) in events.iter().enumerate() {
            if existing.contains(&event.id) {
                report.failed.push(RowError {
                    index,
                    message: format!("duplicate event id {}", event.id),
                });
            } else {
                existing.insert(event.id);
                store.push(event.clone());
                report.inserted += 1;
            }
        }
        Ok(report)
    }

    async fn find_recent_unassigned(&self, since: DateTime<Utc>) -> Result<Vec<Event>> {
        self.check_events()?;
        let mut out: Vec<Event> = self
            .events
            .lock()
            .iter()
            .filter(|e| e.timestamp >= since && e.incident_id.is_none())
            .cloned()
            .collect();
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(out)
    }

    async fn find_by_ids(&self, ids: &[Uuid], limit: i64) -> Result<Vec<Event>> {
        self.check_events()?;
        let wanted: HashSet<Uuid> = ids.iter().copied().collect();
        let mut out: Vec<Event> = self
            .events
            .lock()
            .iter()
            .filter(|e| wanted.contains(&e.id))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        out.truncate(limit.max(0) as usize);
        Ok(out)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Event>> {
        self.check_events()?;
        Ok(self.events.lock().iter().find(|e| e.id == id).cloned())
    }

    async fn list(&self, filter: &EventFilter) -> Result<EventPage> {
        self.check_events()?;
        let limit = filter
            .limit
            .unwrap_or(defaults::PAGE_LIMIT)
            .clamp(1, defaults::PAGE_LIMIT_MAX);
        let page = filter.page.unwrap_or(1).max(1);

        let mut matched: Vec<Event> = self
            .events
            .lock()
            .iter()
            .filter(|e| matches_event(e, filter))
            .cloned()
            .collect();
        match filter.sort.as_deref() {
            Some("timestamp:asc") => matched.sort_by(|a, b| a.timestamp.cmp(&b.timestamp)),
            Some("severity:desc") => matched.sort_by(|a, b| {
                b.severity
                    .cmp(&a.severity)
                    .then(b.timestamp.cmp(&a.timestamp))
            }),
            Some("severity:asc") => matched.sort_by(|a, b| {
                a.severity
                    .cmp(&b.severity)
                    .then(b.timestamp.cmp(&a.timestamp))
            }),
            _ => matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp)),
        }

        let total = matched.len() as i64;
        let start = ((page - 1) * limit) as usize;
        let events = matched
            .into_iter()
            .skip(start)
            .take(limit as usize)
            .collect();
        Ok(EventPage {
            events,
            total,
            page,
            limit,
        })
    }

    async fn stats(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<EventStats> {
        self.check_events()?;
        let start = start.unwrap_or(DateTime::<Utc>::MIN_UTC);
        let end = end.unwrap_or_else(Utc::now);
        let mut stats = EventStats::default();
        for event in self.events.lock().iter() {
            if event.timestamp >= start && event.timestamp <= end {
                stats.total += 1;
                *stats.by_severity.entry(event.severity).or_insert(0) += 1;
                *stats.by_service.entry(event.service.clone()).or_insert(0) += 1;
            }
        }
        Ok(stats)
    }

    async fn assign_incident(&self, event_ids: &[Uuid], incident_id: Uuid) -> Result<u64> {
        self.check_events()?;
        let wanted: HashSet<Uuid> = event_ids.iter().copied().collect();
        let mut updated = 0;
        for event in self.events.lock().iter_mut() {
            if wanted.contains(&event.id) && event.incident_id.is_none() {
                event.incident_id = Some(incident_id);
                updated += 1;
            }
        }
        Ok(updated)
    }
}

#[async_trait]
impl IncidentRepository for MemoryStore {
    async fn create(&self, incident: &Incident) -> Result<()> {
        let mut store = self.incidents.lock();
        if store.contains_key(&incident.id) {
            return Err(Error::Conflict(format!(
                "incident {} already exists",
                incident.id
            )));
        }
        store.insert(incident.id, incident.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Incident>> {
        Ok(self.incidents.lock().get(&id).cloned())
    }

    async fn find_extension_candidate(
        &self,
        service: &str,
        created_after: DateTime<Utc>,
    ) -> Result<Option<Incident>> {
        let store = self.incidents.lock();
        let mut candidates: Vec<&Incident> = store
            .values()
            .filter(|i| {
                i.status.is_open()
                    && i.created_at >= created_after
                    && i.affected_services.iter().any(|s| s == service)
            })
            .collect();
        candidates.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(candidates.first().map(|i| (*i).clone()))
    }

    async fn find_summary_needed(
        &self,
        created_after: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Incident>> {
        let store = self.incidents.lock();
        let mut out: Vec<Incident> = store
            .values()
            .filter(|i| i.status.is_open() && i.created_at >= created_after && !i.has_ai_summary())
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            b.severity_score
                .cmp(&a.severity_score)
                .then(b.created_at.cmp(&a.created_at))
        });
        out.truncate(limit.max(0) as usize);
        Ok(out)
    }

    async fn find_active(&self) -> Result<Vec<Incident>> {
        let store = self.incidents.lock();
        let mut out: Vec<Incident> = store.values().filter(|i| i.status.is_open()).cloned().collect();
        out.sort_by(|a, b| {
            b.severity_score
                .cmp(&a.severity_score)
                .then(b.created_at.cmp(&a.created_at))
        });
        Ok(out)
    }

    async fn list(&self, filter: &IncidentFilter) -> Result<IncidentPage> {
        let limit = filter
            .limit
            .unwrap_or(defaults::PAGE_LIMIT)
            .clamp(1, defaults::PAGE_LIMIT_MAX);
        let page = filter.page.unwrap_or(1).max(1);

        let mut matched: Vec<Incident> = self
            .incidents
            .lock()
            .values()
            .filter(|i| matches_incident(i, filter))
            .cloned()
            .collect();
        match filter.sort.as_deref() {
            Some("created_at:asc") => matched.sort_by(|a, b| a.created_at.cmp(&b.created_at)),
            Some("severity_score:desc") => matched.sort_by(|a, b| {
                b.severity_score
                    .cmp(&a.severity_score)
                    .then(b.created_at.cmp(&a.created_at))
            }),
            _ => matched.sort_by(|a, b| b.created_at.cmp(&a.created_at)),
        }

        let total = matched.len() as i64;
        let start = ((page - 1) * limit) as usize;
        let incidents = matched
            .into_iter()
            .skip(start)
            .take(limit as usize)
            .collect();
        Ok(IncidentPage {
            incidents,
            total,
            page,
            limit,
        })
    }

    async fn extend(&self, id: Uuid, patch: &IncidentExtension) -> Result<()> {
        let mut store = self.incidents.lock();
        let incident = store
            .get_mut(&id)
            .filter(|i| i.status.is_open())
            .ok_or_else(|| Error::NotFound(format!("open incident {id}")))?;
        incident.event_ids = patch.event_ids.clone();
        incident.severity_score = incident.severity_score.max(patch.severity_score);
        incident.affected_services = patch.affected_services.clone();
        incident.summary = patch.summary.clone();
        incident.updated_at = Utc::now();
        Ok(())
    }

    async fn apply_summary(&self, id: Uuid, patch: &AiSummaryPatch) -> Result<()> {
        let mut store = self.incidents.lock();
        let incident = store
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("incident {id}")))?;
        incident.ai_summary = Some(patch.ai_summary.clone());
        if let Some(ref root_cause) = patch.root_cause {
            incident.root_cause = Some(root_cause.clone());
        }
        incident.suggested_actions = patch.suggested_actions.clone();
        incident.updated_at = Utc::now();
        Ok(())
    }

    async fn apply_patch(&self, id: Uuid, patch: &IncidentPatch) -> Result<Incident> {
        let mut store = self.incidents.lock();
        let incident = store
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("incident {id}")))?;
        if let Some(status) = patch.status {
            incident.status = status;
            incident.resolved_at = if status == IncidentStatus::Resolved {
                Some(Utc::now())
            } else {
                None
            };
        }
        if let Some(ref assigned_to) = patch.assigned_to {
            incident.assigned_to = Some(assigned_to.clone());
            incident.acknowledged_at.get_or_insert_with(Utc::now);
        }
        if let Some(ref resolution) = patch.resolution {
            incident.resolution = Some(resolution.clone());
        }
        if let Some(ref root_cause) = patch.root_cause {
            incident.root_cause = Some(root_cause.clone());
        }
        incident.updated_at = Utc::now();
        Ok(incident.clone())
    }
}

#[async_trait]
impl StatsRepository for MemoryStore {
    async fn upsert_count(&self, service: &str, window_key: &str, count: i64) -> Result<()> {
        self.check_stats()?;
        let mut store = self.stats.lock();
        let key = (service.to_string(), window_key.to_string());
        let entry = store.entry(key).or_insert_with(|| ServiceStats {
            service: service.to_string(),
            window_key: window_key.to_string(),
            count: 0,
            timestamp: Utc::now(),
        });
        entry.count += count;
        entry.timestamp = Utc::now();
        Ok(())
    }

    async fn find_recent(&self, service: &str, limit: i64) -> Result<Vec<ServiceStats>> {
        self.check_stats()?;
        let store = self.stats.lock();
        let mut out: Vec<ServiceStats> = store
            .values()
            .filter(|s| s.service == service)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.window_key.cmp(&a.window_key));
        out.truncate(limit.max(0) as usize);
        Ok(out)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.check_stats()?;
        let mut store = self.stats.lock();
        let before = store.len();
        store.retain(|_, s| s.timestamp >= cutoff);
        Ok((before - store.len()) as u64)
    }
}
