//! Event repository implementation.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use pulse_core::{
    defaults, BulkInsertReport, Error, Event, EventFilter, EventPage, EventRepository, EventStats,
    Result, RowError,
};

/// PostgreSQL implementation of [`EventRepository`].
pub struct PgEventRepository {
    pool: PgPool,
}

impl PgEventRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn parse_event_row(row: sqlx::postgres::PgRow) -> Event {
        Event {
            id: row.get("id"),
            service: row.get("service"),
            severity: row.get("severity"),
            timestamp: row.get("timestamp"),
            metadata: row.get("metadata"),
            tags: row.get("tags"),
            incident_id: row.get("incident_id"),
        }
    }

    /// Append filter predicates shared by the list and count queries.
    fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, filter: &EventFilter) {
        if let Some(ref service) = filter.service {
            qb.push(" AND service = ").push_bind(service.clone());
        }
        if let Some(severity) = filter.severity {
            qb.push(" AND severity = ").push_bind(severity);
        }
        if let Some(min) = filter.min_severity {
            qb.push(" AND severity >= ").push_bind(min);
        }
        if let Some(max) = filter.max_severity {
            qb.push(" AND severity <= ").push_bind(max);
        }
        if let Some(start) = filter.start_date {
            qb.push(" AND timestamp >= ").push_bind(start);
        }
        if let Some(end) = filter.end_date {
            qb.push(" AND timestamp <= ").push_bind(end);
        }
        if let Some(ref tags) = filter.tags {
            if !tags.is_empty() {
                qb.push(" AND tags && ").push_bind(tags.clone());
            }
        }
    }

    /// Whitelisted ORDER BY clause; defaults to newest first.
    fn order_clause(sort: Option<&str>) -> &'static str {
        match sort {
            Some("timestamp:asc") => " ORDER BY timestamp ASC",
            Some("severity:desc") => " ORDER BY severity DESC, timestamp DESC",
            Some("severity:asc") => " ORDER BY severity ASC, timestamp DESC",
            _ => " ORDER BY timestamp DESC",
        }
    }
}

#[async_trait]
impl EventRepository for PgEventRepository {
    async fn insert_many(&self, events: &[Event]) -> Result<BulkInsertReport> {
        if events.is_empty() {
            return Ok(BulkInsertReport::default());
        }

        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
            "INSERT INTO events (id, service, severity, timestamp, metadata, tags, incident_id) ",
        );
        qb.push_values(events, |mut b, event| {
            b.push_bind(event.id)
                .push_bind(&event.service)
                .push_bind(event.severity)
                .push_bind(event.timestamp)
                .push_bind(&event.metadata)
                .push_bind(&event.tags)
                .push_bind(event.incident_id);
        });
        // Duplicate ids are skipped, not rolled back: the insert is
        // unordered and the losers are reported per row.
        qb.push(" ON CONFLICT (id) DO NOTHING RETURNING id");

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::StoreUnavailable(e.to_string()))?;

        let inserted_ids: HashSet<Uuid> = rows.iter().map(|row| row.get("id")).collect();
        let failed = events
            .iter()
            .enumerate()
            .filter(|(_, event)| !inserted_ids.contains(&event.id))
            .map(|(index, event)| RowError {
                index,
                message: format!("duplicate event id {}", event.id),
            })
            .collect();

        Ok(BulkInsertReport {
            inserted: inserted_ids.len(),
            failed,
        })
    }

    async fn find_recent_unassigned(&self, since: DateTime<Utc>) -> Result<Vec<Event>> {
        let rows = sqlx::query(
            "SELECT * FROM events
             WHERE timestamp >= $1 AND incident_id IS NULL
             ORDER BY timestamp DESC",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.into_iter().map(Self::parse_event_row).collect())
    }

    async fn find_by_ids(&self, ids: &[Uuid], limit: i64) -> Result<Vec<Event>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let rows = sqlx::query(
            "SELECT * FROM events WHERE id = ANY($1)
             ORDER BY timestamp DESC LIMIT $2",
        )
        .bind(ids)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.into_iter().map(Self::parse_event_row).collect())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Event>> {
        let row = sqlx::query("SELECT * FROM events WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        Ok(row.map(Self::parse_event_row))
    }

    async fn list(&self, filter: &EventFilter) -> Result<EventPage> {
        let limit = filter
            .limit
            .unwrap_or(defaults::PAGE_LIMIT)
            .clamp(1, defaults::PAGE_LIMIT_MAX);
        let page = filter.page.unwrap_or(1).max(1);
        let offset = (page - 1) * limit;

        let mut count_qb: QueryBuilder<'_, Postgres> =
            QueryBuilder::new("SELECT COUNT(*) AS total FROM events WHERE TRUE");
        Self::push_filters(&mut count_qb, filter);
        let total: i64 = count_qb
            .build()
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)?
            .get("total");

        let mut qb: QueryBuilder<'_, Postgres> =
            QueryBuilder::new("SELECT * FROM events WHERE TRUE");
        Self::push_filters(&mut qb, filter);
        qb.push(Self::order_clause(filter.sort.as_deref()));
        qb.push(" LIMIT ").push_bind(limit);
        qb.push(" OFFSET ").push_bind(offset);

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;

        Ok(EventPage {
            events: rows.into_iter().map(Self::parse_event_row).collect(),
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
        let start = start.unwrap_or(DateTime::<Utc>::MIN_UTC);
        let end = end.unwrap_or_else(Utc::now);

        let rows = sqlx::query(
            "SELECT service, severity, COUNT(*) AS n FROM events
             WHERE timestamp >= $1 AND timestamp <= $2
             GROUP BY service, severity",
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        let mut stats = EventStats::default();
        for row in rows {
            let service: String = row.get("service");
            let severity: i16 = row.get("severity");
            let n: i64 = row.get("n");
            stats.total += n;
            *stats.by_severity.entry(severity).or_insert(0) += n;
            *stats.by_service.entry(service).or_insert(0) += n;
        }
        Ok(stats)
    }

    async fn assign_incident(&self, event_ids: &[Uuid], incident_id: Uuid) -> Result<u64> {
        if event_ids.is_empty() {
            return Ok(0);
        }
        // The NULL guard makes assignment at-most-once: an event that
        // already belongs to an incident is never re-linked.
        let result = sqlx::query(
            "UPDATE events SET incident_id = $2
             WHERE id = ANY($1) AND incident_id IS NULL",
        )
        .bind(event_ids)
        .bind(incident_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_clause_whitelist() {
        assert_eq!(
            PgEventRepository::order_clause(None),
            " ORDER BY timestamp DESC"
        );
        assert_eq!(
            PgEventRepository::order_clause(Some("timestamp:asc")),
            " ORDER BY timestamp ASC"
        );
        assert_eq!(
            PgEventRepository::order_clause(Some("severity:desc")),
            " ORDER BY severity DESC, timestamp DESC"
        );
        // Unknown fields fall back instead of interpolating user input.
        assert_eq!(
            PgEventRepository::order_clause(Some("id; DROP TABLE events")),
            " ORDER BY timestamp DESC"
        );
    }
}
