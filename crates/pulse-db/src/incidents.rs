//! Incident repository implementation.
//!
//! Every mutation here is a field-scoped UPDATE with an explicit column
//! list. The aggregation worker owns `{event_ids, severity_score,
//! affected_services, summary}` and the summarization worker owns
//! `{ai_summary, root_cause, suggested_actions}`, so concurrent writers
//! never clobber each other's slots.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use pulse_core::{
    defaults, AiSummaryPatch, Error, Incident, IncidentExtension, IncidentFilter, IncidentPage,
    IncidentPatch, IncidentRepository, IncidentStatus, Result,
};

/// PostgreSQL implementation of [`IncidentRepository`].
pub struct PgIncidentRepository {
    pool: PgPool,
}

impl PgIncidentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn parse_incident_row(row: sqlx::postgres::PgRow) -> Incident {
        let status: String = row.get("status");
        Incident {
            id: row.get("id"),
            event_ids: row.get("event_ids"),
            status: IncidentStatus::parse(&status).unwrap_or(IncidentStatus::Active),
            severity_score: row.get("severity_score"),
            affected_services: row.get("affected_services"),
            summary: row.get("summary"),
            ai_summary: row.get("ai_summary"),
            root_cause: row.get("root_cause"),
            resolution: row.get("resolution"),
            suggested_actions: row.get("suggested_actions"),
            assigned_to: row.get("assigned_to"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            acknowledged_at: row.get("acknowledged_at"),
            resolved_at: row.get("resolved_at"),
        }
    }

    fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, filter: &IncidentFilter) {
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(min) = filter.min_severity {
            qb.push(" AND severity_score >= ").push_bind(min);
        }
        if let Some(ref service) = filter.service {
            qb.push(" AND ")
                .push_bind(service.clone())
                .push(" = ANY(affected_services)");
        }
        if let Some(start) = filter.start_date {
            qb.push(" AND created_at >= ").push_bind(start);
        }
        if let Some(end) = filter.end_date {
            qb.push(" AND created_at <= ").push_bind(end);
        }
    }

    fn order_clause(sort: Option<&str>) -> &'static str {
        match sort {
            Some("created_at:asc") => " ORDER BY created_at ASC",
            Some("severity_score:desc") => " ORDER BY severity_score DESC, created_at DESC",
            Some("severity_score:asc") => " ORDER BY severity_score ASC, created_at DESC",
            _ => " ORDER BY created_at DESC",
        }
    }
}

#[async_trait]
impl IncidentRepository for PgIncidentRepository {
    async fn create(&self, incident: &Incident) -> Result<()> {
        sqlx::query(
            "INSERT INTO incidents
                 (id, event_ids, status, severity_score, affected_services, summary,
                  ai_summary, root_cause, resolution, suggested_actions, assigned_to,
                  created_at, updated_at, acknowledged_at, resolved_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
        )
        .bind(incident.id)
        .bind(&incident.event_ids)
        .bind(incident.status.as_str())
        .bind(incident.severity_score)
        .bind(&incident.affected_services)
        .bind(&incident.summary)
        .bind(&incident.ai_summary)
        .bind(&incident.root_cause)
        .bind(&incident.resolution)
        .bind(&incident.suggested_actions)
        .bind(&incident.assigned_to)
        .bind(incident.created_at)
        .bind(incident.updated_at)
        .bind(incident.acknowledged_at)
        .bind(incident.resolved_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                Error::Conflict(format!("incident {} already exists", incident.id))
            }
            other => Error::Database(other),
        })?;
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Incident>> {
        let row = sqlx::query("SELECT * FROM incidents WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(row.map(Self::parse_incident_row))
    }

    async fn find_extension_candidate(
        &self,
        service: &str,
        created_after: DateTime<Utc>,
    ) -> Result<Option<Incident>> {
        let row = sqlx::query(
            "SELECT * FROM incidents
             WHERE $1 = ANY(affected_services)
               AND status IN ('active', 'investigating')
               AND created_at >= $2
             ORDER BY created_at DESC
             LIMIT 1",
        )
        .bind(service)
        .bind(created_after)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(row.map(Self::parse_incident_row))
    }

    async fn find_summary_needed(
        &self,
        created_after: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Incident>> {
        let rows = sqlx::query(
            "SELECT * FROM incidents
             WHERE status IN ('active', 'investigating')
               AND created_at >= $1
               AND (ai_summary IS NULL OR ai_summary = '')
             ORDER BY severity_score DESC, created_at DESC
             LIMIT $2",
        )
        .bind(created_after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(rows.into_iter().map(Self::parse_incident_row).collect())
    }

    async fn find_active(&self) -> Result<Vec<Incident>> {
        let rows = sqlx::query(
            "SELECT * FROM incidents
             WHERE status IN ('active', 'investigating')
             ORDER BY severity_score DESC, created_at DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(rows.into_iter().map(Self::parse_incident_row).collect())
    }

    async fn list(&self, filter: &IncidentFilter) -> Result<IncidentPage> {
        let limit = filter
            .limit
            .unwrap_or(defaults::PAGE_LIMIT)
            .clamp(1, defaults::PAGE_LIMIT_MAX);
        let page = filter.page.unwrap_or(1).max(1);
        let offset = (page - 1) * limit;

        let mut count_qb: QueryBuilder<'_, Postgres> =
            QueryBuilder::new("SELECT COUNT(*) AS total FROM incidents WHERE TRUE");
        Self::push_filters(&mut count_qb, filter);
        let total: i64 = count_qb
            .build()
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)?
            .get("total");

        let mut qb: QueryBuilder<'_, Postgres> =
            QueryBuilder::new("SELECT * FROM incidents WHERE TRUE");
        Self::push_filters(&mut qb, filter);
        qb.push(Self::order_clause(filter.sort.as_deref()));
        qb.push(" LIMIT ").push_bind(limit);
        qb.push(" OFFSET ").push_bind(offset);

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;

        Ok(IncidentPage {
            incidents: rows.into_iter().map(Self::parse_incident_row).collect(),
            total,
            page,
            limit,
        })
    }

    async fn extend(&self, id: Uuid, patch: &IncidentExtension) -> Result<()> {
        // GREATEST keeps the score monotone even if a racing run
        // computed a lower value from a smaller cluster.
        let result = sqlx::query(
            "UPDATE incidents SET
                 event_ids = $2,
                 severity_score = GREATEST(severity_score, $3),
                 affected_services = $4,
                 summary = $5,
                 updated_at = NOW()
             WHERE id = $1 AND status IN ('active', 'investigating')",
        )
        .bind(id)
        .bind(&patch.event_ids)
        .bind(patch.severity_score)
        .bind(&patch.affected_services)
        .bind(&patch.summary)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("open incident {id}")));
        }
        Ok(())
    }

    async fn apply_summary(&self, id: Uuid, patch: &AiSummaryPatch) -> Result<()> {
        let result = sqlx::query(
            "UPDATE incidents SET
                 ai_summary = $2,
                 root_cause = COALESCE($3, root_cause),
                 suggested_actions = $4,
                 updated_at = NOW()
             WHERE id = $1",
        )
        .bind(id)
        .bind(&patch.ai_summary)
        .bind(&patch.root_cause)
        .bind(&patch.suggested_actions)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("incident {id}")));
        }
        Ok(())
    }

    async fn apply_patch(&self, id: Uuid, patch: &IncidentPatch) -> Result<Incident> {
        let mut qb: QueryBuilder<'_, Postgres> =
            QueryBuilder::new("UPDATE incidents SET updated_at = NOW()");

        if let Some(status) = patch.status {
            qb.push(", status = ").push_bind(status.as_str());
            if status == IncidentStatus::Resolved {
                qb.push(", resolved_at = NOW()");
            } else {
                qb.push(", resolved_at = NULL");
            }
        }
        if let Some(ref assigned_to) = patch.assigned_to {
            qb.push(", assigned_to = ").push_bind(assigned_to.clone());
            qb.push(", acknowledged_at = COALESCE(acknowledged_at, NOW())");
        }
        if let Some(ref resolution) = patch.resolution {
            qb.push(", resolution = ").push_bind(resolution.clone());
        }
        if let Some(ref root_cause) = patch.root_cause {
            qb.push(", root_cause = ").push_bind(root_cause.clone());
        }

        qb.push(" WHERE id = ").push_bind(id);
        qb.push(" RETURNING *");

        let row = qb
            .build()
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?
            .ok_or_else(|| Error::NotFound(format!("incident {id}")))?;

        Ok(Self::parse_incident_row(row))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_clause_whitelist() {
        assert_eq!(
            PgIncidentRepository::order_clause(None),
            " ORDER BY created_at DESC"
        );
        assert_eq!(
            PgIncidentRepository::order_clause(Some("severity_score:desc")),
            " ORDER BY severity_score DESC, created_at DESC"
        );
        assert_eq!(
            PgIncidentRepository::order_clause(Some("anything else")),
            " ORDER BY created_at DESC"
        );
    }
}
