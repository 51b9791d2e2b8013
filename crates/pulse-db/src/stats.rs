//! Rolling service-stats repository implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use pulse_core::{Error, Result, ServiceStats, StatsRepository};

/// PostgreSQL implementation of [`StatsRepository`].
pub struct PgStatsRepository {
    pool: PgPool,
}

impl PgStatsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn parse_stats_row(row: sqlx::postgres::PgRow) -> ServiceStats {
        ServiceStats {
            service: row.get("service"),
            window_key: row.get("window_key"),
            count: row.get("count"),
            timestamp: row.get("timestamp"),
        }
    }
}

#[async_trait]
impl StatsRepository for PgStatsRepository {
    async fn upsert_count(&self, service: &str, window_key: &str, count: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO service_stats (service, window_key, count, timestamp)
             VALUES ($1, $2, $3, NOW())
             ON CONFLICT (service, window_key)
             DO UPDATE SET count = service_stats.count + EXCLUDED.count,
                           timestamp = EXCLUDED.timestamp",
        )
        .bind(service)
        .bind(window_key)
        .bind(count)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn find_recent(&self, service: &str, limit: i64) -> Result<Vec<ServiceStats>> {
        // Window keys are fixed-width millisecond strings, so the
        // lexicographic order matches chronological order.
        let rows = sqlx::query(
            "SELECT * FROM service_stats
             WHERE service = $1
             ORDER BY window_key DESC
             LIMIT $2",
        )
        .bind(service)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(rows.into_iter().map(Self::parse_stats_row).collect())
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM service_stats WHERE timestamp < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(result.rows_affected())
    }
}
