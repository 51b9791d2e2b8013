//! # pulse-db
//!
//! PostgreSQL store for the pulse incident pipeline.
//!
//! This crate provides:
//! - Connection pool management
//! - Repository implementations for events, incidents, and rolling
//!   service stats
//! - An in-memory store implementing the same traits for tests
//!
//! All incident mutations are field-scoped UPDATEs: the aggregation
//! worker and the summarization worker write disjoint column sets and
//! never replace whole rows.

pub mod events;
pub mod incidents;
pub mod memory;
pub mod pool;
pub mod stats;

use std::sync::Arc;

use sqlx::PgPool;

use pulse_core::{Error, Result};

pub use events::PgEventRepository;
pub use incidents::PgIncidentRepository;
pub use memory::MemoryStore;
pub use pool::{create_pool, create_pool_with_config, PoolConfig};
pub use stats::PgStatsRepository;

// Re-export core types
pub use pulse_core::{
    AiSummaryPatch, BulkInsertReport, EventRepository, IncidentExtension, IncidentRepository,
    RowError, StatsRepository,
};

/// Handle bundling the connection pool and all repositories.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    pub events: Arc<PgEventRepository>,
    pub incidents: Arc<PgIncidentRepository>,
    pub stats: Arc<PgStatsRepository>,
}

impl Database {
    /// Connect with default pool configuration.
    pub async fn connect(database_url: &str) -> Result<Self> {
        Self::connect_with_config(database_url, PoolConfig::default()).await
    }

    /// Connect with explicit pool configuration.
    pub async fn connect_with_config(database_url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool_with_config(database_url, config).await?;
        Ok(Self::from_pool(pool))
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            events: Arc::new(PgEventRepository::new(pool.clone())),
            incidents: Arc::new(PgIncidentRepository::new(pool.clone())),
            stats: Arc::new(PgStatsRepository::new(pool.clone())),
            pool,
        }
    }

    /// Apply embedded migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::StoreUnavailable(format!("migration failed: {e}")))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
