pub mod memory;
pub mod migrations;
pub mod pool;
pub mod repositories;

pub use pool::{create_pool, DbPool};

use std::sync::Arc;

use anyhow::Result;
use services::entitlement::ports::{EntitlementLedger, UsageLogStore};

use memory::MemoryLedger;
use repositories::{PostgresEntitlementLedger, PostgresUsageLogStore};

/// Storage backend handle: PostgreSQL in production, the in-memory ledger
/// when `DATABASE_MOCK=true` (local development and hermetic tests).
pub struct Database {
    pool: Option<DbPool>,
    ledger: Arc<dyn EntitlementLedger>,
    usage_log: Arc<dyn UsageLogStore>,
}

impl Database {
    pub async fn from_config(config: &config::DatabaseConfig) -> Result<Self> {
        if config.mock {
            tracing::warn!("DATABASE_MOCK is set; state will not survive a restart");
            let memory = Arc::new(MemoryLedger::new());
            return Ok(Self {
                pool: None,
                ledger: memory.clone(),
                usage_log: memory,
            });
        }

        let pool = create_pool(config)?;
        Ok(Self {
            pool: Some(pool.clone()),
            ledger: Arc::new(PostgresEntitlementLedger::new(pool.clone())),
            usage_log: Arc::new(PostgresUsageLogStore::new(pool)),
        })
    }

    /// Apply the embedded schema. No-op in mock mode.
    pub async fn run_migrations(&self) -> Result<()> {
        match &self.pool {
            Some(pool) => migrations::run(pool).await,
            None => Ok(()),
        }
    }

    pub fn entitlement_ledger(&self) -> Arc<dyn EntitlementLedger> {
        self.ledger.clone()
    }

    pub fn usage_log_store(&self) -> Arc<dyn UsageLogStore> {
        self.usage_log.clone()
    }
}
