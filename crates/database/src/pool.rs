use deadpool_postgres::{Config, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tokio_postgres::NoTls;

/// Connection pool type alias
pub type DbPool = Pool;

pub fn create_pool(config: &config::DatabaseConfig) -> anyhow::Result<DbPool> {
    let mut cfg = Config::new();
    cfg.host = Some(config.host.clone());
    cfg.port = Some(config.port);
    cfg.dbname = Some(config.database.clone());
    cfg.user = Some(config.username.clone());
    cfg.password = Some(config.password.clone());
    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });
    if let Some(pool_cfg) = cfg.pool.as_mut() {
        pool_cfg.max_size = config.max_connections as usize;
    } else {
        cfg.pool = Some(deadpool_postgres::PoolConfig::new(
            config.max_connections as usize,
        ));
    }

    tracing::info!(
        host = %config.host,
        port = config.port,
        database = %config.database,
        max_connections = config.max_connections,
        "Creating database connection pool"
    );

    cfg.create_pool(Some(Runtime::Tokio1), NoTls)
        .map_err(|e| anyhow::anyhow!("Failed to create connection pool: {}", e))
}
