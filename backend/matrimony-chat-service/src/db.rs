use crate::config::Config;
use crate::error::AppError;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use std::time::Duration;
use tokio_postgres::{Config as PgConfig, NoTls};
use tracing::{error, info};

const MIGRATIONS: &[(&str, &str)] = &[
    (
        "0001_chat_core",
        include_str!("../migrations/0001_chat_core.sql"),
    ),
    (
        "0002_usage_idempotency",
        include_str!("../migrations/0002_usage_idempotency.sql"),
    ),
];

pub async fn init_pool(database_url: &str, cfg: &Config) -> Result<Pool, AppError> {
    let pg_config: PgConfig = database_url
        .parse()
        .map_err(|e| AppError::Config(format!("invalid DATABASE_URL: {e}")))?;

    let mgr = Manager::from_config(
        pg_config,
        NoTls,
        ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        },
    );
    let pool = Pool::builder(mgr)
        .max_size(cfg.db_max_connections as usize)
        .runtime(Runtime::Tokio1)
        .wait_timeout(Some(Duration::from_secs(cfg.db_acquire_timeout_secs)))
        .build()
        .map_err(|e| AppError::StartServer(format!("db pool: {e}")))?;

    // Fail fast when the database is unreachable at startup
    let client = pool.get().await.map_err(|e| {
        error!(error = %e, "Database connection verification failed");
        AppError::StartServer(format!("db connect: {e}"))
    })?;
    client
        .simple_query("SELECT 1")
        .await
        .map_err(|e| AppError::StartServer(format!("db verify: {e}")))?;

    info!(
        max_connections = cfg.db_max_connections,
        "Database pool created and verified successfully"
    );
    Ok(pool)
}

/// Apply the embedded schema. Every statement is idempotent.
pub async fn run_migrations(pool: &Pool) -> Result<(), AppError> {
    let client = pool.get().await?;
    for (name, sql) in MIGRATIONS {
        client
            .batch_execute(sql)
            .await
            .map_err(|e| AppError::StartServer(format!("migration {name}: {e}")))?;
        info!(migration = %name, "migration applied");
    }
    Ok(())
}
