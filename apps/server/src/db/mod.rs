//! Database layer - store contracts and backends

pub mod cache;
pub mod memory;
pub mod postgres;
pub mod retry;
pub mod traits;

use sqlx::{postgres::PgPoolOptions, Executor, PgPool};
use std::time::Duration;

use crate::{config::DatabaseConfig, Result};

pub use cache::CachedCatalog;
pub use memory::MemoryStore;
pub use postgres::{PostgresRequestTransaction, PostgresStore};
pub use retry::RetryPolicy;
pub use traits::{OperationCatalog, RequestStore, RequestTransaction};

/// Open a connection pool with per-session statement and lock timeouts.
pub async fn connect(config: &DatabaseConfig) -> Result<PgPool> {
    let statement_timeout_ms = config.statement_timeout_seconds * 1000;
    let lock_timeout_ms = config.lock_timeout_seconds * 1000;

    let pool = PgPoolOptions::new()
        .min_connections(config.pool_min_size)
        .max_connections(config.pool_max_size)
        .acquire_timeout(Duration::from_secs(config.pool_timeout_seconds))
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                conn.execute(
                    format!(
                        "SET statement_timeout = {statement_timeout_ms}; \
                         SET lock_timeout = {lock_timeout_ms}"
                    )
                    .as_str(),
                )
                .await?;
                Ok(())
            })
        })
        .connect(&config.url)
        .await?;

    Ok(pool)
}
