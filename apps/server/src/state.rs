//! Shared application state handed to every handler.

use sqlx::PgPool;
use std::sync::Arc;

use crate::{
    auth::{AuthGate, MemoryRevocationList, PostgresRevocationList, RevocationList},
    config::{Config, StorageBackend},
    db::{self, CachedCatalog, MemoryStore, OperationCatalog, PostgresStore, RequestStore, RetryPolicy},
    services::{CatalogService, RequestLifecycle},
    Result,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub lifecycle: Arc<RequestLifecycle>,
    pub catalog: Arc<CatalogService>,
    pub auth: Arc<AuthGate>,
    /// Present for the Postgres backend only.
    pub db_pool: Option<PgPool>,
}

impl AppState {
    /// Build state for the configured storage backend.
    ///
    /// For Postgres this opens the pool and, unless disabled, applies migrations.
    pub async fn new(config: Config) -> Result<Self> {
        match config.storage.backend {
            StorageBackend::Memory => {
                tracing::warn!("Using in-memory storage; data is lost on restart");
                Ok(Self::in_memory(config))
            }
            StorageBackend::Postgres => {
                let pool = db::connect(&config.database).await?;
                let store = PostgresStore::new(
                    pool.clone(),
                    RetryPolicy::from_config(&config.database.retry),
                );
                if config.database.run_migrations {
                    store.migrate().await?;
                }
                tracing::info!(
                    pool_max_size = config.database.pool_max_size,
                    "Connected to PostgreSQL"
                );

                let store = Arc::new(store);
                let revocations = Arc::new(PostgresRevocationList::new(pool.clone()));
                Ok(Self::assemble(
                    config,
                    store.clone(),
                    store,
                    revocations,
                    Some(pool),
                ))
            }
        }
    }

    /// State over a fresh [`MemoryStore`], whatever the configured backend.
    pub fn in_memory(config: Config) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::assemble(
            config,
            store.clone(),
            store,
            Arc::new(MemoryRevocationList::new()),
            None,
        )
    }

    fn assemble(
        config: Config,
        requests: Arc<dyn RequestStore>,
        operations: Arc<dyn OperationCatalog>,
        revocations: Arc<dyn RevocationList>,
        db_pool: Option<PgPool>,
    ) -> Self {
        let catalog: Arc<dyn OperationCatalog> = Arc::new(CachedCatalog::new(
            operations,
            config.catalog.cache_capacity,
        ));
        let lifecycle = RequestLifecycle::new(
            requests,
            catalog.clone(),
            config.lifecycle.operation_timeout(),
        );
        let auth = AuthGate::new(config.auth.clone(), revocations);

        Self {
            lifecycle: Arc::new(lifecycle),
            catalog: Arc::new(CatalogService::new(catalog)),
            auth: Arc::new(auth),
            config: Arc::new(config),
            db_pool,
        }
    }
}
