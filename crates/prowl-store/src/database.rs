use chrono::TimeDelta;
use prowl_core::AppError;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::config::DatabaseConfig;
use crate::session_repository::PgSessionStore;

/// Central database facade: owns the connection pool, runs migrations,
/// and vends the session store.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    retention: TimeDelta,
}

impl Database {
    /// Connect to PostgreSQL with the given configuration.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .map_err(|e| AppError::StoreError(format!("Failed to connect: {e}")))?;

        Ok(Self {
            pool,
            retention: config.retention(),
        })
    }

    /// Create a `Database` from an existing pool (useful for testing).
    pub fn from_pool(pool: PgPool, retention: TimeDelta) -> Self {
        Self { pool, retention }
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<(), AppError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::StoreError(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// Get a [`PgSessionStore`] backed by this pool.
    pub fn sessions(&self) -> PgSessionStore {
        PgSessionStore::new(self.pool.clone(), self.retention)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
