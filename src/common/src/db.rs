//! Database bootstrap for the trade log and position store.

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;

use crate::repository;
use crate::Config;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("Failed to connect to database: {0}")]
    Connection(#[from] sqlx::Error),

    #[error("Schema bootstrap failed: {0}")]
    Schema(sqlx::Error),
}

/// Connection pool plus the engine's schema guarantee: constructing a
/// `Database` leaves the trades and positions tables ready to use.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect, check that the server answers, and bootstrap the schema.
    /// Any failure here is fatal to the engine.
    pub async fn connect(config: &Config) -> Result<Self, DbError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&config.database_url)
            .await?;
        sqlx::query("SELECT 1").execute(&pool).await?;
        repository::ensure_schema(&pool)
            .await
            .map_err(DbError::Schema)?;
        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
