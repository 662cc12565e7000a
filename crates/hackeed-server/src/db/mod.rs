//! Postgres storage.
//!
//! # Tables
//!
//! - `products` - catalog with general stock and the `variants` JSONB
//! - `customers`, `addresses` - keyed by email, one shipping address each
//! - `orders`, `order_items` - one order per checkout session
//! - `stripe_events` - webhook ledger keyed by provider event id
//!
//! # Migrations
//!
//! Stored in `crates/hackeed-server/migrations/` and applied at start-up
//! when `RUN_MIGRATIONS=true`.

pub mod catalog;
pub mod ledger;

use std::time::Duration;

use hackeed_core::CoreError;
use secrecy::{ExposeSecret, SecretString};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;

pub use catalog::PgCatalogStore;
pub use ledger::PgOrderLedger;

/// Errors that can occur during repository operations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Database error from sqlx.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Data in the database is corrupted or invalid.
    #[error("data corruption: {0}")]
    DataCorruption(String),
}

impl From<RepositoryError> for CoreError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::Database(e) => CoreError::Storage(e.to_string()),
            RepositoryError::DataCorruption(detail) => CoreError::DataCorruption(detail),
        }
    }
}

/// Create a `PostgreSQL` connection pool.
///
/// # Errors
///
/// Returns `sqlx::Error` if the connection cannot be established.
pub async fn create_pool(
    database_url: &SecretString,
    max_connections: u32,
) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .min_connections(2.min(max_connections))
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url.expose_secret())
        .await
}

/// Apply pending migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
