// Database module for the Vaulthalla daemon
// Connection pool plus the Postgres implementation of the Store contracts

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

use vaulthalla_core::Error;

pub mod fs;
pub mod rbac;
pub mod sync;
pub mod users;
pub mod vaults;

/// Postgres-backed implementation of the full Store trait family.
///
/// Queries are runtime-checked (`sqlx::query_as`) so the workspace builds
/// without a database; the schema lives in `backend/migrations/`.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Creates the connection pool.
pub async fn create_pool(config: &vaulthalla_config::DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .connect(&config.url)
        .await
}

/// Runs database migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// Map a sqlx failure onto the error taxonomy: constraint clashes become
/// `Conflict`, connection trouble is retryable `Transient`, the rest is
/// `Internal`.
pub(crate) fn db_err(context: &str, e: sqlx::Error) -> Error {
    match &e {
        sqlx::Error::Database(db) if db.constraint().is_some() => {
            Error::Conflict(format!("{context}: {}", db.message()))
        }
        sqlx::Error::RowNotFound => Error::NotFound(context.to_string()),
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => {
            Error::Transient(format!("{context}: {e}"))
        }
        _ => Error::Internal(format!("{context}: {e}")),
    }
}
