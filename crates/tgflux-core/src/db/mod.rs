use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions},
    Pool, Postgres,
};

use crate::config::DatabaseSettings;

pub type DbPool = Pool<Postgres>;

/// Establish a new Postgres connection pool using sensible defaults for the
/// pipeline services.
pub async fn connect(settings: &DatabaseSettings) -> Result<DbPool> {
    let options = settings
        .connect_options()
        .with_context(|| "invalid database connection settings")?;
    connect_with(options).await
}

pub async fn connect_url(database_url: &str) -> Result<DbPool> {
    connect(&DatabaseSettings::Url(database_url.to_string())).await
}

async fn connect_with(options: PgConnectOptions) -> Result<DbPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await
        .with_context(|| "failed to connect to Postgres")
}

/// Run database migrations embedded at compile-time. Every table is created
/// only when absent, so stages call this before writing.
pub async fn run_migrations(pool: &DbPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .with_context(|| "failed to run database migrations")
}
