//! # Database Access
//!
//! Connection pool construction and embedded migrations. The migrator is
//! shared with `#[sqlx::test]` so test databases get the same schema the
//! server runs with.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use crate::error::EngineResult;

/// Embedded migrations from the `migrations/` directory
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

/// Connect to Postgres with engine defaults
pub async fn connect(database_url: &str) -> EngineResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;

    info!("database pool established");
    Ok(pool)
}

/// Run pending migrations
pub async fn migrate(pool: &PgPool) -> EngineResult<()> {
    MIGRATOR.run(pool).await?;
    info!("database migrations applied");
    Ok(())
}
