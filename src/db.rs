//! SQLite pool setup and embedded migrations.

use anyhow::{Context, Result};
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::{path::Path, str::FromStr, sync::Arc};

/// Open (creating if needed) the database behind `database_url`.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<Arc<SqlitePool>> {
    let db_path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {}", parent.display()))?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let options = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("parsing database url `{database_url}`"))?
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
        .with_context(|| format!("connecting to {database_url}"))?;
    Ok(Arc::new(pool))
}

/// Apply the SQL migrations embedded from `migrations/`.
pub async fn migrate(db: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(db)
        .await
        .context("running migrations")?;
    Ok(())
}

/// Private in-memory database with the schema applied. A single connection
/// keeps every query on the same memory database.
pub async fn connect_in_memory() -> Result<Arc<SqlitePool>> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .context("opening in-memory database")?;
    migrate(&pool).await?;
    Ok(Arc::new(pool))
}
