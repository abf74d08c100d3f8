use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use std::env;
use tracing::info;

/// Opens the ledger database and ensures its schema exists.
///
/// Defaults to `flood.db` in the working directory; `DATABASE_URL`
/// overrides it.
pub async fn setup_database() -> anyhow::Result<SqlitePool> {
    let db_url =
        env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://flood.db?mode=rwc".to_string());

    info!("📂 Ledger database: {}", db_url);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&db_url)
        .await?;

    run_migrations(&pool).await?;

    info!("✅ Ledger database ready");
    Ok(pool)
}

pub async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS attempt_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            profile TEXT NOT NULL,
            bucket TEXT NOT NULL,
            key TEXT NOT NULL,
            attempt_number INTEGER NOT NULL,
            timestamp TEXT NOT NULL,
            outcome TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_attempt_records_identity \
         ON attempt_records(profile, bucket, key)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
