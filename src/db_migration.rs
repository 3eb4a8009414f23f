//! Embedded SQL migrations, applied at engine startup.

use chrono::Utc;
use log::{debug, info};
use sqlx::SqlitePool;

use crate::errors::{DbError, DbResult};

const MIGRATION_EXPORT_JOBS: &str =
    include_str!("../migrations/20250601000000_create_export_jobs.sql");
const MIGRATION_EXPORT_SCHEDULES: &str =
    include_str!("../migrations/20250601000001_create_export_schedules.sql");

const MIGRATIONS: &[(&str, &str)] = &[
    ("20250601000000_create_export_jobs.sql", MIGRATION_EXPORT_JOBS),
    (
        "20250601000001_create_export_schedules.sql",
        MIGRATION_EXPORT_SCHEDULES,
    ),
];

/// Apply any migrations not yet recorded in the `migrations` table.
pub async fn initialize_database(pool: &SqlitePool) -> DbResult<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS migrations (
            name TEXT PRIMARY KEY NOT NULL,
            applied_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    for (name, sql) in MIGRATIONS {
        let applied: Option<(String,)> =
            sqlx::query_as("SELECT name FROM migrations WHERE name = ?")
                .bind(name)
                .fetch_optional(pool)
                .await?;
        if applied.is_some() {
            debug!("migration {} already applied", name);
            continue;
        }
        sqlx::raw_sql(sql)
            .execute(pool)
            .await
            .map_err(|e| DbError::Migration(format!("{}: {}", name, e)))?;
        sqlx::query("INSERT INTO migrations (name, applied_at) VALUES (?, ?)")
            .bind(name)
            .bind(Utc::now().to_rfc3339())
            .execute(pool)
            .await?;
        info!("applied migration {}", name);
    }
    Ok(())
}
