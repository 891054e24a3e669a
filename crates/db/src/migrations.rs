use sqlx::migrate::{MigrateError, Migrator};

use crate::DbPool;

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

pub async fn run_pending(pool: &DbPool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

/// Number of migrations embedded in the binary and how many of them are applied.
pub async fn status(pool: &DbPool) -> Result<(usize, usize), sqlx::Error> {
    let embedded =
        MIGRATOR.iter().filter(|migration| migration.migration_type.is_up_migration()).count();
    let applied_table = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = '_sqlx_migrations'",
    )
    .fetch_one(pool)
    .await?;
    if applied_table == 0 {
        return Ok((embedded, 0));
    }

    let applied =
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM _sqlx_migrations WHERE success = 1")
            .fetch_one(pool)
            .await?;
    Ok((embedded, usize::try_from(applied).unwrap_or_default()))
}
