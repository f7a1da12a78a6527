//! Schema migrations.
//!
//! The SQL files under `warden_core/migrations/` are embedded at compile time.

use sqlx::PgPool;
use tracing::info;

/// Apply every pending embedded migration.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    let migrator = sqlx::migrate!("./migrations");
    info!(count = migrator.iter().count(), "applying schema migrations");
    migrator.run(pool).await
}
