//! PostgreSQL schema bootstrap

use sqlx::PgPool;
use tracing::{debug, info};

use crate::error::StorageError;

pub const TABLE_NAME: &str = "scan_data";

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS scan_data (
    ip TEXT NOT NULL,
    port INTEGER NOT NULL,
    service TEXT NOT NULL,
    scan_date BIGINT NOT NULL,
    response TEXT NOT NULL,
    PRIMARY KEY (ip, port, service)
)
"#;

/// Create the `scan_data` table if it does not exist yet.
pub async fn init_schema(pool: &PgPool) -> Result<(), StorageError> {
    debug!(table = TABLE_NAME, "Initializing database schema");

    let table_exists: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_name = $1)",
    )
    .bind(TABLE_NAME)
    .fetch_one(pool)
    .await?;

    if table_exists {
        debug!(table = TABLE_NAME, "Table already exists");
        return Ok(());
    }

    info!(table = TABLE_NAME, "Creating new database schema");
    sqlx::query(SCHEMA_SQL).execute(pool).await?;
    Ok(())
}
