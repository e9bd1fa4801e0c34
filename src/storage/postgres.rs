//! PostgreSQL backend

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use tracing::{debug, error, info, warn};

use super::registry::{Registry, StoreFuture};
use super::schema::init_schema;
use super::ScanStore;
use crate::config::StorageConfig;
use crate::error::StorageError;
use crate::models::ScanEntry;

pub const BACKEND_POSTGRES: &str = "postgres";

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

// Existing rows are only overwritten by a strictly newer scan_date
const UPSERT_SQL: &str = r#"
INSERT INTO scan_data (ip, port, service, scan_date, response)
VALUES ($1, $2, $3, $4, $5)
ON CONFLICT (ip, port, service) DO UPDATE SET
    scan_date = EXCLUDED.scan_date,
    response = EXCLUDED.response
WHERE scan_data.scan_date < EXCLUDED.scan_date
"#;

const SELECT_SQL: &str = r#"
SELECT ip, port, service, scan_date, response
FROM scan_data
WHERE ip = $1 AND port = $2 AND service = $3
"#;

pub(super) fn register(registry: &mut Registry) {
    registry.register(BACKEND_POSTGRES, open);
}

fn open(config: StorageConfig) -> StoreFuture {
    async move {
        let store = PostgresStore::connect(&config).await?;
        Ok(Arc::new(store) as Arc<dyn ScanStore>)
    }
    .boxed()
}

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect using the storage configuration and bootstrap the schema.
    pub async fn connect(config: &StorageConfig) -> Result<Self, StorageError> {
        info!(
            url = %config.redacted_url(),
            max_connections = config.max_connections,
            "Connecting to PostgreSQL"
        );

        let options = PgConnectOptions::new()
            .host(config.host())
            .port(config.port())
            .username(config.user())
            .password(config.password())
            .database(config.name());

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_with(options)
            .await
            .map_err(|source| {
                error!(
                    url = %config.redacted_url(),
                    error = %source,
                    "Failed to connect to PostgreSQL"
                );
                StorageError::Connection {
                    backend: BACKEND_POSTGRES,
                    source,
                }
            })?;

        let store = Self::from_pool(pool).await?;
        info!(url = %config.redacted_url(), "PostgreSQL storage initialized");
        Ok(store)
    }

    /// Wrap an existing pool, creating the schema when needed.
    pub async fn from_pool(pool: PgPool) -> Result<Self, StorageError> {
        init_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// Fetch the stored entry for a key.
    pub async fn find(
        &self,
        ip: &str,
        port: u16,
        service: &str,
    ) -> Result<Option<ScanEntry>, StorageError> {
        let row: Option<ScanRow> = sqlx::query_as(SELECT_SQL)
            .bind(ip)
            .bind(i32::from(port))
            .bind(service)
            .fetch_optional(&self.pool)
            .await?;

        row.map(entry_from_row).transpose()
    }
}

type ScanRow = (String, i32, String, i64, String);

fn entry_from_row(row: ScanRow) -> Result<ScanEntry, StorageError> {
    let (ip, port, service, scan_timestamp, response) = row;
    let port = u16::try_from(port).map_err(|e| {
        StorageError::Database(sqlx::Error::ColumnDecode {
            index: "port".to_string(),
            source: Box::new(e),
        })
    })?;
    Ok(ScanEntry {
        ip,
        port,
        service,
        scan_timestamp,
        response,
    })
}

#[async_trait]
impl ScanStore for PostgresStore {
    async fn upsert(&self, entry: &ScanEntry) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            error!(error = %e, entry = ?entry, "Failed to begin transaction");
            e
        })?;

        let result = sqlx::query(UPSERT_SQL)
            .bind(&entry.ip)
            .bind(i32::from(entry.port))
            .bind(&entry.service)
            .bind(entry.scan_timestamp)
            .bind(&entry.response)
            .execute(&mut *tx)
            .await;

        match result {
            Ok(done) => {
                tx.commit().await.map_err(|e| {
                    error!(error = %e, entry = ?entry, "Failed to commit scan entry");
                    e
                })?;
                debug!(
                    ip = %entry.ip,
                    port = entry.port,
                    service = %entry.service,
                    timestamp = entry.scan_timestamp,
                    written = done.rows_affected() > 0,
                    "Scan entry upserted"
                );
                Ok(())
            }
            Err(e) => {
                error!(error = %e, entry = ?entry, "Failed to upsert scan entry");
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "Failed to roll back transaction");
                }
                Err(e.into())
            }
        }
    }

    async fn close(&self) {
        if !self.pool.is_closed() {
            info!("Closing PostgreSQL connection pool");
        }
        self.pool.close().await;
    }

    fn name(&self) -> &str {
        BACKEND_POSTGRES
    }
}
