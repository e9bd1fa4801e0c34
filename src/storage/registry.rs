//! Backend identifier to constructor mapping

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, info};

use super::ScanStore;
use crate::config::StorageConfig;
use crate::error::StorageError;

pub type StoreFuture = BoxFuture<'static, Result<Arc<dyn ScanStore>, StorageError>>;

/// Builds a backend from the full storage configuration.
pub type Constructor = fn(StorageConfig) -> StoreFuture;

#[derive(Default)]
pub struct Registry {
    constructors: HashMap<String, Constructor>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a constructor under `backend`. A later registration for the
    /// same identifier replaces the earlier one.
    pub fn register(&mut self, backend: &str, constructor: Constructor) {
        if self
            .constructors
            .insert(backend.to_string(), constructor)
            .is_some()
        {
            debug!(backend = %backend, "Replacing registered storage backend");
        }
    }

    /// Registered backend identifiers, in no particular order.
    pub fn backends(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    /// Validate `config`, then build the backend it selects.
    ///
    /// Validation runs before the lookup, so missing fields are reported
    /// even when the backend identifier is also unknown.
    pub async fn resolve(&self, config: &StorageConfig) -> Result<Arc<dyn ScanStore>, StorageError> {
        config.validate()?;

        let backend = config.db_type();
        let constructor = self
            .constructors
            .get(backend)
            .ok_or_else(|| StorageError::UnknownBackend(backend.to_string()))?;

        info!(backend = %backend, "Initializing storage backend");
        constructor(config.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::env;
    use crate::models::ScanEntry;
    use crate::storage::BACKEND_NOOP;
    use async_trait::async_trait;
    use futures::FutureExt;

    fn config(db_type: &str) -> StorageConfig {
        StorageConfig {
            db_type: Some(db_type.to_string()),
            host: Some("localhost".to_string()),
            user: Some("user".to_string()),
            password: Some("password".to_string()),
            port: Some(5432),
            name: Some("dbname".to_string()),
            max_connections: 10,
        }
    }

    struct FailingStore;

    #[async_trait]
    impl ScanStore for FailingStore {
        async fn upsert(&self, entry: &ScanEntry) -> Result<(), StorageError> {
            Err(StorageError::UnknownBackend(entry.service.clone()))
        }

        async fn close(&self) {}

        fn name(&self) -> &str {
            "failing"
        }
    }

    fn open_failing(_: StorageConfig) -> StoreFuture {
        async { Ok(Arc::new(FailingStore) as Arc<dyn ScanStore>) }.boxed()
    }

    fn registry() -> Registry {
        let mut registry = Registry::new();
        super::super::noop::register(&mut registry);
        registry
    }

    #[tokio::test]
    async fn test_resolve_noop() {
        let store = registry().resolve(&config(BACKEND_NOOP)).await.unwrap();
        assert_eq!(store.name(), BACKEND_NOOP);
        assert!(store.upsert(&ScanEntry::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_resolve_unknown_backend() {
        let err = registry()
            .resolve(&config("unknown_db"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StorageError::UnknownBackend(ref b) if b == "unknown_db"));
        assert_eq!(err.to_string(), "unknown database type: unknown_db");
    }

    #[tokio::test]
    async fn test_resolve_invalid_config() {
        let mut cfg = config(BACKEND_NOOP);
        cfg.host = None;
        let err = registry().resolve(&cfg).await.err().unwrap();
        assert!(
            err.to_string()
                .starts_with("invalid database configuration: DATABASE_HOST is required")
        );
    }

    #[tokio::test]
    async fn test_resolve_validates_before_lookup() {
        let mut cfg = config("unknown_db");
        cfg.password = None;
        let err = registry().resolve(&cfg).await.err().unwrap();
        match err {
            StorageError::InvalidConfiguration(e) => {
                assert!(e.is_missing(env::DATABASE_PASSWORD))
            }
            other => panic!("expected invalid configuration, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_resolve_missing_backend_identifier() {
        let mut cfg = config(BACKEND_NOOP);
        cfg.db_type = None;
        let err = registry().resolve(&cfg).await.err().unwrap();
        match err {
            StorageError::InvalidConfiguration(e) => assert!(e.is_missing(env::DATABASE_TYPE)),
            other => panic!("expected invalid configuration, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let mut registry = registry();
        registry.register(BACKEND_NOOP, open_failing);
        assert_eq!(registry.backends(), vec![BACKEND_NOOP]);

        let store = registry.resolve(&config(BACKEND_NOOP)).await.unwrap();
        assert_eq!(store.name(), "failing");
        assert!(store.upsert(&ScanEntry::default()).await.is_err());
    }
}
