use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::warn;

use super::registry::{Registry, StoreFuture};
use super::ScanStore;
use crate::config::StorageConfig;
use crate::error::StorageError;
use crate::models::ScanEntry;

pub const BACKEND_NOOP: &str = "noop";

pub(super) fn register(registry: &mut Registry) {
    registry.register(BACKEND_NOOP, open);
}

fn open(_config: StorageConfig) -> StoreFuture {
    async { Ok(Arc::new(NoopStore::new()) as Arc<dyn ScanStore>) }.boxed()
}

/// Store that accepts and discards every entry.
#[derive(Debug)]
pub struct NoopStore {
    _private: (),
}

impl NoopStore {
    pub fn new() -> Self {
        warn!(
            backend = BACKEND_NOOP,
            "Using noop storage backend, no data will be stored"
        );
        Self { _private: () }
    }
}

impl Default for NoopStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScanStore for NoopStore {
    async fn upsert(&self, _entry: &ScanEntry) -> Result<(), StorageError> {
        Ok(())
    }

    async fn close(&self) {}

    fn name(&self) -> &str {
        BACKEND_NOOP
    }
}
