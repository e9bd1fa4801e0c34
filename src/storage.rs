//! Storage layer for scan entries
//!
//! Backends implement [`ScanStore`] and are selected at startup through a
//! [`Registry`] keyed by the `DATABASE_TYPE` identifier.
//!
//! # Module Structure
//! - `registry`: Backend identifier to constructor mapping
//! - `noop`: Sink that discards every write
//! - `postgres`: PostgreSQL backend with most-recent-scan-wins upserts
//! - `schema`: PostgreSQL schema bootstrap

mod noop;
mod postgres;
mod registry;
mod schema;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::models::ScanEntry;

pub use noop::{BACKEND_NOOP, NoopStore};
pub use postgres::{BACKEND_POSTGRES, PostgresStore};
pub use registry::{Constructor, Registry, StoreFuture};

/// Persistence capability shared by every backend.
///
/// Implementations must tolerate concurrent `upsert` calls.
#[async_trait]
pub trait ScanStore: Send + Sync {
    /// Insert the entry, or overwrite the stored row for the same
    /// `(ip, port, service)` only when the entry's timestamp is strictly newer.
    async fn upsert(&self, entry: &ScanEntry) -> Result<(), StorageError>;

    /// Release backend resources. Safe to call more than once.
    async fn close(&self);

    /// Backend identifier
    fn name(&self) -> &str;
}

/// Build a registry holding every compiled-in backend.
pub fn registry() -> Registry {
    let mut registry = Registry::new();
    noop::register(&mut registry);
    postgres::register(&mut registry);
    registry
}
