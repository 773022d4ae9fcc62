//! Tally remote: the remote-table capability that every binding reads and writes
//! through, plus in-process, test and HTTP backends.
//!
//! The capability is deliberately small: one read shaped by a `QuerySpec` and three
//! single-record mutations. Backends translate it to whatever they speak.

#![forbid(unsafe_code)]

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tally_core::{DataResult, QuerySpec, Record};

mod memory;
pub mod mock;
#[cfg(feature = "rest")]
mod rest;
mod timeout;

pub use memory::MemoryTable;
pub use mock::MockTable;
#[cfg(feature = "rest")]
pub use rest::{eq_param, read_params, RestTable};
pub use timeout::TimeoutTable;

/// Remote collection service as seen by the access layer.
#[async_trait]
pub trait RemoteTable: Send + Sync {
    /// Backend label for logs.
    fn backend(&self) -> &'static str { "remote" }

    /// Filtered, ordered, limited, projected read of one collection.
    async fn read(&self, spec: &QuerySpec) -> DataResult<Vec<Record>>;

    /// Insert a new record; the backend assigns `id` when absent.
    async fn insert(&self, collection: &str, record: Record) -> DataResult<Record>;

    /// Merge `patch` (which must carry `id`) into the stored record and return it.
    async fn update(&self, collection: &str, patch: Record) -> DataResult<Record>;

    async fn delete(&self, collection: &str, id: &Value) -> DataResult<()>;
}

#[async_trait]
impl<T: RemoteTable + ?Sized> RemoteTable for Arc<T> {
    fn backend(&self) -> &'static str { (**self).backend() }

    async fn read(&self, spec: &QuerySpec) -> DataResult<Vec<Record>> { (**self).read(spec).await }

    async fn insert(&self, collection: &str, record: Record) -> DataResult<Record> {
        (**self).insert(collection, record).await
    }

    async fn update(&self, collection: &str, patch: Record) -> DataResult<Record> {
        (**self).update(collection, patch).await
    }

    async fn delete(&self, collection: &str, id: &Value) -> DataResult<()> {
        (**self).delete(collection, id).await
    }
}
