use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tally_core::{DataError, DataResult, QuerySpec, Record};
use tracing::warn;

use crate::RemoteTable;

/// Bounds every remote call; an elapsed call surfaces as `DataError::Transport`.
///
/// A timed-out mutation may still have been applied by the backend.
pub struct TimeoutTable<T> {
    inner: T,
    limit: Duration,
}

impl<T: RemoteTable> TimeoutTable<T> {
    pub fn new(inner: T, limit: Duration) -> Self { Self { inner, limit } }

    fn elapsed(&self, op: &str, collection: &str) -> DataError {
        warn!(op, collection, limit_ms = %self.limit.as_millis(), "remote: call timed out");
        DataError::transport(format!("{} on {} timed out after {}ms", op, collection, self.limit.as_millis()))
    }
}

#[async_trait]
impl<T: RemoteTable> RemoteTable for TimeoutTable<T> {
    fn backend(&self) -> &'static str { self.inner.backend() }

    async fn read(&self, spec: &QuerySpec) -> DataResult<Vec<Record>> {
        tokio::time::timeout(self.limit, self.inner.read(spec))
            .await
            .map_err(|_| self.elapsed("read", &spec.collection))?
    }

    async fn insert(&self, collection: &str, record: Record) -> DataResult<Record> {
        tokio::time::timeout(self.limit, self.inner.insert(collection, record))
            .await
            .map_err(|_| self.elapsed("insert", collection))?
    }

    async fn update(&self, collection: &str, patch: Record) -> DataResult<Record> {
        tokio::time::timeout(self.limit, self.inner.update(collection, patch))
            .await
            .map_err(|_| self.elapsed("update", collection))?
    }

    async fn delete(&self, collection: &str, id: &Value) -> DataResult<()> {
        tokio::time::timeout(self.limit, self.inner.delete(collection, id))
            .await
            .map_err(|_| self.elapsed("delete", collection))?
    }
}
