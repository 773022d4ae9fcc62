//! Tally public API façade (in-process).
//!
//! `Collections` is what consuming views hold: it binds live queries and mutations
//! to a remote table through one shared `QueryCache`. Frontends (CLI, seed/apply)
//! depend only on this crate.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tally_core::MutationSpec;
use tally_remote::{RemoteTable, TimeoutTable};
use tally_store::QueryCache;
use tracing::{debug, info};

mod batch;
mod binding;
mod config;
mod mutation;

pub use batch::BatchReport;
pub use binding::{QueryBinding, QueryResult, QueryStatus};
pub use config::ClientConfig;
pub use mutation::{MutationBinding, MutationOutcome};
pub use tally_core::{DataError, DataResult, MutationKind, OrderBy, QuerySpec, Record, Selection};
pub use tally_store::Rows;

pub(crate) fn decode<T: DeserializeOwned>(record: Record) -> DataResult<T> {
    Ok(serde_json::from_value(Value::Object(record))?)
}

/// Entry point for query and mutation bindings over one remote table.
#[derive(Clone)]
pub struct Collections {
    table: Arc<dyn RemoteTable>,
    cache: Arc<QueryCache>,
    config: ClientConfig,
}

impl Collections {
    /// Fresh cache, default config.
    pub fn new(table: Arc<dyn RemoteTable>) -> Self { Self::with_config(table, ClientConfig::default()) }

    /// Fresh cache; `config.timeout` wraps the table in a `TimeoutTable`.
    pub fn with_config(table: Arc<dyn RemoteTable>, config: ClientConfig) -> Self {
        let table: Arc<dyn RemoteTable> = match config.timeout {
            Some(limit) => Arc::new(TimeoutTable::new(table, limit)),
            None => table,
        };
        info!(backend = table.backend(), timeout_ms = ?config.timeout.map(|d| d.as_millis()), batch_concurrency = ?config.batch_concurrency, "api: collections ready");
        Self { table, cache: Arc::new(QueryCache::new()), config }
    }

    /// Share `cache` with other `Collections` (e.g. two tables, one invalidation space).
    pub fn with_cache(mut self, cache: Arc<QueryCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn cache(&self) -> &Arc<QueryCache> { &self.cache }

    pub fn table(&self) -> &Arc<dyn RemoteTable> { &self.table }

    pub fn config(&self) -> &ClientConfig { &self.config }

    /// Live binding for `spec`. Starts in `Loading` and fetches immediately.
    /// Must be called inside a tokio runtime.
    pub fn query<T: DeserializeOwned + Send + Sync + 'static>(&self, spec: QuerySpec) -> QueryBinding<T> {
        QueryBinding::spawn(spec, Arc::clone(&self.table), Arc::clone(&self.cache))
    }

    /// One-shot read through the cache.
    pub async fn fetch<T: DeserializeOwned>(&self, spec: &QuerySpec) -> DataResult<Vec<T>> {
        let t0 = Instant::now();
        spec.validate()?;
        let rows = self.cache.fetch(spec, &self.table).await?;
        let out = rows.iter().cloned().map(decode::<T>).collect::<DataResult<Vec<T>>>()?;
        debug!(key = %spec.key(), rows = out.len(), took_ms = %t0.elapsed().as_millis(), "api: fetch ok");
        Ok(out)
    }

    pub fn mutation<T: DeserializeOwned>(&self, collection: impl Into<String>, kind: MutationKind) -> MutationBinding<T> {
        MutationBinding::new(
            MutationSpec::new(collection, kind),
            Arc::clone(&self.table),
            Arc::clone(&self.cache),
            self.config.batch_concurrency,
        )
    }

    pub fn insert<T: DeserializeOwned>(&self, collection: impl Into<String>) -> MutationBinding<T> {
        self.mutation(collection, MutationKind::Insert)
    }

    pub fn update<T: DeserializeOwned>(&self, collection: impl Into<String>) -> MutationBinding<T> {
        self.mutation(collection, MutationKind::Update)
    }

    pub fn delete<T: DeserializeOwned>(&self, collection: impl Into<String>) -> MutationBinding<T> {
        self.mutation(collection, MutationKind::Delete)
    }

    /// Caller-side refresh: mark every cached query of `collection` stale.
    pub fn invalidate(&self, collection: &str) -> u64 { self.cache.invalidate(collection) }
}
