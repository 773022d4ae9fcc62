use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use metrics::{counter, histogram};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tally_core::{into_record, record_id, DataError, DataResult, MutationKind, MutationSpec, Record};
use tally_remote::RemoteTable;
use tally_store::QueryCache;
use tracing::{debug, info};

use crate::batch::BatchReport;
use crate::decode;

/// Result of one successful mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome<T> {
    /// Server-confirmed record (insert, update).
    Record(T),
    Deleted { id: Value },
}

impl<T> MutationOutcome<T> {
    pub fn record(&self) -> Option<&T> {
        match self {
            MutationOutcome::Record(r) => Some(r),
            MutationOutcome::Deleted { .. } => None,
        }
    }

    pub fn into_record(self) -> Option<T> {
        match self {
            MutationOutcome::Record(r) => Some(r),
            MutationOutcome::Deleted { .. } => None,
        }
    }
}

/// A mutation bound to one collection and one operation.
///
/// Each invocation is exactly one remote call. Once the remote call succeeds every
/// cached query of the collection is invalidated, even if the returned record then
/// fails to decode into `T`; a rejected call touches nothing.
pub struct MutationBinding<T> {
    spec: MutationSpec,
    table: Arc<dyn RemoteTable>,
    cache: Arc<QueryCache>,
    concurrency: Option<usize>,
    _shape: std::marker::PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> MutationBinding<T> {
    pub(crate) fn new(spec: MutationSpec, table: Arc<dyn RemoteTable>, cache: Arc<QueryCache>, concurrency: Option<usize>) -> Self {
        Self { spec, table, cache, concurrency, _shape: std::marker::PhantomData }
    }

    pub fn spec(&self) -> &MutationSpec { &self.spec }

    /// Run the mutation with `payload`: a full record for insert, a partial record with
    /// `id` for update, a mapping carrying `id` for delete.
    pub async fn mutate<P: Serialize + ?Sized>(&self, payload: &P) -> DataResult<MutationOutcome<T>> {
        let (applied, res) = self.send(payload).await;
        if applied {
            self.cache.invalidate(&self.spec.collection);
        }
        res
    }

    /// Issue one mutation per payload concurrently (bounded by the configured batch
    /// concurrency) and collect every outcome. The collection is invalidated once if
    /// the remote accepted any item.
    pub async fn batch<P: Serialize + Sync>(&self, payloads: &[P]) -> BatchReport<T> {
        let t0 = Instant::now();
        let limit = self.concurrency.unwrap_or(payloads.len()).max(1);
        histogram!("mutation_batch_size", payloads.len() as f64, "kind" => self.spec.kind.as_str());
        let mut results: Vec<(usize, bool, DataResult<MutationOutcome<T>>)> = stream::iter(payloads.iter().enumerate())
            .map(|(i, p)| async move {
                let (applied, res) = self.send(p).await;
                (i, applied, res)
            })
            .buffer_unordered(limit)
            .collect()
            .await;
        results.sort_by_key(|(i, _, _)| *i);

        let applied = results.iter().any(|(_, applied, _)| *applied);
        let report = BatchReport::from_results(results.into_iter().map(|(i, _, res)| (i, res)).collect());
        if applied {
            self.cache.invalidate(&self.spec.collection);
        }
        info!(
            collection = %self.spec.collection,
            kind = %self.spec.kind,
            ok = report.succeeded.len(),
            failed = report.failed.len(),
            took_ms = %t0.elapsed().as_millis(),
            "mutation: batch done"
        );
        report
    }

    /// Returns whether the remote applied the mutation, and the decoded outcome.
    async fn send<P: Serialize + ?Sized>(&self, payload: &P) -> (bool, DataResult<MutationOutcome<T>>) {
        let t0 = Instant::now();
        let kind = self.spec.kind.as_str();
        let raw = self.dispatch(payload).await;
        let applied = raw.is_ok();
        let res = raw.and_then(|outcome| match outcome {
            MutationOutcome::Record(record) => decode(record).map(MutationOutcome::Record),
            MutationOutcome::Deleted { id } => Ok(MutationOutcome::Deleted { id }),
        });
        histogram!("mutation_ms", t0.elapsed().as_secs_f64() * 1000.0, "kind" => kind);
        match &res {
            Ok(_) => {
                counter!("mutations_total", 1u64, "kind" => kind, "outcome" => "ok");
                debug!(collection = %self.spec.collection, kind, took_ms = %t0.elapsed().as_millis(), "mutation: ok");
            }
            Err(e) => {
                counter!("mutations_total", 1u64, "kind" => kind, "outcome" => e.kind());
                info!(collection = %self.spec.collection, kind, applied, error = %e, took_ms = %t0.elapsed().as_millis(), "mutation: failed");
            }
        }
        (applied, res)
    }

    /// One remote call; the returned record is left undecoded.
    async fn dispatch<P: Serialize + ?Sized>(&self, payload: &P) -> DataResult<MutationOutcome<Record>> {
        let record = into_record(serde_json::to_value(payload)?)?;
        let collection = self.spec.collection.as_str();
        match self.spec.kind {
            MutationKind::Insert => Ok(MutationOutcome::Record(self.table.insert(collection, record).await?)),
            MutationKind::Update => {
                if record_id(&record).is_none() {
                    return Err(DataError::validation_code("missing_id", "update payload requires id"));
                }
                Ok(MutationOutcome::Record(self.table.update(collection, record).await?))
            }
            MutationKind::Delete => {
                let id = record_id(&record)
                    .cloned()
                    .ok_or_else(|| DataError::validation_code("missing_id", "delete payload requires id"))?;
                self.table.delete(collection, &id).await?;
                Ok(MutationOutcome::Deleted { id })
            }
        }
    }
}
