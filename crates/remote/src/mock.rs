//! Scriptable backend for tests: a `MemoryTable` plus queued delays, injected
//! failures and call counters.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tally_core::{DataError, DataResult, QueryKey, QuerySpec, Record};

use crate::{MemoryTable, RemoteTable};

#[derive(Default)]
pub struct MockTable {
    inner: MemoryTable,
    read_delays: Mutex<VecDeque<Duration>>,
    read_failures: Mutex<VecDeque<DataError>>,
    mutation_failures: Mutex<VecDeque<DataError>>,
    reads: AtomicUsize,
    mutations: AtomicUsize,
    read_log: Mutex<Vec<QueryKey>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(PoisonError::into_inner) }

impl MockTable {
    pub fn new() -> Self { Self::default() }

    /// Direct access to the backing collections (seeding, assertions).
    pub fn memory(&self) -> &MemoryTable { &self.inner }

    /// Delay applied to the next read that starts; further calls queue more delays.
    pub fn push_read_delay(&self, delay: Duration) { lock(&self.read_delays).push_back(delay); }

    pub fn fail_next_read(&self, err: DataError) { lock(&self.read_failures).push_back(err); }

    pub fn fail_next_mutation(&self, err: DataError) { lock(&self.mutation_failures).push_back(err); }

    /// Number of reads that reached the backend.
    pub fn reads(&self) -> usize { self.reads.load(Ordering::SeqCst) }

    pub fn mutations(&self) -> usize { self.mutations.load(Ordering::SeqCst) }

    /// Cache keys of every read received, in arrival order.
    pub fn read_keys(&self) -> Vec<QueryKey> { lock(&self.read_log).clone() }

    fn take_mutation_failure(&self) -> Option<DataError> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        lock(&self.mutation_failures).pop_front()
    }
}

#[async_trait]
impl RemoteTable for MockTable {
    fn backend(&self) -> &'static str { "mock" }

    async fn read(&self, spec: &QuerySpec) -> DataResult<Vec<Record>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        lock(&self.read_log).push(spec.key());
        let delay = lock(&self.read_delays).pop_front();
        let failure = lock(&self.read_failures).pop_front();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        if let Some(e) = failure {
            return Err(e);
        }
        self.inner.read_now(spec)
    }

    async fn insert(&self, collection: &str, record: Record) -> DataResult<Record> {
        if let Some(e) = self.take_mutation_failure() {
            return Err(e);
        }
        self.inner.insert_now(collection, record)
    }

    async fn update(&self, collection: &str, patch: Record) -> DataResult<Record> {
        if let Some(e) = self.take_mutation_failure() {
            return Err(e);
        }
        self.inner.update_now(collection, patch)
    }

    async fn delete(&self, collection: &str, id: &Value) -> DataResult<()> {
        if let Some(e) = self.take_mutation_failure() {
            return Err(e);
        }
        self.inner.delete_now(collection, id)
    }
}
