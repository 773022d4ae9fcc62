//! Tally store: the query-result cache shared by every binding.
//!
//! Results are keyed by `QueryKey` (collection + selection + filter + order + limit).
//! Every collection carries a revision counter published on a `watch` channel. A
//! successful mutation bumps it, which makes all cached results of that collection
//! stale and wakes the bindings subscribed to it. Concurrent reads of the same key at
//! the same revision share one remote call.
//!
//! An entry nobody is reading survives one invalidation of its collection so its
//! last rows stay available through `peek`; the next invalidation drops it. Call
//! `evict` or `clear` to release entries of a collection that is never invalidated.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use arc_swap::ArcSwapOption;
use futures::future::{BoxFuture, FutureExt, Shared};
use metrics::{counter, gauge, histogram};
use rustc_hash::FxHashMap;
use tally_core::{DataResult, QueryKey, QuerySpec, Record};
use tally_remote::RemoteTable;
use tokio::sync::watch;
use tracing::{debug, info};

pub type Rows = Arc<Vec<Record>>;

type ReadFuture = Shared<BoxFuture<'static, DataResult<Rows>>>;

/// A resolved read, tagged with the collection revision it was issued at.
#[derive(Debug, Clone)]
pub struct Cached {
    pub rows: Rows,
    pub revision: u64,
    pub fetched_at: Instant,
}

struct Inflight {
    revision: u64,
    fut: ReadFuture,
}

struct Entry {
    collection: String,
    resolved: ArcSwapOption<Cached>,
    inflight: Mutex<Option<Inflight>>,
}

impl Entry {
    fn new(collection: &str) -> Self {
        Self { collection: collection.to_string(), resolved: ArcSwapOption::empty(), inflight: Mutex::new(None) }
    }

    /// No read in flight and nothing resolved at `revision` or later.
    fn is_idle_before(&self, revision: u64) -> bool {
        lock(&self.inflight).is_none() && self.resolved.load_full().map(|c| c.revision < revision).unwrap_or(true)
    }
}

/// Injectable cache service. Clone the `Arc` to share it between bindings; build a
/// fresh one per test.
#[derive(Default)]
pub struct QueryCache {
    entries: Mutex<FxHashMap<QueryKey, Arc<Entry>>>,
    revisions: Mutex<FxHashMap<String, watch::Sender<u64>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(PoisonError::into_inner) }

impl QueryCache {
    pub fn new() -> Self { Self::default() }

    /// Current revision of `collection` (0 until the first invalidation).
    pub fn revision(&self, collection: &str) -> u64 {
        lock(&self.revisions).get(collection).map(|tx| *tx.borrow()).unwrap_or(0)
    }

    /// Receiver that changes whenever `collection` is invalidated.
    pub fn subscribe(&self, collection: &str) -> watch::Receiver<u64> {
        lock(&self.revisions)
            .entry(collection.to_string())
            .or_insert_with(|| watch::channel(0).0)
            .subscribe()
    }

    /// Mark every cached result of `collection` stale and notify subscribers.
    /// Returns the new revision.
    pub fn invalidate(&self, collection: &str) -> u64 {
        let mut revision = 0;
        lock(&self.revisions)
            .entry(collection.to_string())
            .or_insert_with(|| watch::channel(0).0)
            .send_modify(|r| {
                *r += 1;
                revision = *r;
            });
        let dropped = self.drop_idle(collection, revision - 1);
        counter!("cache_invalidations_total", 1u64);
        debug!(collection, revision, dropped, "cache: invalidated");
        revision
    }

    /// Drop entries of `collection` that were already stale before `revision` and
    /// are not being read.
    fn drop_idle(&self, collection: &str, revision: u64) -> usize {
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|_, e| e.collection != collection || Arc::strong_count(e) > 1 || !e.is_idle_before(revision));
        gauge!("cache_entries", entries.len() as f64);
        before - entries.len()
    }

    /// Last resolved value for `spec`, fresh or stale.
    pub fn peek(&self, spec: &QuerySpec) -> Option<Arc<Cached>> {
        lock(&self.entries).get(&spec.key()).and_then(|e| e.resolved.load_full())
    }

    /// True when a resolved value exists at the collection's current revision.
    pub fn is_fresh(&self, spec: &QuerySpec) -> bool {
        let revision = self.revision(&spec.collection);
        self.peek(spec).map(|c| c.revision == revision).unwrap_or(false)
    }

    pub fn len(&self) -> usize { lock(&self.entries).len() }

    pub fn is_empty(&self) -> bool { lock(&self.entries).is_empty() }

    /// Drop the entry for `spec`. In-flight waiters still receive their result.
    pub fn evict(&self, spec: &QuerySpec) -> bool {
        let mut entries = lock(&self.entries);
        let removed = entries.remove(&spec.key()).is_some();
        gauge!("cache_entries", entries.len() as f64);
        removed
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
        gauge!("cache_entries", 0.0);
    }

    fn entry(&self, key: &QueryKey, collection: &str) -> Arc<Entry> {
        let mut entries = lock(&self.entries);
        let entry = Arc::clone(entries.entry(key.clone()).or_insert_with(|| Arc::new(Entry::new(collection))));
        gauge!("cache_entries", entries.len() as f64);
        entry
    }

    /// Serve `spec` from cache when fresh; otherwise join the in-flight read for the
    /// current revision or start one. Failures are returned but never cached.
    pub async fn fetch(&self, spec: &QuerySpec, table: &Arc<dyn RemoteTable>) -> DataResult<Rows> {
        let key = spec.key();
        let revision = self.revision(&spec.collection);
        let entry = self.entry(&key, &spec.collection);

        if let Some(hit) = entry.resolved.load_full() {
            if hit.revision == revision {
                counter!("cache_hits_total", 1u64);
                debug!(key = %key, revision, "cache: hit");
                return Ok(Arc::clone(&hit.rows));
            }
        }

        let fut = {
            let mut slot = lock(&entry.inflight);
            match slot.as_ref() {
                Some(inflight) if inflight.revision == revision => {
                    counter!("cache_coalesced_total", 1u64);
                    debug!(key = %key, revision, "cache: joined in-flight read");
                    inflight.fut.clone()
                }
                _ => {
                    let fut = read(spec.clone(), Arc::clone(table)).boxed().shared();
                    *slot = Some(Inflight { revision, fut: fut.clone() });
                    fut
                }
            }
        };

        let res = fut.clone().await;

        if let Ok(rows) = &res {
            let fresh = Arc::new(Cached { rows: Arc::clone(rows), revision, fetched_at: Instant::now() });
            // Never replace a result fetched at a newer revision
            entry.resolved.rcu(|cur| match cur {
                Some(c) if c.revision > revision => Some(Arc::clone(c)),
                _ => Some(Arc::clone(&fresh)),
            });
        }
        {
            let mut slot = lock(&entry.inflight);
            if slot.as_ref().map(|f| f.fut.ptr_eq(&fut)).unwrap_or(false) {
                *slot = None;
            }
        }
        res
    }
}

async fn read(spec: QuerySpec, table: Arc<dyn RemoteTable>) -> DataResult<Rows> {
    let t0 = Instant::now();
    counter!("cache_fetch_total", 1u64);
    let res = table.read(&spec).await;
    histogram!("cache_fetch_ms", t0.elapsed().as_secs_f64() * 1000.0);
    match &res {
        Ok(rows) => debug!(
            backend = table.backend(),
            collection = %spec.collection,
            rows = rows.len(),
            took_ms = %t0.elapsed().as_millis(),
            "cache: fetched"
        ),
        Err(e) => info!(
            backend = table.backend(),
            collection = %spec.collection,
            error = %e,
            took_ms = %t0.elapsed().as_millis(),
            "cache: fetch failed"
        ),
    }
    res.map(Arc::new)
}
