//! Live query bindings.
//!
//! A binding owns a driver task that reacts to three inputs: a new `QuerySpec` from
//! the caller, a revision bump of the bound collection, and results of its own fetch
//! tasks. Every spec change or invalidation bumps the binding's generation and puts
//! the result back in `Loading`; a fetch result is applied only when its generation is
//! still current, so a late response for superseded parameters can never overwrite a
//! newer one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use metrics::counter;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tally_core::{DataError, DataResult, QuerySpec};
use tally_remote::RemoteTable;
use tally_store::{QueryCache, Rows};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::decode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Loading,
    Success,
    Error,
}

impl QueryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryStatus::Loading => "loading",
            QueryStatus::Success => "success",
            QueryStatus::Error => "error",
        }
    }
}

/// Observable state of a binding.
///
/// `data` keeps the last successfully fetched rows through `Loading` and `Error`.
#[derive(Debug)]
pub struct QueryResult<T> {
    pub status: QueryStatus,
    pub data: Arc<Vec<T>>,
    pub error: Option<DataError>,
    /// Generation this state belongs to.
    pub generation: u64,
}

impl<T> Clone for QueryResult<T> {
    fn clone(&self) -> Self {
        Self { status: self.status, data: Arc::clone(&self.data), error: self.error.clone(), generation: self.generation }
    }
}

impl<T> QueryResult<T> {
    fn loading() -> Self { Self { status: QueryStatus::Loading, data: Arc::new(Vec::new()), error: None, generation: 0 } }

    pub fn is_loading(&self) -> bool { self.status == QueryStatus::Loading }

    pub fn is_success(&self) -> bool { self.status == QueryStatus::Success }

    pub fn is_error(&self) -> bool { self.status == QueryStatus::Error }
}

type Fetched = (u64, DataResult<Rows>);

/// A spec together with the generation it was published under.
#[derive(Debug, Clone)]
struct Pinned {
    generation: u64,
    spec: QuerySpec,
}

/// Fetch task that is aborted when replaced or dropped.
struct FetchTask(JoinHandle<()>);

impl Drop for FetchTask {
    fn drop(&mut self) { self.0.abort(); }
}

struct Inner<T> {
    id: Uuid,
    table: Arc<dyn RemoteTable>,
    cache: Arc<QueryCache>,
    spec: watch::Sender<Pinned>,
    state: watch::Sender<QueryResult<T>>,
    generation: AtomicU64,
}

impl<T: DeserializeOwned + Send + Sync + 'static> Inner<T> {
    /// Bump the generation and re-enter `Loading`, keeping data.
    fn restart(&self) -> u64 {
        let gen = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.send_modify(|s| {
            s.status = QueryStatus::Loading;
            s.generation = gen;
        });
        gen
    }

    /// Republish the current spec under a fresh generation.
    fn bump(&self) -> u64 {
        let mut gen = 0;
        self.spec.send_modify(|p| {
            gen = self.restart();
            p.generation = gen;
        });
        gen
    }

    fn start(self: &Arc<Self>, pinned: Pinned, tx: mpsc::UnboundedSender<Fetched>) -> Option<FetchTask> {
        let Pinned { generation: gen, spec } = pinned;
        if let Err(e) = spec.validate() {
            let _ = tx.send((gen, Err(e)));
            return None;
        }
        let shared = Arc::clone(self);
        Some(FetchTask(tokio::spawn(async move {
            let res = shared.cache.fetch(&spec, &shared.table).await;
            let _ = tx.send((gen, res));
        })))
    }

    fn resolve(&self, gen: u64, res: DataResult<Rows>) {
        let decoded = res.and_then(|rows| rows.iter().cloned().map(decode::<T>).collect::<DataResult<Vec<T>>>());
        let t0 = Instant::now();
        let applied = self.state.send_if_modified(|s| {
            if gen != self.generation.load(Ordering::SeqCst) {
                return false;
            }
            match decoded {
                Ok(data) => {
                    s.status = QueryStatus::Success;
                    s.data = Arc::new(data);
                    s.error = None;
                }
                Err(e) => {
                    s.status = QueryStatus::Error;
                    s.error = Some(e);
                }
            }
            s.generation = gen;
            true
        });
        if applied {
            let s = self.state.borrow();
            debug!(binding = %self.id, generation = gen, status = s.status.as_str(), rows = s.data.len(), took_ms = %t0.elapsed().as_millis(), "binding: resolved");
        } else {
            counter!("query_stale_discarded_total", 1u64);
            debug!(binding = %self.id, generation = gen, "binding: stale result discarded");
        }
    }
}

/// Live association between a `QuerySpec` and its consumer. Dropping the binding
/// stops its driver and any fetch it owns.
pub struct QueryBinding<T> {
    shared: Arc<Inner<T>>,
    driver: JoinHandle<()>,
}

impl<T: DeserializeOwned + Send + Sync + 'static> QueryBinding<T> {
    /// Must be called inside a tokio runtime.
    pub(crate) fn spawn(spec: QuerySpec, table: Arc<dyn RemoteTable>, cache: Arc<QueryCache>) -> Self {
        let shared = Arc::new(Inner {
            id: Uuid::new_v4(),
            table,
            cache,
            spec: watch::channel(Pinned { generation: 0, spec }).0,
            state: watch::channel(QueryResult::loading()).0,
            generation: AtomicU64::new(0),
        });
        debug!(binding = %shared.id, key = %shared.spec.borrow().spec.key(), "binding: created");
        let spec_rx = shared.spec.subscribe();
        let driver = tokio::spawn(drive(Arc::clone(&shared), spec_rx));
        Self { shared, driver }
    }

    pub fn id(&self) -> Uuid { self.shared.id }

    pub fn spec(&self) -> QuerySpec { self.shared.spec.borrow().spec.clone() }

    pub fn generation(&self) -> u64 { self.shared.generation.load(Ordering::SeqCst) }

    pub fn current(&self) -> QueryResult<T> { self.shared.state.borrow().clone() }

    /// Replace the spec. An equal spec is a no-op; a different one enters `Loading`
    /// before this returns. Returns whether the spec changed.
    pub fn set_spec(&self, spec: QuerySpec) -> bool { self.update_spec(|s| *s = spec) }

    pub fn update_spec(&self, f: impl FnOnce(&mut QuerySpec)) -> bool {
        self.shared.spec.send_if_modified(|cur| {
            let mut next = cur.spec.clone();
            f(&mut next);
            if next == cur.spec {
                return false;
            }
            cur.spec = next;
            cur.generation = self.shared.restart();
            debug!(binding = %self.shared.id, generation = cur.generation, key = %cur.spec.key(), "binding: spec changed");
            true
        })
    }

    /// Receiver over every state transition.
    pub fn subscribe(&self) -> watch::Receiver<QueryResult<T>> { self.shared.state.subscribe() }

    /// Wait for the next non-`Loading` state (returns immediately if already settled).
    pub async fn settled(&self) -> QueryResult<T> { self.wait_for(|s| !s.is_loading()).await }

    /// Wait until a state of generation `gen` or later has settled.
    pub async fn settled_after(&self, gen: u64) -> QueryResult<T> {
        self.wait_for(|s| !s.is_loading() && s.generation >= gen).await
    }

    async fn wait_for(&self, f: impl FnMut(&QueryResult<T>) -> bool) -> QueryResult<T> {
        let mut rx = self.shared.state.subscribe();
        let out = match rx.wait_for(f).await {
            Ok(s) => s.clone(),
            Err(_) => self.current(),
        };
        out
    }
}

impl<T> Drop for QueryBinding<T> {
    fn drop(&mut self) { self.driver.abort(); }
}

async fn drive<T: DeserializeOwned + Send + Sync + 'static>(shared: Arc<Inner<T>>, mut spec_rx: watch::Receiver<Pinned>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Fetched>();
    let pinned = spec_rx.borrow_and_update().clone();
    let mut collection = pinned.spec.collection.clone();
    let mut revisions = shared.cache.subscribe(&collection);
    revisions.borrow_and_update();
    let mut task = shared.start(pinned, tx.clone());

    loop {
        tokio::select! {
            changed = spec_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let pinned = spec_rx.borrow_and_update().clone();
                if pinned.spec.collection != collection {
                    collection = pinned.spec.collection.clone();
                    revisions = shared.cache.subscribe(&collection);
                    revisions.borrow_and_update();
                }
                // replacing the handle aborts the superseded fetch
                task = shared.start(pinned, tx.clone());
            }
            changed = revisions.changed() => {
                if changed.is_err() {
                    break;
                }
                let revision = *revisions.borrow_and_update();
                // the spec branch picks up the republished spec and refetches
                let gen = shared.bump();
                debug!(binding = %shared.id, collection = %collection, revision, generation = gen, "binding: invalidated");
            }
            Some((gen, res)) = rx.recv() => {
                shared.resolve(gen, res);
            }
        }
    }
    drop(task);
    debug!(binding = %shared.id, "binding: driver stopped");
}
