use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tally_core::{id_key, merge_into, next_id, record_id, values_equal, DataError, DataResult, QuerySpec, Record, ID_FIELD};
use tracing::debug;

use crate::RemoteTable;

/// In-process collections, kept in insertion order.
///
/// Integer ids are assigned as `max(id) + 1` per collection. Reading an unknown
/// collection yields an empty sequence; inserting into one creates it.
#[derive(Default)]
pub struct MemoryTable {
    collections: RwLock<FxHashMap<String, Vec<Record>>>,
}

impl MemoryTable {
    pub fn new() -> Self { Self::default() }

    fn rd(&self) -> DataResult<RwLockReadGuard<'_, FxHashMap<String, Vec<Record>>>> {
        self.collections.read().map_err(|_| DataError::transport("memory table lock poisoned"))
    }

    fn wr(&self) -> DataResult<RwLockWriteGuard<'_, FxHashMap<String, Vec<Record>>>> {
        self.collections.write().map_err(|_| DataError::transport("memory table lock poisoned"))
    }

    /// Replace the contents of `collection` with `records`.
    pub fn seed<I>(&self, collection: &str, records: I) -> DataResult<()>
    where
        I: IntoIterator<Item = Record>,
    {
        let rows: Vec<Record> = records.into_iter().collect();
        debug!(collection, rows = rows.len(), "memory: seed");
        self.wr()?.insert(collection.to_string(), rows);
        Ok(())
    }

    /// Raw contents of a collection, in storage order.
    pub fn snapshot(&self, collection: &str) -> DataResult<Vec<Record>> {
        Ok(self.rd()?.get(collection).cloned().unwrap_or_default())
    }

    pub fn read_now(&self, spec: &QuerySpec) -> DataResult<Vec<Record>> {
        let guard = self.rd()?;
        Ok(match guard.get(&spec.collection) {
            Some(rows) => spec.evaluate(rows.iter()),
            None => Vec::new(),
        })
    }

    pub fn insert_now(&self, collection: &str, mut record: Record) -> DataResult<Record> {
        let mut guard = self.wr()?;
        let rows = guard.entry(collection.to_string()).or_default();
        match record_id(&record) {
            Some(id) => {
                if rows.iter().any(|r| record_id(r).map(|x| values_equal(x, id)).unwrap_or(false)) {
                    return Err(DataError::validation_code(
                        "duplicate_id",
                        format!("{} already has a record with id {}", collection, id_key(id)),
                    ));
                }
            }
            None => {
                let max = rows.iter().filter_map(|r| record_id(r).and_then(Value::as_i64)).max();
                let next = next_id(collection, max)?;
                record.insert(ID_FIELD.to_string(), Value::from(next));
            }
        }
        rows.push(record.clone());
        Ok(record)
    }

    pub fn update_now(&self, collection: &str, patch: Record) -> DataResult<Record> {
        let id = record_id(&patch)
            .cloned()
            .ok_or_else(|| DataError::validation_code("missing_id", "update payload requires id"))?;
        let mut guard = self.wr()?;
        let row = guard
            .get_mut(collection)
            .and_then(|rows| {
                rows.iter_mut().find(|r| record_id(r).map(|x| values_equal(x, &id)).unwrap_or(false))
            })
            .ok_or_else(|| DataError::not_found(collection, id_key(&id)))?;
        let stored = row.get(ID_FIELD).cloned();
        merge_into(row, &patch);
        // the id matched by value; keep its stored representation
        if let Some(stored) = stored {
            row.insert(ID_FIELD.to_string(), stored);
        }
        Ok(row.clone())
    }

    pub fn delete_now(&self, collection: &str, id: &Value) -> DataResult<()> {
        let mut guard = self.wr()?;
        let rows = guard.get_mut(collection).ok_or_else(|| DataError::not_found(collection, id_key(id)))?;
        let pos = rows
            .iter()
            .position(|r| record_id(r).map(|x| values_equal(x, id)).unwrap_or(false))
            .ok_or_else(|| DataError::not_found(collection, id_key(id)))?;
        rows.remove(pos);
        Ok(())
    }
}

#[async_trait]
impl RemoteTable for MemoryTable {
    fn backend(&self) -> &'static str { "memory" }

    async fn read(&self, spec: &QuerySpec) -> DataResult<Vec<Record>> { self.read_now(spec) }

    async fn insert(&self, collection: &str, record: Record) -> DataResult<Record> {
        self.insert_now(collection, record)
    }

    async fn update(&self, collection: &str, patch: Record) -> DataResult<Record> {
        self.update_now(collection, patch)
    }

    async fn delete(&self, collection: &str, id: &Value) -> DataResult<()> { self.delete_now(collection, id) }
}
