//! Tally persistence: SQLite-backed remote table.
//! Records are stored as JSON bodies keyed by `(collection, id)`; reads load the
//! collection in insertion order and evaluate the `QuerySpec` in process.

#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use metrics::{counter, histogram};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tally_core::{id_key, merge_into, next_id, record_id, DataError, DataResult, QuerySpec, Record, ID_FIELD};
use tally_remote::RemoteTable;
use tracing::{debug, info};

/// Prior versions kept per record.
const HISTORY_KEEP: i64 = 3;

/// A prior version of a record, captured on update or delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    pub ts: i64,
    pub record: Record,
}

/// SQLite-backed table. Synchronous under a mutex; every call is a short local query.
pub struct SqliteTable {
    db: Mutex<Connection>,
    path: String,
}

fn storage(err: rusqlite::Error) -> DataError { DataError::transport(format!("sqlite: {}", err)) }

fn parse_body(body: &str) -> DataResult<Record> { Ok(serde_json::from_str::<Record>(body)?) }

fn int_id(id: &Value) -> Option<i64> { id.as_i64() }

/// Stored form of an id. JSON-encoded so `"1"` and `1` stay distinct; integral
/// numbers collapse to one form so `1` and `1.0` address the same row.
fn storage_key(id: &Value) -> String {
    if let Value::Number(n) = id {
        if let Some(i) = n.as_i64() {
            return i.to_string();
        }
        if let Some(f) = n.as_f64() {
            if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
                return (f as i64).to_string();
            }
        }
    }
    serde_json::to_string(id).unwrap_or_else(|_| id_key(id))
}

impl SqliteTable {
    /// Open `TALLY_DB_PATH`, defaulting to `~/.tally/tally.db`.
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("TALLY_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let db = Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        Self::init(db, path)
    }

    pub fn open_in_memory() -> Result<Self> {
        let db = Connection::open_in_memory().context("opening in-memory sqlite db")?;
        Self::init(db, ":memory:")
    }

    fn init(db: Connection, path: &str) -> Result<Self> {
        let started = Instant::now();
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS records (
                seq        INTEGER PRIMARY KEY AUTOINCREMENT,
                collection TEXT NOT NULL,
                id         TEXT NOT NULL,
                int_id     INTEGER,
                body       TEXT NOT NULL,
                updated_ts INTEGER NOT NULL,
                UNIQUE(collection, id)
            );
            CREATE TABLE IF NOT EXISTS record_history (
                collection TEXT NOT NULL,
                id         TEXT NOT NULL,
                ts         INTEGER NOT NULL,
                body       TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_history_key_ts ON record_history(collection, id, ts DESC);",
        )
        .context("creating tally tables")?;
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        info!(path, "persist: sqlite ready");
        Ok(Self { db: Mutex::new(db), path: path.to_string() })
    }

    pub fn path(&self) -> &str { &self.path }

    fn conn(&self) -> DataResult<MutexGuard<'_, Connection>> {
        self.db.lock().map_err(|_| DataError::transport("sqlite connection lock poisoned"))
    }

    pub fn read_now(&self, spec: &QuerySpec) -> DataResult<Vec<Record>> {
        let started = Instant::now();
        let db = self.conn()?;
        let mut stmt = db
            .prepare_cached("SELECT body FROM records WHERE collection = ?1 ORDER BY seq")
            .map_err(storage)?;
        let mut rows = stmt.query([&spec.collection]).map_err(storage)?;
        let mut all: Vec<Record> = Vec::new();
        while let Some(row) = rows.next().map_err(storage)? {
            let body: String = row.get(0).map_err(storage)?;
            all.push(parse_body(&body)?);
        }
        let out = spec.evaluate(all.iter());
        histogram!("persist_read_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(collection = %spec.collection, scanned = all.len(), rows = out.len(), "persist: read");
        Ok(out)
    }

    pub fn insert_now(&self, collection: &str, mut record: Record) -> DataResult<Record> {
        let started = Instant::now();
        let mut db = self.conn()?;
        let tx = db.transaction().map_err(storage)?;
        match record_id(&record) {
            Some(id) => {
                if load(&tx, collection, id)?.is_some() {
                    return Err(DataError::validation_code(
                        "duplicate_id",
                        format!("{} already has a record with id {}", collection, id_key(id)),
                    ));
                }
            }
            None => {
                let max: Option<i64> = tx
                    .query_row("SELECT MAX(int_id) FROM records WHERE collection = ?1", [collection], |r| r.get(0))
                    .map_err(storage)?;
                record.insert(ID_FIELD.to_string(), Value::from(next_id(collection, max)?));
            }
        }
        let id = record_id(&record).cloned().unwrap_or(Value::Null);
        let body = serde_json::to_string(&record)?;
        tx.execute(
            "INSERT INTO records(collection, id, int_id, body, updated_ts) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![collection, storage_key(&id), int_id(&id), body, now_ts()],
        )
        .map_err(storage)?;
        tx.commit().map_err(storage)?;
        histogram!("persist_write_ms", started.elapsed().as_secs_f64() * 1000.0, "op" => "insert");
        counter!("persist_write_total", 1u64, "op" => "insert");
        Ok(record)
    }

    pub fn update_now(&self, collection: &str, patch: Record) -> DataResult<Record> {
        let started = Instant::now();
        let id = record_id(&patch)
            .cloned()
            .ok_or_else(|| DataError::validation_code("missing_id", "update payload requires id"))?;
        let mut db = self.conn()?;
        let tx = db.transaction().map_err(storage)?;
        let before = load(&tx, collection, &id)?.ok_or_else(|| DataError::not_found(collection, id_key(&id)))?;
        let mut merged = parse_body(&before)?;
        let stored = merged.get(ID_FIELD).cloned();
        merge_into(&mut merged, &patch);
        // the id matched by value; keep its stored representation
        if let Some(stored) = stored {
            merged.insert(ID_FIELD.to_string(), stored);
        }
        let ts = now_ts();
        tx.execute(
            "UPDATE records SET body = ?3, updated_ts = ?4 WHERE collection = ?1 AND id = ?2",
            params![collection, storage_key(&id), serde_json::to_string(&merged)?, ts],
        )
        .map_err(storage)?;
        push_history(&tx, collection, &id, ts, &before)?;
        tx.commit().map_err(storage)?;
        histogram!("persist_write_ms", started.elapsed().as_secs_f64() * 1000.0, "op" => "update");
        counter!("persist_write_total", 1u64, "op" => "update");
        Ok(merged)
    }

    pub fn delete_now(&self, collection: &str, id: &Value) -> DataResult<()> {
        let started = Instant::now();
        let mut db = self.conn()?;
        let tx = db.transaction().map_err(storage)?;
        let before = load(&tx, collection, id)?.ok_or_else(|| DataError::not_found(collection, id_key(id)))?;
        tx.execute("DELETE FROM records WHERE collection = ?1 AND id = ?2", params![collection, storage_key(id)])
            .map_err(storage)?;
        push_history(&tx, collection, id, now_ts(), &before)?;
        tx.commit().map_err(storage)?;
        histogram!("persist_write_ms", started.elapsed().as_secs_f64() * 1000.0, "op" => "delete");
        counter!("persist_write_total", 1u64, "op" => "delete");
        Ok(())
    }

    /// Prior versions of a record, newest first (at most 3 are kept).
    pub fn history(&self, collection: &str, id: &Value, limit: Option<usize>) -> DataResult<Vec<Revision>> {
        let cap = limit.unwrap_or(HISTORY_KEEP as usize) as i64;
        let db = self.conn()?;
        let mut stmt = db
            .prepare(
                "SELECT ts, body FROM record_history WHERE collection = ?1 AND id = ?2
                 ORDER BY ts DESC, rowid DESC LIMIT ?3",
            )
            .map_err(storage)?;
        let mut rows = stmt.query(params![collection, storage_key(id), cap]).map_err(storage)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(storage)? {
            let ts: i64 = row.get(0).map_err(storage)?;
            let body: String = row.get(1).map_err(storage)?;
            out.push(Revision { ts, record: parse_body(&body)? });
        }
        Ok(out)
    }

    /// Collection names with their record counts.
    pub fn collections(&self) -> DataResult<Vec<(String, usize)>> {
        let db = self.conn()?;
        let mut stmt = db
            .prepare("SELECT collection, COUNT(*) FROM records GROUP BY collection ORDER BY collection")
            .map_err(storage)?;
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)? as usize)))
            .map_err(storage)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(storage)
    }
}

fn load(tx: &Transaction<'_>, collection: &str, id: &Value) -> DataResult<Option<String>> {
    tx.query_row(
        "SELECT body FROM records WHERE collection = ?1 AND id = ?2",
        params![collection, storage_key(id)],
        |r| r.get(0),
    )
    .optional()
    .map_err(storage)
}

fn push_history(tx: &Transaction<'_>, collection: &str, id: &Value, ts: i64, body: &str) -> DataResult<()> {
    let key = storage_key(id);
    tx.execute(
        "INSERT INTO record_history(collection, id, ts, body) VALUES (?1, ?2, ?3, ?4)",
        params![collection, key, ts, body],
    )
    .map_err(storage)?;
    // Keep the latest few by ts per record (delete older rows by rowid)
    tx.execute(
        "DELETE FROM record_history
         WHERE collection = ?1 AND id = ?2
           AND rowid NOT IN (
               SELECT rowid FROM record_history WHERE collection = ?1 AND id = ?2
               ORDER BY ts DESC, rowid DESC LIMIT ?3
           )",
        params![collection, key, HISTORY_KEEP],
    )
    .map_err(storage)?;
    Ok(())
}

#[async_trait]
impl RemoteTable for SqliteTable {
    fn backend(&self) -> &'static str { "sqlite" }

    async fn read(&self, spec: &QuerySpec) -> DataResult<Vec<Record>> { self.read_now(spec) }

    async fn insert(&self, collection: &str, record: Record) -> DataResult<Record> {
        self.insert_now(collection, record)
    }

    async fn update(&self, collection: &str, patch: Record) -> DataResult<Record> {
        self.update_now(collection, patch)
    }

    async fn delete(&self, collection: &str, id: &Value) -> DataResult<()> { self.delete_now(collection, id) }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".tally");
        let _ = std::fs::create_dir_all(&p);
        p.push("tally.db");
        return p.to_string_lossy().to_string();
    }
    // Fallback to current directory
    "tally.db".to_string()
}

/// Milliseconds since epoch.
pub fn now_ts() -> i64 { chrono::Utc::now().timestamp_millis() }
