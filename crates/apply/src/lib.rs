//! Tally apply: seed documents, diffs against live collections, and applying the
//! difference through mutation batches.
//!
//! A document maps collection names to record lists:
//!
//! ```yaml
//! collections:
//!   items:
//!     - { id: 1, name: A, qty: 5 }
//!     - { name: C, qty: 10 }   # no id: always inserted
//! ```

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use tally_api::{BatchReport, Collections, DataResult, QuerySpec};
use tally_core::{id_key, record_id, values_equal, Record};
use tracing::{info, warn};

fn max_yaml_bytes() -> usize {
    std::env::var("TALLY_MAX_YAML_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000) // 1 MiB default
}

fn max_yaml_nodes() -> usize {
    std::env::var("TALLY_MAX_YAML_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    // Running counter; bail out once it passes the budget
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur > max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for (_k, vv) in map.iter() {
                    if *cur > max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur > max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count > max
}

/// Desired contents per collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeedDocument {
    pub collections: BTreeMap<String, Vec<Record>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary { pub adds: usize, pub updates: usize, pub unchanged: usize, pub removes: usize }

impl DiffSummary {
    fn absorb(&mut self, o: &DiffSummary) {
        self.adds += o.adds;
        self.updates += o.updates;
        self.unchanged += o.unchanged;
        self.removes += o.removes;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOptions {
    pub dry_run: bool,
    /// Delete live records the document does not mention.
    pub prune: bool,
}

/// What it takes to bring one collection to the document's contents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectionPlan {
    pub collection: String,
    pub inserts: Vec<Record>,
    pub updates: Vec<Record>,
    pub unchanged: usize,
    /// Ids of live records absent from the document.
    pub removes: Vec<Json>,
}

impl CollectionPlan {
    pub fn summary(&self) -> DiffSummary {
        DiffSummary { adds: self.inserts.len(), updates: self.updates.len(), unchanged: self.unchanged, removes: self.removes.len() }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CollectionReport {
    pub collection: String,
    pub summary: DiffSummary,
    pub failures: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ApplyResult {
    pub dry_run: bool,
    pub summary: DiffSummary,
    pub collections: Vec<CollectionReport>,
}

impl ApplyResult {
    pub fn failures(&self) -> usize { self.collections.iter().map(|c| c.failures.len()).sum() }
}

/// Parse a YAML (or JSON) seed document, enforcing size and node budgets.
pub fn parse_document(text: &str) -> Result<SeedDocument> {
    if text.len() > max_yaml_bytes() {
        return Err(anyhow!("document too large (>{} bytes)", max_yaml_bytes()));
    }
    let val: serde_yaml::Value = serde_yaml::from_str(text).context("parsing YAML")?;
    let json = serde_json::to_value(val).context("converting YAML to JSON")?;
    if json_node_budget_exceeded(&json, max_yaml_nodes()) {
        return Err(anyhow!("document too complex (>{} nodes)", max_yaml_nodes()));
    }
    let cols = json
        .get("collections")
        .and_then(|c| c.as_object())
        .ok_or_else(|| anyhow!("document missing collections mapping"))?;
    let mut doc = SeedDocument::default();
    for (name, rows) in cols.iter() {
        if name.trim().is_empty() {
            return Err(anyhow!("empty collection name"));
        }
        let rows = rows.as_array().ok_or_else(|| anyhow!("collection {} is not a list", name))?;
        let mut records: Vec<Record> = Vec::with_capacity(rows.len());
        for (i, row) in rows.iter().enumerate() {
            let rec = row.as_object().cloned().ok_or_else(|| anyhow!("{}[{}] is not a mapping", name, i))?;
            if let Some(id) = record_id(&rec) {
                if records.iter().any(|r| record_id(r).map(|x| values_equal(x, id)).unwrap_or(false)) {
                    return Err(anyhow!("{}[{}] repeats id {}", name, i, id_key(id)));
                }
            }
            records.push(rec);
        }
        doc.collections.insert(name.clone(), records);
    }
    Ok(doc)
}

/// Field-level differences of `target` against `base` (nested objects and arrays
/// included).
pub fn diff_fields(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, adds: &mut usize, ups: &mut usize, rems: &mut usize) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao.iter() {
                    if let Some(bv) = bo.get(k) {
                        if values_equal(av, bv) { continue; }
                        walk(av, bv, adds, ups, rems);
                    } else {
                        *adds += 1;
                    }
                }
                for (k, _bv) in bo.iter() {
                    if !ao.contains_key(k) { *rems += 1; }
                }
            }
            (Json::Array(aa), Json::Array(bb)) => {
                let min_len = aa.len().min(bb.len());
                for i in 0..min_len { if !values_equal(&aa[i], &bb[i]) { *ups += 1; } }
                if aa.len() > bb.len() { *adds += aa.len() - bb.len(); }
                if bb.len() > aa.len() { *rems += bb.len() - aa.len(); }
            }
            (av, bv) => { if !values_equal(av, bv) { *ups += 1; } }
        }
    }
    let mut adds = 0usize; let mut ups = 0usize; let mut rems = 0usize;
    walk(target, base, &mut adds, &mut ups, &mut rems);
    DiffSummary { adds, updates: ups, unchanged: 0, removes: rems }
}

/// Match desired records to live ones by id. A desired record only needs an update
/// when it adds or changes a field; fields it leaves out are kept.
pub fn plan(collection: &str, desired: &[Record], live: &[Record]) -> CollectionPlan {
    let mut p = CollectionPlan { collection: collection.to_string(), ..Default::default() };
    for want in desired {
        let current = record_id(want)
            .and_then(|id| live.iter().find(|r| record_id(r).map(|x| values_equal(x, id)).unwrap_or(false)));
        match current {
            None => p.inserts.push(want.clone()),
            Some(have) => {
                let d = diff_fields(&Json::Object(want.clone()), &Json::Object(have.clone()));
                if d.adds + d.updates > 0 { p.updates.push(want.clone()) } else { p.unchanged += 1 }
            }
        }
    }
    for have in live {
        if let Some(id) = record_id(have) {
            let kept = desired.iter().any(|w| record_id(w).map(|x| values_equal(x, id)).unwrap_or(false));
            if !kept {
                p.removes.push(id.clone());
            }
        }
    }
    p
}

async fn plan_all(api: &Collections, doc: &SeedDocument) -> DataResult<Vec<CollectionPlan>> {
    let mut plans = Vec::with_capacity(doc.collections.len());
    for (name, desired) in doc.collections.iter() {
        let live: Vec<Record> = api.fetch(&QuerySpec::new(name.as_str())).await?;
        plans.push(plan(name, desired, &live));
    }
    Ok(plans)
}

/// Per-collection summaries of what `apply` would do (removes are listed whether or
/// not pruning is requested).
pub async fn diff(api: &Collections, doc: &SeedDocument) -> DataResult<Vec<(String, DiffSummary)>> {
    let t0 = Instant::now();
    let plans = plan_all(api, doc).await?;
    info!(collections = plans.len(), took_ms = %t0.elapsed().as_millis(), "apply: diff done");
    Ok(plans.into_iter().map(|p| { let s = p.summary(); (p.collection, s) }).collect())
}

fn failures<T>(op: &str, report: &BatchReport<T>, out: &mut Vec<String>) {
    for (i, e) in report.failed.iter() {
        out.push(format!("{}[{}]: {}", op, i, e));
    }
}

/// Bring every collection in `doc` to the document's contents. Item failures are
/// collected per collection; a failure to read live data aborts.
pub async fn apply(api: &Collections, doc: &SeedDocument, opts: ApplyOptions) -> DataResult<ApplyResult> {
    let t0 = Instant::now();
    let mut result = ApplyResult { dry_run: opts.dry_run, ..Default::default() };
    for p in plan_all(api, doc).await? {
        let mut summary = p.summary();
        if !opts.prune {
            summary.removes = 0;
        }
        let mut report = CollectionReport { collection: p.collection.clone(), summary, failures: Vec::new() };
        if !opts.dry_run {
            if !p.inserts.is_empty() {
                let r = api.insert::<Record>(p.collection.as_str()).batch(&p.inserts).await;
                failures("insert", &r, &mut report.failures);
            }
            if !p.updates.is_empty() {
                let r = api.update::<Record>(p.collection.as_str()).batch(&p.updates).await;
                failures("update", &r, &mut report.failures);
            }
            if opts.prune && !p.removes.is_empty() {
                let ids: Vec<Json> = p.removes.iter().map(|id| json!({ "id": id })).collect();
                let r = api.delete::<Record>(p.collection.as_str()).batch(&ids).await;
                failures("delete", &r, &mut report.failures);
            }
            if !report.failures.is_empty() {
                warn!(collection = %p.collection, failed = report.failures.len(), "apply: partial failure");
            }
        }
        result.summary.absorb(&report.summary);
        result.collections.push(report);
    }
    let failed = result.failures();
    histogram!("apply_ms", t0.elapsed().as_secs_f64() * 1000.0);
    counter!("apply_total", 1u64, "dry_run" => if opts.dry_run { "true" } else { "false" });
    info!(
        dry_run = opts.dry_run,
        prune = opts.prune,
        adds = result.summary.adds,
        updates = result.summary.updates,
        removes = result.summary.removes,
        failed,
        took_ms = %t0.elapsed().as_millis(),
        "apply: done"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(v: Json) -> Record { v.as_object().cloned().unwrap() }

    #[test]
    fn diff_fields_counts_adds_updates_removes() {
        let base = json!({"a": 1, "b": {"x": 1}, "c": [1, 2, 3]});
        let target = json!({"a": 2, "b": {"x": 1, "y": 2}, "c": [1, 9], "d": true});
        let s = diff_fields(&target, &base);
        assert_eq!((s.adds, s.updates, s.removes), (2, 2, 1));
        // numeric equality is by value
        assert_eq!(diff_fields(&json!({"q": 1.0}), &json!({"q": 1})), DiffSummary::default());
    }

    #[test]
    fn plan_matches_by_id_and_ignores_omitted_fields() {
        let live = vec![
            rec(json!({"id": 1, "name": "A", "qty": 5})),
            rec(json!({"id": 2, "name": "B", "qty": 0})),
            rec(json!({"id": 3, "name": "Old"})),
        ];
        let desired = vec![
            rec(json!({"id": 1, "qty": 5})),
            rec(json!({"id": 2, "qty": 4})),
            rec(json!({"name": "C", "qty": 10})),
            rec(json!({"id": 9, "name": "Z"})),
        ];
        let p = plan("items", &desired, &live);
        assert_eq!(p.summary(), DiffSummary { adds: 2, updates: 1, unchanged: 1, removes: 1 });
        assert_eq!(p.updates[0]["qty"], json!(4));
        assert_eq!(p.removes, vec![json!(3)]);
    }

    #[test]
    fn parse_errors_are_friendly() {
        let e = parse_document("items: []\n").unwrap_err().to_string();
        assert!(e.contains("missing collections"), "e={}", e);
        let e = parse_document("collections:\n  items: {a: 1}\n").unwrap_err().to_string();
        assert!(e.contains("not a list"), "e={}", e);
        let e = parse_document("collections:\n  items: [1]\n").unwrap_err().to_string();
        assert!(e.contains("items[0] is not a mapping"), "e={}", e);
        let e = parse_document("collections:\n  items: [{id: 1}, {id: 1}]\n").unwrap_err().to_string();
        assert!(e.contains("repeats id 1"), "e={}", e);
    }

    #[test]
    fn node_budget_stops_early() {
        let v = json!({"a": [1, 2, 3, 4, 5]});
        assert!(json_node_budget_exceeded(&v, 3));
        assert!(!json_node_budget_exceeded(&v, 100));
    }

    #[test]
    fn node_budget_is_inclusive() {
        // object + array + five numbers
        let v = json!({"a": [1, 2, 3, 4, 5]});
        assert!(!json_node_budget_exceeded(&v, 7));
        assert!(json_node_budget_exceeded(&v, 6));
    }

    #[test]
    fn json_documents_parse_too() {
        let doc = parse_document(r#"{"collections": {"vendors": [{"id": "v1", "name": "Acme"}]}}"#).unwrap();
        assert_eq!(doc.collections["vendors"][0]["name"], json!("Acme"));
    }
}
