//! Tally search: client-side filtering over rows a query already returned.
//!
//! Two flavors: `contains_filter` (plain case-insensitive substring across named
//! fields, what most list views do) and `Index` (fuzzy-ranked, with `field:name=value`
//! filter tokens). Pagination lives in `page`.

#![forbid(unsafe_code)]

use std::time::Instant;

use fuzzy_matcher::skim::SkimMatcherV2;
use fuzzy_matcher::FuzzyMatcher;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tally_core::Record;
use tracing::debug;

mod page;

pub use page::{paginate, Page};

pub type DocId = u32;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hit { pub doc: DocId, pub score: f32 }

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct SearchDebugInfo {
    pub total: usize,
    pub after_fields: usize,
    pub matched: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SearchOpts {
    pub max_candidates: Option<usize>,
    pub min_score: Option<f32>,
}

/// Text form of a scalar field; arrays, objects and null have none.
pub fn field_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// Records where any of `fields` contains `query`, case-insensitively. An empty (or
/// all-whitespace) query keeps everything. Input order is preserved.
pub fn contains_filter<'a>(records: &'a [Record], query: &str, fields: &[&str]) -> Vec<&'a Record> {
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return records.iter().collect();
    }
    records
        .iter()
        .filter(|r| {
            fields
                .iter()
                .filter_map(|f| r.get(*f).and_then(field_text))
                .any(|text| text.to_lowercase().contains(&needle))
        })
        .collect()
}

/// Fuzzy index over a fixed set of records. `Hit::doc` is the record's position in
/// the slice the index was built from.
pub struct Index {
    // Searchable text per doc (named fields joined by a space)
    texts: Vec<String>,
    field_ids: FxHashMap<String, u32>,
    // Scalar fields per doc, for `field:` filters
    projected: Vec<Vec<(u32, String)>>,
}

impl Index {
    /// Index `records`, searching free text over `fields` (every scalar field when
    /// empty).
    pub fn build(records: &[Record], fields: &[&str]) -> Self {
        let started = Instant::now();
        let mut field_ids: FxHashMap<String, u32> = FxHashMap::default();
        let mut texts = Vec::with_capacity(records.len());
        let mut projected = Vec::with_capacity(records.len());
        for r in records {
            let mut text_parts: Vec<String> = Vec::new();
            let mut proj: Vec<(u32, String)> = Vec::new();
            for (k, v) in r.iter() {
                let Some(t) = field_text(v) else { continue };
                let next = field_ids.len() as u32;
                let id = *field_ids.entry(k.clone()).or_insert(next);
                if fields.is_empty() || fields.contains(&k.as_str()) {
                    text_parts.push(t.clone());
                }
                proj.push((id, t));
            }
            texts.push(text_parts.join(" "));
            projected.push(proj);
        }
        metrics::histogram!("search_index_build_ms", started.elapsed().as_secs_f64() * 1_000.0);
        debug!(docs = texts.len(), fields = field_ids.len(), "search: index built");
        Self { texts, field_ids, projected }
    }

    pub fn len(&self) -> usize { self.texts.len() }

    pub fn is_empty(&self) -> bool { self.texts.is_empty() }

    pub fn search(&self, q: &str, limit: usize) -> Vec<Hit> {
        self.search_with_debug_opts(q, limit, SearchOpts::default()).0
    }

    pub fn search_with_debug(&self, q: &str, limit: usize) -> (Vec<Hit>, SearchDebugInfo) {
        self.search_with_debug_opts(q, limit, SearchOpts::default())
    }

    /// Tokens `field:name=value` filter on a scalar field (value compared
    /// case-insensitively); the rest is fuzzy-matched. Ranking is score descending,
    /// then input order. An unknown field name matches nothing.
    pub fn search_with_debug_opts(&self, q: &str, limit: usize, opts: SearchOpts) -> (Vec<Hit>, SearchDebugInfo) {
        let started = Instant::now();
        let matcher = SkimMatcherV2::default();
        let mut field_filters: Vec<(Option<u32>, &str)> = Vec::new();
        let mut free_terms: Vec<&str> = Vec::new();
        for tok in q.split_whitespace() {
            if let Some(rest) = tok.strip_prefix("field:") {
                if let Some((name, val)) = rest.split_once('=') {
                    field_filters.push((self.field_ids.get(name).copied(), val));
                    continue;
                }
            }
            free_terms.push(tok);
        }
        let free_q = free_terms.join(" ");

        let total = self.texts.len();
        let mut candidates: Vec<usize> = (0..total)
            .filter(|&i| {
                field_filters.iter().all(|(id, want)| match id {
                    Some(id) => self.projected[i].iter().any(|(fid, v)| fid == id && v.eq_ignore_ascii_case(want)),
                    None => false,
                })
            })
            .collect();
        let after_fields = candidates.len();
        if let Some(maxc) = opts.max_candidates {
            candidates.truncate(maxc);
        }
        metrics::histogram!("search_candidates", candidates.len() as f64);

        let mut hits: Vec<Hit> = Vec::new();
        for i in candidates {
            let score = if free_q.is_empty() {
                Some(0.0f32)
            } else {
                matcher.fuzzy_match(&self.texts[i], &free_q).map(|s| s as f32)
            };
            if let Some(score) = score {
                if opts.min_score.map(|m| score >= m).unwrap_or(true) {
                    hits.push(Hit { doc: i as DocId, score });
                }
            }
        }
        let matched = hits.len();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.doc.cmp(&b.doc)));
        hits.truncate(limit);
        metrics::histogram!("search_eval_ms", started.elapsed().as_secs_f64() * 1_000.0);
        (hits, SearchDebugInfo { total, after_fields, matched })
    }
}
