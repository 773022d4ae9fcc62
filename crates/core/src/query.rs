use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use smallvec::SmallVec;

use crate::record::{compare_values, values_equal, Record};
use crate::{DataError, DataResult};

/// Column projection: everything, or a fixed list of columns.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Selection {
    #[default]
    All,
    Columns(SmallVec<[String; 8]>),
}

impl Selection {
    /// Parse `*` or a comma-separated column list (`id,name,qty`).
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        if s.is_empty() || s == "*" {
            return Selection::All;
        }
        Selection::Columns(
            s.split(',').map(str::trim).filter(|c| !c.is_empty()).map(str::to_string).collect(),
        )
    }

    pub fn columns<I, S>(cols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Selection::Columns(cols.into_iter().map(Into::into).collect())
    }

    /// Render back to the `*` / `a,b,c` form.
    pub fn render(&self) -> String {
        match self {
            Selection::All => "*".to_string(),
            Selection::Columns(cols) => cols.join(","),
        }
    }

    /// Keep only selected columns. Columns missing from the record are skipped.
    pub fn project(&self, record: Record) -> Record {
        match self {
            Selection::All => record,
            Selection::Columns(cols) => {
                let mut out = Record::new();
                for c in cols.iter() {
                    if let Some(v) = record.get(c) {
                        out.insert(c.clone(), v.clone());
                    }
                }
                out
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub ascending: bool,
}

impl OrderBy {
    /// Parse `field`, `field.asc` or `field.desc`.
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        if let Some(f) = s.strip_suffix(".desc") {
            return OrderBy { field: f.to_string(), ascending: false };
        }
        let f = s.strip_suffix(".asc").unwrap_or(s);
        OrderBy { field: f.to_string(), ascending: true }
    }
}

/// Declarative request for a filtered, ordered, limited view of one collection.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QuerySpec {
    pub collection: String,
    #[serde(default)]
    pub selection: Selection,
    /// Exact-equality predicates, all ANDed.
    #[serde(default)]
    pub filter: BTreeMap<String, Value>,
    #[serde(default)]
    pub order_by: Option<OrderBy>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Canonical cache key for a `QuerySpec`. Two specs with equal values yield equal keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryKey(String);

impl QueryKey {
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl QuerySpec {
    pub fn new(collection: impl Into<String>) -> Self {
        Self { collection: collection.into(), ..Default::default() }
    }

    pub fn select<I, S>(mut self, cols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.selection = Selection::columns(cols);
        self
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter.insert(field.into(), value.into());
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, ascending: bool) -> Self {
        self.order_by = Some(OrderBy { field: field.into(), ascending });
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// Cache key: collection + selection + filter + order + limit, JSON-encoded so
    /// names containing separators cannot collide.
    pub fn key(&self) -> QueryKey {
        let columns = match &self.selection {
            Selection::All => None,
            Selection::Columns(cols) => Some(cols.as_slice()),
        };
        let order = self.order_by.as_ref().map(|o| (o.field.as_str(), o.ascending));
        // BTreeMap serializes in field order, independent of insertion order
        let parts = (&self.collection, columns, &self.filter, order, self.limit);
        QueryKey(serde_json::to_string(&parts).unwrap_or_default())
    }

    /// Reject specs that can never be served (empty collection or field names).
    pub fn validate(&self) -> DataResult<()> {
        if self.collection.trim().is_empty() {
            return Err(DataError::validation_code("invalid_query", "collection name is required"));
        }
        if let Selection::Columns(cols) = &self.selection {
            if cols.is_empty() || cols.iter().any(|c| c.trim().is_empty()) {
                return Err(DataError::validation_code("invalid_query", "empty column in selection"));
            }
        }
        if self.filter.keys().any(|k| k.trim().is_empty()) {
            return Err(DataError::validation_code("invalid_query", "empty field name in filter"));
        }
        if let Some(o) = &self.order_by {
            if o.field.trim().is_empty() {
                return Err(DataError::validation_code("invalid_query", "empty order field"));
            }
        }
        Ok(())
    }

    /// True when every filter entry equals the record's value (missing fields read as null).
    pub fn matches(&self, record: &Record) -> bool {
        self.filter
            .iter()
            .all(|(field, want)| values_equal(record.get(field).unwrap_or(&Value::Null), want))
    }

    /// Evaluate the spec over an in-memory sequence: filter, stable sort, limit, project.
    ///
    /// Backends without a native query engine use this to serve reads.
    pub fn evaluate<'a, I>(&self, rows: I) -> Vec<Record>
    where
        I: IntoIterator<Item = &'a Record>,
    {
        let mut hits: Vec<&Record> = rows.into_iter().filter(|r| self.matches(r)).collect();
        if let Some(order) = &self.order_by {
            // sort_by is stable: ties keep their input order in both directions
            hits.sort_by(|a, b| {
                let l = a.get(&order.field).unwrap_or(&Value::Null);
                let r = b.get(&order.field).unwrap_or(&Value::Null);
                let o = compare_values(l, r);
                if order.ascending { o } else { o.reverse() }
            });
        }
        if let Some(n) = self.limit {
            hits.truncate(n);
        }
        hits.into_iter().map(|r| self.selection.project(r.clone())).collect()
    }
}
