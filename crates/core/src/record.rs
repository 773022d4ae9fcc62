use std::cmp::Ordering;

use serde_json::{Number, Value};

use crate::{DataError, DataResult};

/// A schema-less record: field name -> JSON value.
pub type Record = serde_json::Map<String, Value>;

/// Identifier field carried by every record.
pub const ID_FIELD: &str = "id";

/// Return the record identifier, treating an explicit `null` as absent.
pub fn record_id(record: &Record) -> Option<&Value> {
    record.get(ID_FIELD).filter(|v| !v.is_null())
}

/// Render an identifier for logs, error messages and storage keys.
pub fn id_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Next server-assigned id after the largest integer id `max` of `collection`.
pub fn next_id(collection: &str, max: Option<i64>) -> DataResult<i64> {
    max.unwrap_or(0).checked_add(1).ok_or_else(|| {
        DataError::validation_code("id_exhausted", format!("{} has no integer id left to assign", collection))
    })
}

/// Convert a JSON payload into a record; only objects are accepted.
pub fn into_record(value: Value) -> DataResult<Record> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(DataError::validation(format!(
            "payload must be an object, got {}",
            type_name(&other)
        ))),
    }
}

/// Shallow merge: fields in `patch` overwrite fields in `target`.
pub fn merge_into(target: &mut Record, patch: &Record) {
    for (k, v) in patch.iter() {
        target.insert(k.clone(), v.clone());
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn cmp_numbers(a: &Number, b: &Number) -> Ordering {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x.cmp(&y);
    }
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        return x.cmp(&y);
    }
    let x = a.as_f64().unwrap_or(f64::NAN);
    let y = b.as_f64().unwrap_or(f64::NAN);
    x.total_cmp(&y)
}

/// Equality used by filters: numbers compare by value (`1 == 1.0`), containers recurse.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => cmp_numbers(x, y) == Ordering::Equal,
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(l, r)| values_equal(l, r))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter().all(|(k, l)| y.get(k).map(|r| values_equal(l, r)).unwrap_or(false))
        }
        _ => a == b,
    }
}

// Cross-type order. Null ranks last so ascending sorts put nulls at the end
// and descending sorts put them first.
fn rank(v: &Value) -> u8 {
    match v {
        Value::Bool(_) => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Array(_) => 3,
        Value::Object(_) => 4,
        Value::Null => 5,
    }
}

/// Total order over JSON values used for `orderBy`.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => cmp_numbers(x, y),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                let o = compare_values(l, r);
                if o != Ordering::Equal {
                    return o;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => rank(a).cmp(&rank(b)),
    }
}
