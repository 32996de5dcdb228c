//! Total order over JSON field values and entities.
//!
//! null < bool < number < string < array < object. Strings compare
//! case-insensitively first, then bytewise so the order stays total.

#![forbid(unsafe_code)]

use std::cmp::Ordering;

use serde_json::Value;

use crate::{Entity, SortDir, SortSpec};

fn rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x
            .to_lowercase()
            .cmp(&y.to_lowercase())
            .then_with(|| x.cmp(y)),
        // arrays/objects only need a stable order, not a meaningful one
        (Value::Array(_), Value::Array(_)) | (Value::Object(_), Value::Object(_)) => {
            a.to_string().cmp(&b.to_string())
        }
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Compare two entities under `sort`; equal keys fall back to ascending id
/// regardless of direction so repeated sorts are deterministic.
pub fn compare_entities(a: &Entity, b: &Entity, sort: &SortSpec) -> Ordering {
    let primary = compare_values(&a.get(&sort.key), &b.get(&sort.key));
    let primary = match sort.dir {
        SortDir::Asc => primary,
        SortDir::Desc => primary.reverse(),
    };
    primary.then_with(|| a.id.cmp(&b.id))
}
