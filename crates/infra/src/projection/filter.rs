//! Document filter evaluation shared by read store backends.
//!
//! Supports field equality (dotted paths, array membership), the comparison
//! operators `$eq $ne $gt $gte $lt $lte $in $nin $exists`, and the logical
//! combinators `$and $or $nor`.

use std::cmp::Ordering;

use serde_json::{Map, Value as JsonValue};

use crate::query_patterns::SortField;
use crate::smart_config::SortDirection;

/// Value at a dotted path (`Lines.0.Sku`).
pub fn lookup<'a>(document: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    path.split('.').try_fold(document, |current, segment| match current {
        JsonValue::Object(map) => map.get(segment),
        JsonValue::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// `true` if `document` satisfies `filter`. `null` and `{}` match everything.
pub fn matches(document: &JsonValue, filter: &JsonValue) -> bool {
    match filter {
        JsonValue::Null => true,
        JsonValue::Object(clauses) => clauses.iter().all(|(key, condition)| clause_matches(document, key, condition)),
        _ => false,
    }
}

fn clause_matches(document: &JsonValue, key: &str, condition: &JsonValue) -> bool {
    match key {
        "$and" => as_array(condition).is_some_and(|fs| fs.iter().all(|f| matches(document, f))),
        "$or" => as_array(condition).is_some_and(|fs| fs.iter().any(|f| matches(document, f))),
        "$nor" => as_array(condition).is_some_and(|fs| !fs.iter().any(|f| matches(document, f))),
        field => {
            let value = lookup(document, field);
            match operator_map(condition) {
                Some(ops) => ops.iter().all(|(op, operand)| operator_matches(value, op, operand)),
                None => equals(value, condition),
            }
        }
    }
}

fn as_array(value: &JsonValue) -> Option<&Vec<JsonValue>> {
    value.as_array()
}

/// An object whose keys are all operators.
fn operator_map(condition: &JsonValue) -> Option<&Map<String, JsonValue>> {
    match condition {
        JsonValue::Object(map) if !map.is_empty() && map.keys().all(|k| k.starts_with('$')) => Some(map),
        _ => None,
    }
}

fn equals(value: Option<&JsonValue>, expected: &JsonValue) -> bool {
    match value {
        None => expected.is_null(),
        Some(JsonValue::Array(items)) if !expected.is_array() => items.iter().any(|item| json_eq(item, expected)),
        Some(actual) => json_eq(actual, expected),
    }
}

/// Equality with numeric normalisation (`1 == 1.0`).
fn json_eq(a: &JsonValue, b: &JsonValue) -> bool {
    match (a, b) {
        (JsonValue::Number(x), JsonValue::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn operator_matches(value: Option<&JsonValue>, op: &str, operand: &JsonValue) -> bool {
    match op {
        "$eq" => equals(value, operand),
        "$ne" => !equals(value, operand),
        "$gt" => value.and_then(|v| compare(v, operand)) == Some(Ordering::Greater),
        "$gte" => matches!(value.and_then(|v| compare(v, operand)), Some(Ordering::Greater | Ordering::Equal)),
        "$lt" => value.and_then(|v| compare(v, operand)) == Some(Ordering::Less),
        "$lte" => matches!(value.and_then(|v| compare(v, operand)), Some(Ordering::Less | Ordering::Equal)),
        "$in" => as_array(operand).is_some_and(|candidates| candidates.iter().any(|c| equals(value, c))),
        "$nin" => as_array(operand).is_some_and(|candidates| !candidates.iter().any(|c| equals(value, c))),
        "$exists" => operand.as_bool().is_some_and(|want| value.is_some() == want),
        _ => false,
    }
}

/// Ordering between values of the same JSON type; `None` across types.
pub fn compare(a: &JsonValue, b: &JsonValue) -> Option<Ordering> {
    match (a, b) {
        (JsonValue::Number(x), JsonValue::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (JsonValue::String(x), JsonValue::String(y)) => Some(x.cmp(y)),
        (JsonValue::Bool(x), JsonValue::Bool(y)) => Some(x.cmp(y)),
        (JsonValue::Null, JsonValue::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

fn type_rank(value: Option<&JsonValue>) -> u8 {
    match value {
        None | Some(JsonValue::Null) => 0,
        Some(JsonValue::Number(_)) => 1,
        Some(JsonValue::String(_)) => 2,
        Some(JsonValue::Object(_)) => 3,
        Some(JsonValue::Array(_)) => 4,
        Some(JsonValue::Bool(_)) => 5,
    }
}

/// Stable multi-key sort; missing values sort first ascending.
pub fn sort_documents<T>(items: &mut [T], sort: &[SortField], as_json: impl Fn(&T) -> &JsonValue) {
    if sort.is_empty() {
        return;
    }
    items.sort_by(|a, b| {
        let (a, b) = (as_json(a), as_json(b));
        for key in sort {
            let (x, y) = (lookup(a, &key.field), lookup(b, &key.field));
            let ordering = match (x, y) {
                (Some(x), Some(y)) => compare(x, y).unwrap_or_else(|| type_rank(Some(x)).cmp(&type_rank(Some(y)))),
                _ => type_rank(x).cmp(&type_rank(y)),
            };
            let ordering = match key.direction {
                SortDirection::Ascending => ordering,
                SortDirection::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

/// Top-level clauses comparing a field with a plain string, in filter order.
pub fn string_equalities(filter: &JsonValue) -> Vec<(&str, &str)> {
    let JsonValue::Object(clauses) = filter else {
        return Vec::new();
    };
    clauses
        .iter()
        .filter(|(key, _)| !key.starts_with('$') && !key.contains('.'))
        .filter_map(|(key, value)| value.as_str().map(|v| (key.as_str(), v)))
        .collect()
}
