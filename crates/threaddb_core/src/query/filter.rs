//! Compiled MongoDB-style filters.

use crate::error::{CoreError, CoreResult};
use regex::Regex;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use threaddb_storage::field_at;

/// A compiled filter.
#[derive(Debug, Clone, Default)]
pub(crate) enum Filter {
    /// Matches every document.
    #[default]
    All,
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Nor(Vec<Filter>),
    Field {
        path: String,
        conditions: Vec<Condition>,
    },
}

#[derive(Debug, Clone)]
pub(crate) enum Condition {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
    Regex(Regex),
    Size(usize),
    All(Vec<Value>),
    /// Some array element matches a document filter.
    ElemMatch(Box<Filter>),
    /// Some array element satisfies every condition.
    ElemMatchValue(Vec<Condition>),
    Not(Vec<Condition>),
}

impl Filter {
    /// Compiles a filter document.
    pub(crate) fn compile(filter: &Value) -> CoreResult<Self> {
        let fields = filter
            .as_object()
            .ok_or_else(|| CoreError::query("filter must be an object"))?;
        let mut parts = Vec::with_capacity(fields.len());
        for (key, operand) in fields {
            let part = match key.as_str() {
                "$and" => Filter::And(compile_list(key, operand)?),
                "$or" => Filter::Or(compile_list(key, operand)?),
                "$nor" => Filter::Nor(compile_list(key, operand)?),
                op if op.starts_with('$') => {
                    return Err(CoreError::query(format!("unknown top-level operator {op}")))
                }
                path => Filter::Field {
                    path: path.to_string(),
                    conditions: compile_conditions(operand)?,
                },
            };
            parts.push(part);
        }
        Ok(match parts.len() {
            0 => Filter::All,
            1 => parts.remove(0),
            _ => Filter::And(parts),
        })
    }

    pub(crate) fn matches(&self, doc: &Value) -> bool {
        match self {
            Filter::All => true,
            Filter::And(all) => all.iter().all(|f| f.matches(doc)),
            Filter::Or(any) => any.iter().any(|f| f.matches(doc)),
            Filter::Nor(none) => !none.iter().any(|f| f.matches(doc)),
            Filter::Field { path, conditions } => {
                let value = field_at(doc, path);
                conditions.iter().all(|c| c.matches(value))
            }
        }
    }
}

fn compile_list(op: &str, operand: &Value) -> CoreResult<Vec<Filter>> {
    let items = operand
        .as_array()
        .filter(|items| !items.is_empty())
        .ok_or_else(|| CoreError::query(format!("{op} expects a non-empty array")))?;
    items.iter().map(Filter::compile).collect()
}

/// True for a non-empty object whose keys all start with `$`.
fn is_operator(value: &Value) -> bool {
    match value.as_object() {
        Some(obj) if !obj.is_empty() => obj.keys().all(|k| k.starts_with('$')),
        _ => false,
    }
}

fn compile_conditions(operand: &Value) -> CoreResult<Vec<Condition>> {
    match operand.as_object() {
        Some(ops) if is_operator(operand) => compile_operators(ops),
        _ => Ok(vec![Condition::Eq(operand.clone())]),
    }
}

fn compile_operators(ops: &Map<String, Value>) -> CoreResult<Vec<Condition>> {
    let options = ops.get("$options").and_then(Value::as_str).unwrap_or("");
    let mut conditions = Vec::with_capacity(ops.len());
    for (op, operand) in ops {
        let condition = match op.as_str() {
            "$eq" => Condition::Eq(operand.clone()),
            "$ne" => Condition::Ne(operand.clone()),
            "$gt" => Condition::Gt(operand.clone()),
            "$gte" => Condition::Gte(operand.clone()),
            "$lt" => Condition::Lt(operand.clone()),
            "$lte" => Condition::Lte(operand.clone()),
            "$in" => Condition::In(array_operand(op, operand)?),
            "$nin" => Condition::Nin(array_operand(op, operand)?),
            "$all" => Condition::All(array_operand(op, operand)?),
            "$exists" => Condition::Exists(operand.as_bool().unwrap_or(false)),
            "$regex" => Condition::Regex(compile_regex(operand, options)?),
            "$options" => continue,
            "$size" => Condition::Size(
                operand
                    .as_u64()
                    .ok_or_else(|| CoreError::query("$size expects a non-negative integer"))?
                    as usize,
            ),
            "$elemMatch" => {
                let inner = operand
                    .as_object()
                    .ok_or_else(|| CoreError::query("$elemMatch expects an object"))?;
                if is_operator(operand) {
                    Condition::ElemMatchValue(compile_operators(inner)?)
                } else {
                    Condition::ElemMatch(Box::new(Filter::compile(operand)?))
                }
            }
            "$not" => match operand {
                Value::String(_) => Condition::Not(vec![Condition::Regex(compile_regex(
                    operand, "",
                )?)]),
                Value::Object(inner) if is_operator(operand) => {
                    Condition::Not(compile_operators(inner)?)
                }
                _ => return Err(CoreError::query("$not expects an operator object")),
            },
            other => return Err(CoreError::query(format!("unknown operator {other}"))),
        };
        conditions.push(condition);
    }
    Ok(conditions)
}

fn array_operand(op: &str, operand: &Value) -> CoreResult<Vec<Value>> {
    operand
        .as_array()
        .cloned()
        .ok_or_else(|| CoreError::query(format!("{op} expects an array")))
}

fn compile_regex(operand: &Value, options: &str) -> CoreResult<Regex> {
    let pattern = operand
        .as_str()
        .ok_or_else(|| CoreError::query("$regex expects a string"))?;
    let flags: String = options
        .chars()
        .filter(|c| matches!(c, 'i' | 'm' | 's' | 'x'))
        .collect();
    let source = if flags.is_empty() {
        pattern.to_string()
    } else {
        format!("(?{flags}){pattern}")
    };
    Regex::new(&source).map_err(|e| CoreError::query(format!("invalid regex: {e}")))
}

impl Condition {
    fn matches(&self, value: Option<&Value>) -> bool {
        if let Condition::Exists(expected) = self {
            return value.is_some() == *expected;
        }
        if let Condition::Not(inner) = self {
            return !inner.iter().all(|c| c.matches(value));
        }
        let value = value.unwrap_or(&Value::Null);
        match self {
            Condition::Eq(expected) => lifted_eq(value, expected),
            Condition::Ne(expected) => !lifted_eq(value, expected),
            Condition::Gt(bound) => lifted_cmp(value, bound, |o| o == Ordering::Greater),
            Condition::Gte(bound) => lifted_cmp(value, bound, |o| o != Ordering::Less),
            Condition::Lt(bound) => lifted_cmp(value, bound, |o| o == Ordering::Less),
            Condition::Lte(bound) => lifted_cmp(value, bound, |o| o != Ordering::Greater),
            Condition::In(options) => in_list(value, options),
            Condition::Nin(options) => !in_list(value, options),
            Condition::Regex(re) => match value {
                Value::String(s) => re.is_match(s),
                Value::Array(items) => items
                    .iter()
                    .any(|v| v.as_str().is_some_and(|s| re.is_match(s))),
                _ => false,
            },
            Condition::Size(n) => value.as_array().is_some_and(|a| a.len() == *n),
            Condition::All(targets) => value
                .as_array()
                .is_some_and(|items| targets.iter().all(|t| items.contains(t))),
            Condition::ElemMatch(filter) => value
                .as_array()
                .is_some_and(|items| items.iter().any(|item| filter.matches(item))),
            Condition::ElemMatchValue(conditions) => value.as_array().is_some_and(|items| {
                items
                    .iter()
                    .any(|item| conditions.iter().all(|c| c.matches(Some(item))))
            }),
            Condition::Exists(_) | Condition::Not(_) => false,
        }
    }
}

fn lifted_eq(value: &Value, expected: &Value) -> bool {
    if value == expected {
        return true;
    }
    match value {
        Value::Array(items) if !expected.is_array() => items.contains(expected),
        _ => false,
    }
}

fn lifted_cmp(value: &Value, bound: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    match value {
        Value::Array(items) if !bound.is_array() => items
            .iter()
            .any(|item| comparable(item, bound).is_some_and(&accept)),
        _ => comparable(value, bound).is_some_and(accept),
    }
}

fn in_list(value: &Value, options: &[Value]) -> bool {
    match value {
        Value::Array(items) => items.iter().any(|item| options.contains(item)),
        _ => options.contains(value),
    }
}

/// Orders values of the same kind. Mixed kinds and nulls do not compare.
fn comparable(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Total order used for sorting: numbers, then strings, then booleans,
/// then everything else; nulls and missing values last.
pub(crate) fn sort_order(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let rank = |v: Option<&Value>| match v {
        Some(Value::Number(_)) => 0,
        Some(Value::String(_)) => 1,
        Some(Value::Bool(_)) => 2,
        Some(Value::Null) | None => 4,
        Some(_) => 3,
    };
    match (a, b) {
        (Some(x), Some(y)) => comparable(x, y).unwrap_or_else(|| rank(a).cmp(&rank(b))),
        _ => rank(a).cmp(&rank(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn check(filter: Value, doc: Value) -> bool {
        Filter::compile(&filter).unwrap().matches(&doc)
    }

    #[test]
    fn implicit_equality_and_dot_paths() {
        let doc = json!({"name": "ada", "address": {"city": "London"}, "tags": ["x", "y"]});
        assert!(check(json!({"name": "ada"}), doc.clone()));
        assert!(check(json!({"address.city": "London"}), doc.clone()));
        assert!(check(json!({"tags": "y"}), doc.clone()));
        assert!(!check(json!({"tags": "z"}), doc.clone()));
        assert!(check(json!({"tags": ["x", "y"]}), doc));
    }

    #[test]
    fn comparisons_do_not_cross_types() {
        let doc = json!({"age": 30, "name": "ada"});
        assert!(check(json!({"age": {"$gt": 5, "$lte": 30}}), doc.clone()));
        assert!(!check(json!({"age": {"$gt": "5"}}), doc.clone()));
        assert!(!check(json!({"missing": {"$lt": 100}}), doc.clone()));
        assert!(check(json!({"name": {"$gte": "a"}}), doc));
    }

    #[test]
    fn logical_operators() {
        let doc = json!({"a": 1, "b": 2});
        assert!(check(json!({"$or": [{"a": 2}, {"b": 2}]}), doc.clone()));
        assert!(!check(json!({"$and": [{"a": 1}, {"b": 3}]}), doc.clone()));
        assert!(check(json!({"$nor": [{"a": 2}, {"b": 3}]}), doc.clone()));
        assert!(check(json!({"a": {"$not": {"$gt": 5}}}), doc));
    }

    #[test]
    fn membership_and_arrays() {
        let doc = json!({"tags": ["red", "blue"], "n": 3, "items": [{"k": 1}, {"k": 5}]});
        assert!(check(json!({"n": {"$in": [1, 3]}}), doc.clone()));
        assert!(check(json!({"n": {"$nin": [1, 2]}}), doc.clone()));
        assert!(check(json!({"tags": {"$in": ["blue"]}}), doc.clone()));
        assert!(check(json!({"tags": {"$all": ["blue", "red"]}}), doc.clone()));
        assert!(check(json!({"tags": {"$size": 2}}), doc.clone()));
        assert!(check(json!({"items": {"$elemMatch": {"k": {"$gt": 4}}}}), doc.clone()));
        assert!(!check(json!({"items": {"$elemMatch": {"k": 2}}}), doc.clone()));
        assert!(check(json!({"n": {"$elemMatch": {"$gt": 1}}}), json!({"n": [0, 2]})));
        assert!(!check(json!({"n": {"$elemMatch": {"$gt": 1}}}), doc));
    }

    #[test]
    fn exists_distinguishes_null_from_missing() {
        let doc = json!({"a": null});
        assert!(check(json!({"a": {"$exists": true}}), doc.clone()));
        assert!(check(json!({"b": {"$exists": false}}), doc.clone()));
        assert!(check(json!({"b": null}), doc));
    }

    #[test]
    fn regex_with_options() {
        let doc = json!({"name": "Ada Lovelace"});
        assert!(check(json!({"name": {"$regex": "^ada", "$options": "i"}}), doc.clone()));
        assert!(!check(json!({"name": {"$regex": "^ada"}}), doc.clone()));
        assert!(check(json!({"name": {"$not": "^Bob"}}), doc));
    }

    #[test]
    fn invalid_filters_are_rejected() {
        for bad in [
            json!([1]),
            json!({"$where": "x"}),
            json!({"a": {"$bogus": 1}}),
            json!({"a": {"$in": 1}}),
            json!({"$or": []}),
            json!({"a": {"$regex": "("}}),
        ] {
            assert!(Filter::compile(&bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn sort_order_puts_missing_last() {
        assert_eq!(sort_order(Some(&json!(1)), Some(&json!(2))), Ordering::Less);
        assert_eq!(sort_order(None, Some(&json!(2))), Ordering::Greater);
        assert_eq!(sort_order(Some(&json!("a")), Some(&json!(2))), Ordering::Greater);
    }
}
