//! Property-based test generators using proptest.
//!
//! Documents are small, flat JSON objects over a fixed vocabulary so that
//! generated filters actually hit generated data.

use proptest::prelude::*;
use serde_json::{json, Map, Value};

/// Tags generated documents draw from.
pub const TAGS: &[&str] = &["red", "green", "blue", "large", "small"];

/// Cities generated documents draw from.
pub const CITIES: &[&str] = &["Lagos", "Lima", "Oslo", "Pune"];

/// Strategy for valid collection names.
pub fn collection_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_]{0,15}").expect("Invalid regex")
}

/// Strategy for scalar JSON values.
pub fn scalar_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        (-1000i64..1000).prop_map(|n| json!(n)),
        "[a-z]{0,8}".prop_map(Value::String),
    ]
}

/// Strategy for a person document without an `_id`.
///
/// `age` is always present; `city` and `tags` are sometimes missing.
pub fn person_strategy() -> impl Strategy<Value = Value> {
    (
        "[a-z]{1,8}",
        0i64..100,
        prop::option::of(prop::sample::select(CITIES)),
        prop::option::of(prop::sample::subsequence(TAGS, 0..=3)),
    )
        .prop_map(|(name, age, city, tags)| {
            let mut doc = Map::new();
            doc.insert("name".into(), Value::String(name));
            doc.insert("age".into(), json!(age));
            if let Some(city) = city {
                doc.insert("city".into(), json!(city));
            }
            if let Some(tags) = tags {
                doc.insert("tags".into(), json!(tags));
            }
            Value::Object(doc)
        })
}

/// Strategy for up to `max` people with distinct ids `p000`, `p001`, ...
pub fn people_strategy(max: usize) -> impl Strategy<Value = Vec<Value>> {
    prop::collection::vec(person_strategy(), 0..=max).prop_map(|people| {
        people
            .into_iter()
            .enumerate()
            .map(|(i, mut doc)| {
                if let Value::Object(fields) = &mut doc {
                    fields.insert("_id".into(), json!(format!("p{i:03}")));
                }
                doc
            })
            .collect()
    })
}

/// A mutation of one document in a small id space.
#[derive(Debug, Clone)]
pub enum DocOperation {
    /// Save a document.
    Save(Value),
    /// Delete by id.
    Delete(String),
}

/// Strategy for one operation over ids `d0`..`d{ids - 1}`.
pub fn doc_operation_strategy(ids: usize) -> impl Strategy<Value = DocOperation> {
    let ids = ids.max(1);
    prop_oneof![
        3 => (0..ids, person_strategy()).prop_map(|(i, mut doc)| {
            if let Value::Object(fields) = &mut doc {
                fields.insert("_id".into(), json!(format!("d{i}")));
            }
            DocOperation::Save(doc)
        }),
        1 => (0..ids).prop_map(|i| DocOperation::Delete(format!("d{i}"))),
    ]
}

/// Strategy for a sequence of operations.
pub fn doc_operations_strategy(
    ids: usize,
    max_ops: usize,
) -> impl Strategy<Value = Vec<DocOperation>> {
    prop::collection::vec(doc_operation_strategy(ids), 0..=max_ops)
}

/// Proptest configuration for quick runs.
#[must_use]
pub fn quick_config() -> ProptestConfig {
    ProptestConfig {
        cases: 32,
        max_shrink_iters: 100,
        ..ProptestConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #![proptest_config(quick_config())]

        #[test]
        fn people_have_distinct_ids(people in people_strategy(20)) {
            let mut ids: Vec<&str> = people.iter().map(|p| p["_id"].as_str().unwrap()).collect();
            let total = ids.len();
            ids.dedup();
            prop_assert_eq!(ids.len(), total);
            for person in &people {
                prop_assert!(person["age"].is_i64());
            }
        }

        #[test]
        fn collection_names_are_user_names(name in collection_name_strategy()) {
            prop_assert!(!name.starts_with('_'));
            prop_assert!(!name.is_empty());
        }
    }
}
