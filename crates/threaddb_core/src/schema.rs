//! A JSON Schema subset used to validate collection documents.
//!
//! Supported keywords: `type` (including `integer` and type lists),
//! `properties`, `required`, `additionalProperties`, `items`, `enum`,
//! `const`, `default`, `minimum`, `maximum`, `exclusiveMinimum`,
//! `exclusiveMaximum`, `multipleOf`, `minLength`, `maxLength`, `pattern`,
//! `minItems`, `maxItems`, `uniqueItems`, `allOf`, `anyOf`, `oneOf` and
//! `not`. Unknown keywords are ignored.

use crate::error::{CoreError, CoreResult};
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

/// One failed constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    /// JSON pointer to the offending value; empty for the document root.
    pub path: String,
    /// What went wrong.
    pub message: String,
}

impl ValidationIssue {
    /// Creates an issue.
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = if self.path.is_empty() { "/" } else { &self.path };
        write!(f, "{path}: {}", self.message)
    }
}

/// A compiled schema.
///
/// # Example
///
/// ```rust
/// use serde_json::json;
/// use threaddb_core::SchemaValidator;
///
/// let schema = SchemaValidator::new(json!({
///     "type": "object",
///     "required": ["name"],
///     "properties": {"name": {"type": "string"}, "age": {"type": "integer", "default": 0}}
/// })).unwrap();
///
/// let mut doc = json!({"name": "ada"});
/// schema.validate(&mut doc).unwrap();
/// assert_eq!(doc["age"], 0);
/// assert!(schema.validate(&mut json!({"age": 3})).is_err());
/// ```
#[derive(Debug, Clone)]
pub struct SchemaValidator {
    schema: Value,
    patterns: HashMap<String, Regex>,
}

impl SchemaValidator {
    /// Compiles a schema.
    ///
    /// # Errors
    ///
    /// [`CoreError::Validation`] if the schema is not an object or boolean,
    /// or one of its `pattern`s is not a valid regular expression.
    pub fn new(schema: Value) -> CoreResult<Self> {
        if !schema.is_object() && !schema.is_boolean() {
            return Err(CoreError::validation(
                "schema",
                vec![ValidationIssue::new("", "schema must be an object or boolean")],
            ));
        }
        let mut patterns = HashMap::new();
        let mut issues = Vec::new();
        collect_patterns(&schema, &mut patterns, &mut issues);
        if !issues.is_empty() {
            return Err(CoreError::validation("schema", issues));
        }
        Ok(Self { schema, patterns })
    }

    /// The schema document.
    #[must_use]
    pub fn schema(&self) -> &Value {
        &self.schema
    }

    /// Fills in `default`s for missing properties, then checks `doc`.
    ///
    /// # Errors
    ///
    /// Every violated constraint.
    pub fn validate(&self, doc: &mut Value) -> Result<(), Vec<ValidationIssue>> {
        apply_defaults(&self.schema, doc);
        let mut issues = Vec::new();
        self.check(&self.schema, doc, "", &mut issues);
        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }

    /// Checks `doc` without modifying it.
    #[must_use]
    pub fn is_valid(&self, doc: &Value) -> bool {
        let mut issues = Vec::new();
        self.check(&self.schema, doc, "", &mut issues);
        issues.is_empty()
    }

    fn check(&self, schema: &Value, value: &Value, path: &str, issues: &mut Vec<ValidationIssue>) {
        let rules = match schema {
            Value::Bool(true) => return,
            Value::Bool(false) => {
                issues.push(ValidationIssue::new(path, "no value is allowed here"));
                return;
            }
            Value::Object(rules) => rules,
            _ => return,
        };
        let mut fail = |message: String| issues.push(ValidationIssue::new(path, message));

        if let Some(expected) = rules.get("type") {
            if !type_matches(expected, value) {
                fail(format!("expected type {expected}, found {}", kind(value)));
                // Further keywords assume the right type.
                return;
            }
        }
        if let Some(options) = rules.get("enum").and_then(Value::as_array) {
            if !options.contains(value) {
                fail(format!("{value} is not one of {}", Value::Array(options.clone())));
            }
        }
        if let Some(constant) = rules.get("const") {
            if constant != value {
                fail(format!("expected {constant}"));
            }
        }

        match value {
            Value::Number(n) => {
                if let Some(x) = n.as_f64() {
                    check_number(rules, x, &mut fail);
                }
            }
            Value::String(s) => {
                let len = s.chars().count() as u64;
                if let Some(min) = rules.get("minLength").and_then(Value::as_u64) {
                    if len < min {
                        fail(format!("shorter than {min} characters"));
                    }
                }
                if let Some(max) = rules.get("maxLength").and_then(Value::as_u64) {
                    if len > max {
                        fail(format!("longer than {max} characters"));
                    }
                }
                if let Some(pattern) = rules.get("pattern").and_then(Value::as_str) {
                    if let Some(re) = self.patterns.get(pattern) {
                        if !re.is_match(s) {
                            fail(format!("does not match pattern {pattern}"));
                        }
                    }
                }
            }
            _ => {}
        }

        if let Value::Array(items) = value {
            let len = items.len() as u64;
            if let Some(min) = rules.get("minItems").and_then(Value::as_u64) {
                if len < min {
                    fail(format!("fewer than {min} items"));
                }
            }
            if let Some(max) = rules.get("maxItems").and_then(Value::as_u64) {
                if len > max {
                    fail(format!("more than {max} items"));
                }
            }
            if rules.get("uniqueItems") == Some(&Value::Bool(true)) {
                let duplicate = items
                    .iter()
                    .enumerate()
                    .any(|(i, a)| items[..i].contains(a));
                if duplicate {
                    fail("items are not unique".to_string());
                }
            }
            if let Some(item_schema) = rules.get("items") {
                for (i, item) in items.iter().enumerate() {
                    self.check(item_schema, item, &format!("{path}/{i}"), issues);
                }
            }
        }

        if let Value::Object(fields) = value {
            self.check_object(rules, fields, path, issues);
        }
        self.check_combinators(rules, value, path, issues);
    }

    fn check_object(
        &self,
        rules: &Map<String, Value>,
        fields: &Map<String, Value>,
        path: &str,
        issues: &mut Vec<ValidationIssue>,
    ) {
        if let Some(required) = rules.get("required").and_then(Value::as_array) {
            for name in required.iter().filter_map(Value::as_str) {
                if !fields.contains_key(name) {
                    issues.push(ValidationIssue::new(
                        path,
                        format!("missing required property {name}"),
                    ));
                }
            }
        }
        let properties = rules.get("properties").and_then(Value::as_object);
        for (name, field) in fields {
            let child = format!("{path}/{}", escape(name));
            match properties.and_then(|p| p.get(name)) {
                Some(sub) => self.check(sub, field, &child, issues),
                None => match rules.get("additionalProperties") {
                    Some(Value::Bool(false)) => issues.push(ValidationIssue::new(
                        child,
                        "additional property is not allowed",
                    )),
                    Some(sub @ Value::Object(_)) => self.check(sub, field, &child, issues),
                    _ => {}
                },
            }
        }
    }

    fn check_combinators(
        &self,
        rules: &Map<String, Value>,
        value: &Value,
        path: &str,
        issues: &mut Vec<ValidationIssue>,
    ) {
        let passes = |schema: &Value| {
            let mut scratch = Vec::new();
            self.check(schema, value, path, &mut scratch);
            scratch.is_empty()
        };
        if let Some(all) = rules.get("allOf").and_then(Value::as_array) {
            for schema in all {
                self.check(schema, value, path, issues);
            }
        }
        if let Some(any) = rules.get("anyOf").and_then(Value::as_array) {
            if !any.iter().any(passes) {
                issues.push(ValidationIssue::new(path, "does not match any allowed schema"));
            }
        }
        if let Some(one) = rules.get("oneOf").and_then(Value::as_array) {
            let matched = one.iter().filter(|s| passes(s)).count();
            if matched != 1 {
                issues.push(ValidationIssue::new(
                    path,
                    format!("matches {matched} schemas, expected exactly one"),
                ));
            }
        }
        if let Some(not) = rules.get("not") {
            if passes(not) {
                issues.push(ValidationIssue::new(path, "matches a forbidden schema"));
            }
        }
    }
}

fn check_number(rules: &Map<String, Value>, x: f64, fail: &mut impl FnMut(String)) {
    let bound = |key: &str| rules.get(key).and_then(Value::as_f64);
    if let Some(min) = bound("minimum") {
        if x < min {
            fail(format!("less than minimum {min}"));
        }
    }
    if let Some(max) = bound("maximum") {
        if x > max {
            fail(format!("greater than maximum {max}"));
        }
    }
    if let Some(min) = bound("exclusiveMinimum") {
        if x <= min {
            fail(format!("not greater than {min}"));
        }
    }
    if let Some(max) = bound("exclusiveMaximum") {
        if x >= max {
            fail(format!("not less than {max}"));
        }
    }
    if let Some(step) = bound("multipleOf") {
        if step > 0.0 {
            let ratio = x / step;
            if (ratio - ratio.round()).abs() > 1e-9 {
                fail(format!("not a multiple of {step}"));
            }
        }
    }
}

fn type_matches(expected: &Value, value: &Value) -> bool {
    match expected {
        Value::String(name) => is_type(name, value),
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .any(|name| is_type(name, value)),
        _ => true,
    }
}

fn is_type(name: &str, value: &Value) -> bool {
    match name {
        "integer" => match value {
            Value::Number(n) => {
                n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
            }
            _ => false,
        },
        other => kind(value) == other,
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn escape(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

fn apply_defaults(schema: &Value, value: &mut Value) {
    let (Some(rules), Value::Object(fields)) = (schema.as_object(), value) else {
        return;
    };
    let Some(properties) = rules.get("properties").and_then(Value::as_object) else {
        return;
    };
    for (name, sub) in properties {
        if !fields.contains_key(name) {
            if let Some(default) = sub.get("default") {
                fields.insert(name.clone(), default.clone());
            }
        }
        if let Some(field) = fields.get_mut(name) {
            apply_defaults(sub, field);
        }
    }
}

fn collect_patterns(
    schema: &Value,
    patterns: &mut HashMap<String, Regex>,
    issues: &mut Vec<ValidationIssue>,
) {
    match schema {
        Value::Object(rules) => {
            if let Some(pattern) = rules.get("pattern").and_then(Value::as_str) {
                if !patterns.contains_key(pattern) {
                    match Regex::new(pattern) {
                        Ok(re) => {
                            patterns.insert(pattern.to_string(), re);
                        }
                        Err(e) => issues.push(ValidationIssue::new(
                            "",
                            format!("invalid pattern {pattern}: {e}"),
                        )),
                    }
                }
            }
            for (key, sub) in rules {
                if matches!(key.as_str(), "enum" | "const" | "default") {
                    continue;
                }
                collect_patterns(sub, patterns, issues);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_patterns(item, patterns, issues);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn person() -> SchemaValidator {
        SchemaValidator::new(json!({
            "type": "object",
            "required": ["name", "age"],
            "additionalProperties": false,
            "properties": {
                "_id": {"type": "string"},
                "name": {"type": "string", "minLength": 1},
                "age": {"type": "integer", "minimum": 0},
                "email": {"type": "string", "pattern": "^[^@]+@[^@]+$"},
                "tags": {"type": "array", "items": {"type": "string"}, "uniqueItems": true},
                "role": {"enum": ["admin", "user"], "default": "user"}
            }
        }))
        .unwrap()
    }

    #[test]
    fn accepts_valid_and_fills_defaults() {
        let mut doc = json!({"name": "ada", "age": 36});
        person().validate(&mut doc).unwrap();
        assert_eq!(doc["role"], "user");
    }

    #[test]
    fn reports_every_issue_with_paths() {
        let mut doc = json!({
            "name": "",
            "age": 3.5,
            "email": "nope",
            "tags": ["a", 1, "a"],
            "extra": true
        });
        let issues = person().validate(&mut doc).unwrap_err();
        let paths: Vec<&str> = issues.iter().map(|i| i.path.as_str()).collect();
        for expected in ["/name", "/age", "/email", "/tags", "/tags/1", "/extra"] {
            assert!(paths.contains(&expected), "{expected} missing from {paths:?}");
        }
    }

    #[test]
    fn missing_required_is_reported_at_root() {
        let issues = person().validate(&mut json!({"name": "dev"})).unwrap_err();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].to_string(), "/: missing required property age");
    }

    #[test]
    fn combinators() {
        let schema = SchemaValidator::new(json!({
            "oneOf": [{"type": "string"}, {"type": "integer"}],
            "not": {"const": 13}
        }))
        .unwrap();
        assert!(schema.is_valid(&json!("x")));
        assert!(schema.is_valid(&json!(4)));
        assert!(!schema.is_valid(&json!(13)));
        assert!(!schema.is_valid(&json!(true)));

        let any = SchemaValidator::new(json!({"anyOf": [{"minimum": 10}, {"maximum": 0}]})).unwrap();
        assert!(any.is_valid(&json!(-1)));
        assert!(!any.is_valid(&json!(5)));
    }

    #[test]
    fn type_lists_and_number_bounds() {
        let schema = SchemaValidator::new(json!({
            "type": ["number", "null"],
            "exclusiveMinimum": 0,
            "multipleOf": 0.5
        }))
        .unwrap();
        assert!(schema.is_valid(&Value::Null));
        assert!(schema.is_valid(&json!(1.5)));
        assert!(!schema.is_valid(&json!(0)));
        assert!(!schema.is_valid(&json!(1.2)));
    }

    #[test]
    fn bad_schemas_are_rejected() {
        assert!(SchemaValidator::new(json!("string")).is_err());
        assert!(SchemaValidator::new(json!({"pattern": "("})).is_err());
        assert!(SchemaValidator::new(json!(true)).is_ok());
    }
}
