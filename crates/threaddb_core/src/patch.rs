//! JSON Patch (RFC 6902) diffing and application.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One JSON Patch operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Operation {
    /// Adds a value, inserting into arrays.
    Add {
        /// Target pointer.
        path: String,
        /// Value to add.
        value: Value,
    },
    /// Removes the target.
    Remove {
        /// Target pointer.
        path: String,
    },
    /// Replaces the target.
    Replace {
        /// Target pointer.
        path: String,
        /// New value.
        value: Value,
    },
    /// Moves a value.
    Move {
        /// Source pointer.
        from: String,
        /// Target pointer.
        path: String,
    },
    /// Copies a value.
    Copy {
        /// Source pointer.
        from: String,
        /// Target pointer.
        path: String,
    },
    /// Fails unless the target equals `value`.
    Test {
        /// Target pointer.
        path: String,
        /// Expected value.
        value: Value,
    },
}

impl Operation {
    /// The operation's target pointer.
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Operation::Add { path, .. }
            | Operation::Remove { path }
            | Operation::Replace { path, .. }
            | Operation::Move { path, .. }
            | Operation::Copy { path, .. }
            | Operation::Test { path, .. } => path,
        }
    }
}

/// Computes the operations that turn `from` into `to`.
///
/// Objects are compared member by member and arrays index by index; any
/// other difference becomes a `replace`. Only `add`, `remove` and
/// `replace` are produced.
#[must_use]
pub fn compare(from: &Value, to: &Value) -> Vec<Operation> {
    let mut ops = Vec::new();
    diff_into(from, to, &mut String::new(), &mut ops);
    ops
}

fn diff_into(from: &Value, to: &Value, path: &mut String, ops: &mut Vec<Operation>) {
    if from == to {
        return;
    }
    match (from, to) {
        (Value::Object(a), Value::Object(b)) => {
            for (key, old) in a {
                let len = path.len();
                push_token(path, key);
                match b.get(key) {
                    Some(new) => diff_into(old, new, path, ops),
                    None => ops.push(Operation::Remove { path: path.clone() }),
                }
                path.truncate(len);
            }
            for (key, new) in b {
                if !a.contains_key(key) {
                    let len = path.len();
                    push_token(path, key);
                    ops.push(Operation::Add {
                        path: path.clone(),
                        value: new.clone(),
                    });
                    path.truncate(len);
                }
            }
        }
        (Value::Array(a), Value::Array(b)) => {
            let common = a.len().min(b.len());
            for i in 0..common {
                let len = path.len();
                push_token(path, &i.to_string());
                diff_into(&a[i], &b[i], path, ops);
                path.truncate(len);
            }
            // Remove from the end so earlier indexes stay valid.
            for i in (common..a.len()).rev() {
                ops.push(Operation::Remove {
                    path: format!("{path}/{i}"),
                });
            }
            for (i, value) in b.iter().enumerate().skip(common) {
                ops.push(Operation::Add {
                    path: format!("{path}/{i}"),
                    value: value.clone(),
                });
            }
        }
        _ => ops.push(Operation::Replace {
            path: path.clone(),
            value: to.clone(),
        }),
    }
}

fn push_token(path: &mut String, token: &str) {
    path.push('/');
    path.push_str(&token.replace('~', "~0").replace('/', "~1"));
}

/// Splits a JSON pointer into unescaped tokens.
///
/// # Errors
///
/// Fails if the pointer is neither empty nor starts with `/`.
pub fn parse_pointer(pointer: &str) -> CoreResult<Vec<String>> {
    if pointer.is_empty() {
        return Ok(Vec::new());
    }
    let rest = pointer
        .strip_prefix('/')
        .ok_or_else(|| CoreError::patch(format!("invalid pointer {pointer:?}")))?;
    Ok(rest
        .split('/')
        .map(|t| t.replace("~1", "/").replace("~0", "~"))
        .collect())
}

/// Applies operations in order. Either every operation applies or the
/// document is left unchanged.
///
/// # Errors
///
/// Fails on the first operation that cannot be applied, including a
/// failed `test`.
pub fn apply(doc: &mut Value, ops: &[Operation]) -> CoreResult<()> {
    let mut working = doc.clone();
    for op in ops {
        apply_one(&mut working, op, false)?;
    }
    *doc = working;
    Ok(())
}

/// Applies operations, tolerating targets that have drifted.
///
/// Removing a missing member is a no-op, replacing a missing member adds
/// it, adding beneath a missing parent creates the parent object, array
/// indexes past the end append, and `test` never fails. Used to replay
/// local edits over a document that changed underneath them.
///
/// # Errors
///
/// Fails only when an operation is structurally impossible, such as
/// indexing into a string.
pub fn apply_lenient(doc: &mut Value, ops: &[Operation]) -> CoreResult<()> {
    let mut working = doc.clone();
    for op in ops {
        apply_one(&mut working, op, true)?;
    }
    *doc = working;
    Ok(())
}

fn apply_one(doc: &mut Value, op: &Operation, lenient: bool) -> CoreResult<()> {
    match op {
        Operation::Add { path, value } => add(doc, &parse_pointer(path)?, value.clone(), lenient),
        Operation::Remove { path } => match remove(doc, &parse_pointer(path)?) {
            Ok(_) => Ok(()),
            Err(_) if lenient => Ok(()),
            Err(e) => Err(e),
        },
        Operation::Replace { path, value } => {
            let tokens = parse_pointer(path)?;
            if get(doc, &tokens).is_none() {
                if lenient {
                    return add(doc, &tokens, value.clone(), true);
                }
                return Err(CoreError::patch(format!("replace target {path} not found")));
            }
            set(doc, &tokens, value.clone())
        }
        Operation::Move { from, path } => {
            let source = parse_pointer(from)?;
            let target = parse_pointer(path)?;
            if target.len() > source.len() && target.starts_with(&source) {
                return Err(CoreError::patch(format!("cannot move {from} into itself")));
            }
            match remove(doc, &source) {
                Ok(value) => add(doc, &target, value, lenient),
                Err(_) if lenient => Ok(()),
                Err(e) => Err(e),
            }
        }
        Operation::Copy { from, path } => match get(doc, &parse_pointer(from)?).cloned() {
            Some(value) => add(doc, &parse_pointer(path)?, value, lenient),
            None if lenient => Ok(()),
            None => Err(CoreError::patch(format!("copy source {from} not found"))),
        },
        Operation::Test { path, value } => {
            if lenient || get(doc, &parse_pointer(path)?) == Some(value) {
                Ok(())
            } else {
                Err(CoreError::patch(format!("test failed at {path}")))
            }
        }
    }
}

fn get<'a>(doc: &'a Value, tokens: &[String]) -> Option<&'a Value> {
    tokens.iter().try_fold(doc, |current, token| match current {
        Value::Object(map) => map.get(token),
        Value::Array(items) => token.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn parent_mut<'a>(
    doc: &'a mut Value,
    tokens: &[String],
    create: bool,
) -> CoreResult<&'a mut Value> {
    let mut current = doc;
    for token in tokens {
        current = match current {
            Value::Object(map) => {
                if create && !map.contains_key(token) {
                    map.insert(token.clone(), Value::Object(serde_json::Map::new()));
                }
                map.get_mut(token)
                    .ok_or_else(|| CoreError::patch(format!("path segment {token} not found")))?
            }
            Value::Array(items) => {
                let index = token
                    .parse::<usize>()
                    .map_err(|_| CoreError::patch(format!("invalid array index {token}")))?;
                items
                    .get_mut(index)
                    .ok_or_else(|| CoreError::patch(format!("array index {index} out of range")))?
            }
            _ => return Err(CoreError::patch(format!("cannot descend into {token}"))),
        };
    }
    Ok(current)
}

fn add(doc: &mut Value, tokens: &[String], value: Value, lenient: bool) -> CoreResult<()> {
    let Some((last, parents)) = tokens.split_last() else {
        *doc = value;
        return Ok(());
    };
    match parent_mut(doc, parents, lenient)? {
        Value::Object(map) => {
            map.insert(last.clone(), value);
            Ok(())
        }
        Value::Array(items) => {
            if last == "-" {
                items.push(value);
                return Ok(());
            }
            let index = last
                .parse::<usize>()
                .map_err(|_| CoreError::patch(format!("invalid array index {last}")))?;
            if index <= items.len() {
                items.insert(index, value);
                Ok(())
            } else if lenient {
                items.push(value);
                Ok(())
            } else {
                Err(CoreError::patch(format!("array index {index} out of range")))
            }
        }
        _ => Err(CoreError::patch(format!("cannot add {last} to a scalar"))),
    }
}

fn remove(doc: &mut Value, tokens: &[String]) -> CoreResult<Value> {
    let Some((last, parents)) = tokens.split_last() else {
        return Ok(std::mem::replace(doc, Value::Null));
    };
    match parent_mut(doc, parents, false)? {
        Value::Object(map) => map
            .remove(last)
            .ok_or_else(|| CoreError::patch(format!("remove target {last} not found"))),
        Value::Array(items) => {
            let index = last
                .parse::<usize>()
                .map_err(|_| CoreError::patch(format!("invalid array index {last}")))?;
            if index < items.len() {
                Ok(items.remove(index))
            } else {
                Err(CoreError::patch(format!("array index {index} out of range")))
            }
        }
        _ => Err(CoreError::patch(format!("cannot remove {last} from a scalar"))),
    }
}

fn set(doc: &mut Value, tokens: &[String], value: Value) -> CoreResult<()> {
    let Some((last, parents)) = tokens.split_last() else {
        *doc = value;
        return Ok(());
    };
    match parent_mut(doc, parents, false)? {
        Value::Object(map) => {
            map.insert(last.clone(), value);
            Ok(())
        }
        Value::Array(items) => {
            let slot = last
                .parse::<usize>()
                .ok()
                .and_then(|i| items.get_mut(i))
                .ok_or_else(|| CoreError::patch(format!("array index {last} out of range")))?;
            *slot = value;
            Ok(())
        }
        _ => Err(CoreError::patch(format!("cannot replace {last} in a scalar"))),
    }
}
