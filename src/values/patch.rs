//! JSON Patch (RFC 6902) operations over JSON topic values.
//!
//! Also the representation of JSON deltas: [`super::diff_json`] produces a
//! list of these operations that transforms one value into the next.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single patch operation addressed by JSON pointer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PatchOperation {
    Add { path: String, value: Value },
    Remove { path: String },
    Replace { path: String, value: Value },
    Move { from: String, path: String },
    Copy { from: String, path: String },
    Test { path: String, value: Value },
}

impl PatchOperation {
    pub fn path(&self) -> &str {
        match self {
            PatchOperation::Add { path, .. }
            | PatchOperation::Remove { path }
            | PatchOperation::Replace { path, .. }
            | PatchOperation::Move { path, .. }
            | PatchOperation::Copy { path, .. }
            | PatchOperation::Test { path, .. } => path,
        }
    }
}

/// Parse a JSON Patch document such as
/// `[{"op": "add", "path": "/array", "value": [0, 1, 2]}]`.
pub fn parse_json_patch(document: &str) -> Result<Vec<PatchOperation>> {
    let parsed: Value = serde_json::from_str(document)
        .map_err(|e| EngineError::Deserialization(e.to_string()))?;
    let items = parsed.as_array().ok_or_else(|| {
        EngineError::Deserialization("JSON patch must be an array".to_string())
    })?;

    items
        .iter()
        .enumerate()
        .map(|(index, item)| parse_operation(index, item))
        .collect()
}

fn parse_operation(index: usize, item: &Value) -> Result<PatchOperation> {
    let field = |name: &str| -> Result<String> {
        item.get(name)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| EngineError::JsonPatchFailed {
                index,
                reason: format!("missing string member {:?}", name),
            })
    };
    let value = || -> Result<Value> {
        item.get("value")
            .cloned()
            .ok_or_else(|| EngineError::JsonPatchFailed {
                index,
                reason: "missing member \"value\"".to_string(),
            })
    };

    match field("op")?.as_str() {
        "add" => Ok(PatchOperation::Add {
            path: field("path")?,
            value: value()?,
        }),
        "remove" => Ok(PatchOperation::Remove {
            path: field("path")?,
        }),
        "replace" => Ok(PatchOperation::Replace {
            path: field("path")?,
            value: value()?,
        }),
        "move" => Ok(PatchOperation::Move {
            from: field("from")?,
            path: field("path")?,
        }),
        "copy" => Ok(PatchOperation::Copy {
            from: field("from")?,
            path: field("path")?,
        }),
        "test" => Ok(PatchOperation::Test {
            path: field("path")?,
            value: value()?,
        }),
        other => Err(EngineError::JsonPatchFailed {
            index,
            reason: format!("unknown op {:?}", other),
        }),
    }
}

/// Apply operations to a copy of `value`. Either all apply or none do.
pub fn apply_patch(value: &Value, operations: &[PatchOperation]) -> Result<Value> {
    let mut doc = value.clone();
    for (index, operation) in operations.iter().enumerate() {
        apply_one(&mut doc, operation)
            .map_err(|reason| EngineError::JsonPatchFailed { index, reason })?;
    }
    Ok(doc)
}

fn apply_one(doc: &mut Value, operation: &PatchOperation) -> std::result::Result<(), String> {
    match operation {
        PatchOperation::Add { path, value } => add(doc, &parse_pointer(path)?, value.clone()),
        PatchOperation::Remove { path } => remove(doc, &parse_pointer(path)?).map(|_| ()),
        PatchOperation::Replace { path, value } => {
            let target = resolve_mut(doc, &parse_pointer(path)?)
                .ok_or_else(|| format!("no value at {}", path))?;
            *target = value.clone();
            Ok(())
        }
        PatchOperation::Move { from, path } => {
            if from != path && path.starts_with(from.as_str()) && path[from.len()..].starts_with('/')
            {
                return Err(format!("cannot move {} into its own child {}", from, path));
            }
            let moved = remove(doc, &parse_pointer(from)?)?;
            add(doc, &parse_pointer(path)?, moved)
        }
        PatchOperation::Copy { from, path } => {
            let copied = resolve(doc, &parse_pointer(from)?)
                .cloned()
                .ok_or_else(|| format!("no value at {}", from))?;
            add(doc, &parse_pointer(path)?, copied)
        }
        PatchOperation::Test { path, value } => {
            let actual = resolve(doc, &parse_pointer(path)?)
                .ok_or_else(|| format!("no value at {}", path))?;
            if actual == value {
                Ok(())
            } else {
                Err(format!("test failed at {}", path))
            }
        }
    }
}

/// Split a JSON pointer into unescaped reference tokens.
pub(crate) fn parse_pointer(pointer: &str) -> std::result::Result<Vec<String>, String> {
    if pointer.is_empty() {
        return Ok(Vec::new());
    }
    if !pointer.starts_with('/') {
        return Err(format!("invalid JSON pointer {:?}", pointer));
    }
    Ok(pointer[1..]
        .split('/')
        .map(|token| token.replace("~1", "/").replace("~0", "~"))
        .collect())
}

/// Escape a key for use as a JSON pointer token.
pub(crate) fn escape_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

fn array_index(token: &str, len: usize, allow_end: bool) -> std::result::Result<usize, String> {
    if allow_end && token == "-" {
        return Ok(len);
    }
    let index: usize = token
        .parse()
        .map_err(|_| format!("invalid array index {:?}", token))?;
    let in_bounds = if allow_end { index <= len } else { index < len };
    if in_bounds {
        Ok(index)
    } else {
        Err(format!("array index {} out of bounds (len {})", index, len))
    }
}

pub(crate) fn resolve<'a>(doc: &'a Value, tokens: &[String]) -> Option<&'a Value> {
    tokens.iter().try_fold(doc, |current, token| match current {
        Value::Object(map) => map.get(token),
        Value::Array(items) => token.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn resolve_mut<'a>(doc: &'a mut Value, tokens: &[String]) -> Option<&'a mut Value> {
    tokens.iter().try_fold(doc, |current, token| match current {
        Value::Object(map) => map.get_mut(token),
        Value::Array(items) => token.parse::<usize>().ok().and_then(|i| items.get_mut(i)),
        _ => None,
    })
}

fn add(doc: &mut Value, tokens: &[String], value: Value) -> std::result::Result<(), String> {
    let Some((last, parent_tokens)) = tokens.split_last() else {
        *doc = value;
        return Ok(());
    };
    let parent = resolve_mut(doc, parent_tokens).ok_or("parent does not exist")?;
    match parent {
        Value::Object(map) => {
            map.insert(last.clone(), value);
            Ok(())
        }
        Value::Array(items) => {
            let index = array_index(last, items.len(), true)?;
            items.insert(index, value);
            Ok(())
        }
        _ => Err("parent is not a container".to_string()),
    }
}

fn remove(doc: &mut Value, tokens: &[String]) -> std::result::Result<Value, String> {
    let (last, parent_tokens) = tokens
        .split_last()
        .ok_or("cannot remove the whole document")?;
    let parent = resolve_mut(doc, parent_tokens).ok_or("parent does not exist")?;
    match parent {
        Value::Object(map) => map
            .remove(last)
            .ok_or_else(|| format!("no member {:?}", last)),
        Value::Array(items) => {
            let index = array_index(last, items.len(), false)?;
            Ok(items.remove(index))
        }
        _ => Err("parent is not a container".to_string()),
    }
}
