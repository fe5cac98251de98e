//! Delta computation between successive topic values.

use super::patch::{apply_patch, escape_token, PatchOperation};
use super::value::{RecordValue, TopicValue, EMPTY_FIELD_MARKER, FIELD_DELIMITER};
use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Change to one record field.
///
/// `Changed(String::new())` is "changed to empty" and is never the same
/// thing as `Unchanged`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldChange {
    Unchanged,
    Changed(String),
}

/// Field-level delta between two records with the same field names.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordDelta {
    /// One entry per field, in field-name order.
    pub fields: Vec<(String, FieldChange)>,
}

impl RecordDelta {
    /// Delta from `old` to `new`, or `None` if the field sets differ.
    pub fn between(old: &RecordValue, new: &RecordValue) -> Option<Self> {
        if !old.fields.keys().eq(new.fields.keys()) {
            return None;
        }

        let fields = new
            .fields
            .iter()
            .map(|(name, value)| {
                let change = if old.fields.get(name) == Some(value) {
                    FieldChange::Unchanged
                } else {
                    FieldChange::Changed(value.clone())
                };
                (name.clone(), change)
            })
            .collect();

        Some(Self { fields })
    }

    /// Names and new values of the fields that changed.
    pub fn changed_fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().filter_map(|(name, change)| match change {
            FieldChange::Changed(value) => Some((name.as_str(), value.as_str())),
            FieldChange::Unchanged => None,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.fields
            .iter()
            .all(|(_, change)| *change == FieldChange::Unchanged)
    }

    pub fn apply(&self, base: &RecordValue) -> Result<RecordValue> {
        if !base
            .fields
            .keys()
            .eq(self.fields.iter().map(|(name, _)| name))
        {
            return Err(EngineError::InvalidUpdate {
                path: String::new(),
                reason: "record delta does not match the base record's fields".to_string(),
            });
        }

        let mut result = base.clone();
        for (name, change) in &self.fields {
            if let FieldChange::Changed(value) = change {
                result.set(name.clone(), value.clone());
            }
        }
        Ok(result)
    }

    /// Wire form: fields joined by `0x02`; an unchanged field is empty and a
    /// field changed to empty is the single byte `0x03`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (i, (_, change)) in self.fields.iter().enumerate() {
            if i > 0 {
                out.push(FIELD_DELIMITER);
            }
            match change {
                FieldChange::Unchanged => {}
                FieldChange::Changed(value) if value.is_empty() => out.push(EMPTY_FIELD_MARKER),
                FieldChange::Changed(value) => out.extend_from_slice(value.as_bytes()),
            }
        }
        out
    }

    /// Inverse of [`RecordDelta::encode`], given the record's field names.
    pub fn decode(bytes: &[u8], field_names: &[String]) -> Result<Self> {
        if field_names.is_empty() {
            return if bytes.is_empty() {
                Ok(Self { fields: Vec::new() })
            } else {
                Err(EngineError::Deserialization(
                    "record delta has data but the record has no fields".to_string(),
                ))
            };
        }

        let segments: Vec<&[u8]> = bytes.split(|b| *b == FIELD_DELIMITER).collect();
        if segments.len() != field_names.len() {
            return Err(EngineError::Deserialization(format!(
                "record delta has {} fields, expected {}",
                segments.len(),
                field_names.len()
            )));
        }

        let fields = field_names
            .iter()
            .zip(segments)
            .map(|(name, segment)| -> Result<(String, FieldChange)> {
                let change = match segment {
                    [] => FieldChange::Unchanged,
                    [EMPTY_FIELD_MARKER] => FieldChange::Changed(String::new()),
                    bytes => FieldChange::Changed(
                        String::from_utf8(bytes.to_vec())
                            .map_err(|e| EngineError::Deserialization(e.to_string()))?,
                    ),
                };
                Ok((name.clone(), change))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { fields })
    }
}

/// A structural difference between two values of the same topic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Delta {
    Record(RecordDelta),
    Json(Vec<PatchOperation>),
}

impl Delta {
    /// Apply to the value the delta was computed against.
    pub fn apply(&self, base: &TopicValue) -> Result<TopicValue> {
        match (self, base) {
            (Delta::Record(delta), TopicValue::Record(record)) => {
                Ok(TopicValue::Record(delta.apply(record)?))
            }
            (Delta::Json(ops), TopicValue::Json(value)) => {
                Ok(TopicValue::Json(apply_patch(value, ops)?))
            }
            _ => Err(EngineError::InvalidUpdate {
                path: String::new(),
                reason: format!(
                    "cannot apply delta to a {} value",
                    base.topic_type().name()
                ),
            }),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Delta::Record(delta) => delta.is_empty(),
            Delta::Json(ops) => ops.is_empty(),
        }
    }
}

/// Delta between two successive values, if their type supports one.
///
/// Scalars and binary values are always replaced in full.
pub fn compute_delta(old: &TopicValue, new: &TopicValue) -> Option<Delta> {
    match (old, new) {
        (TopicValue::Record(old), TopicValue::Record(new)) => {
            RecordDelta::between(old, new).map(Delta::Record)
        }
        (TopicValue::Json(old), TopicValue::Json(new)) => Some(Delta::Json(diff_json(old, new))),
        _ => None,
    }
}

/// Patch operations that turn `old` into `new`.
pub fn diff_json(old: &Value, new: &Value) -> Vec<PatchOperation> {
    let mut ops = Vec::new();
    diff_into(old, new, String::new(), &mut ops);
    ops
}

fn diff_into(old: &Value, new: &Value, pointer: String, ops: &mut Vec<PatchOperation>) {
    if old == new {
        return;
    }

    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            for key in old_map.keys().filter(|k| !new_map.contains_key(*k)) {
                ops.push(PatchOperation::Remove {
                    path: format!("{}/{}", pointer, escape_token(key)),
                });
            }
            for (key, new_value) in new_map {
                let child = format!("{}/{}", pointer, escape_token(key));
                match old_map.get(key) {
                    Some(old_value) => diff_into(old_value, new_value, child, ops),
                    None => ops.push(PatchOperation::Add {
                        path: child,
                        value: new_value.clone(),
                    }),
                }
            }
        }
        (Value::Array(old_items), Value::Array(new_items)) if old_items.len() == new_items.len() => {
            for (i, (old_item, new_item)) in old_items.iter().zip(new_items).enumerate() {
                diff_into(old_item, new_item, format!("{}/{}", pointer, i), ops);
            }
        }
        _ => ops.push(PatchOperation::Replace {
            path: pointer,
            value: new.clone(),
        }),
    }
}
