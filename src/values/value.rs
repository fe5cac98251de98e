//! Topic value representation.

use super::timeseries::TimeSeriesEvent;
use crate::types::TopicType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Field delimiter inside an encoded record delta.
pub(crate) const FIELD_DELIMITER: u8 = 0x02;

/// Marker for "changed to empty" inside an encoded record delta.
pub(crate) const EMPTY_FIELD_MARKER: u8 = 0x03;

/// A record: named string fields.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordValue {
    pub fields: BTreeMap<String, String>,
}

impl RecordValue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(name.into(), value.into());
    }

    /// Field values may not contain the delta delimiter or empty marker.
    pub fn is_encodable(&self) -> bool {
        self.fields.values().all(|v| {
            !v.as_bytes()
                .iter()
                .any(|b| *b == FIELD_DELIMITER || *b == EMPTY_FIELD_MARKER)
        })
    }
}

/// The current value of a topic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TopicValue {
    String(String),
    Int64(i64),
    Double(f64),
    Binary(Vec<u8>),
    Json(serde_json::Value),
    Record(RecordValue),
    /// A time series event; the value of a time series topic.
    Event(Box<TimeSeriesEvent>),
}

impl TopicValue {
    pub fn string(value: impl Into<String>) -> Self {
        TopicValue::String(value.into())
    }

    pub fn json(value: serde_json::Value) -> Self {
        TopicValue::Json(value)
    }

    /// The topic type that naturally holds this value.
    pub fn topic_type(&self) -> TopicType {
        match self {
            TopicValue::String(_) => TopicType::String,
            TopicValue::Int64(_) => TopicType::Int64,
            TopicValue::Double(_) => TopicType::Double,
            TopicValue::Binary(_) => TopicType::Binary,
            TopicValue::Json(_) => TopicType::Json,
            TopicValue::Record(_) => TopicType::Record,
            TopicValue::Event(_) => TopicType::TimeSeries,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            TopicValue::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&RecordValue> {
        match self {
            TopicValue::Record(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_event(&self) -> Option<&TimeSeriesEvent> {
        match self {
            TopicValue::Event(e) => Some(e),
            _ => None,
        }
    }
}
