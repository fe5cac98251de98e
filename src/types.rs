//! Core types shared across the engine.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Opaque identifier for a session.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Per-topic update counter, also used for time series event numbering.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Sequence(pub u64);

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq({})", self.0)
    }
}

impl Sequence {
    pub fn next(self) -> Self {
        Sequence(self.0 + 1)
    }

    pub fn prev(self) -> Option<Self> {
        if self.0 > 0 {
            Some(Sequence(self.0 - 1))
        } else {
            None
        }
    }
}

/// Milliseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn plus(self, duration: std::time::Duration) -> Self {
        Timestamp(self.0.saturating_add(duration.as_millis() as i64))
    }

    /// Time elapsed since `earlier`, zero if `earlier` is in the future.
    pub fn since(self, earlier: Timestamp) -> std::time::Duration {
        std::time::Duration::from_millis(self.0.saturating_sub(earlier.0).max(0) as u64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// The closed set of topic types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicType {
    String,
    Binary,
    Int64,
    Double,
    Json,
    Record,
    TimeSeries,
    Routing,
}

impl TopicType {
    /// Whether successive values are sent as structural deltas.
    pub fn supports_delta(self) -> bool {
        matches!(self, TopicType::Json | TopicType::Record)
    }

    /// Whether values of this type can be read as JSON by a subscriber.
    pub fn is_json_compatible(self) -> bool {
        matches!(
            self,
            TopicType::Json | TopicType::String | TopicType::Int64 | TopicType::Double
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            TopicType::String => "string",
            TopicType::Binary => "binary",
            TopicType::Int64 => "int64",
            TopicType::Double => "double",
            TopicType::Json => "json",
            TopicType::Record => "record",
            TopicType::TimeSeries => "time_series",
            TopicType::Routing => "routing",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name.to_ascii_lowercase().as_str() {
            "string" => TopicType::String,
            "binary" => TopicType::Binary,
            "int64" => TopicType::Int64,
            "double" => TopicType::Double,
            "json" => TopicType::Json,
            "record" => TopicType::Record,
            "time_series" => TopicType::TimeSeries,
            "routing" => TopicType::Routing,
            _ => return None,
        })
    }
}

/// Restricts a subscription or stream to certain topic types.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum TypeFilter {
    /// Every topic type.
    #[default]
    Any,
    /// Only the listed types.
    Only(Vec<TopicType>),
    /// Types whose values read as JSON.
    JsonCompatible,
}

impl TypeFilter {
    pub fn accepts(&self, topic_type: TopicType) -> bool {
        match self {
            TypeFilter::Any => true,
            TypeFilter::Only(types) => types.contains(&topic_type),
            TypeFilter::JsonCompatible => topic_type.is_json_compatible(),
        }
    }
}

/// Type and properties of a topic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicSpecification {
    pub topic_type: TopicType,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl TopicSpecification {
    /// Removal policy expression.
    pub const REMOVAL: &'static str = "REMOVAL";
    /// Value type of the events of a time series topic.
    pub const TIME_SERIES_EVENT_VALUE_TYPE: &'static str = "TIME_SERIES_EVENT_VALUE_TYPE";
    /// Number of events a time series topic retains.
    pub const TIME_SERIES_RETAINED_RANGE: &'static str = "TIME_SERIES_RETAINED_RANGE";
    /// Do not keep the latest value; subscribers only see live updates.
    pub const DONT_RETAIN_VALUE: &'static str = "DONT_RETAIN_VALUE";

    pub fn new(topic_type: TopicType) -> Self {
        Self {
            topic_type,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn flag(&self, key: &str) -> bool {
        self.property(key)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }
}

/// Whether an add created a topic or found a matching one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddOutcome {
    Created,
    Exists,
}

/// Lifecycle state of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Connecting,
    ConnectedActive,
    RecoveringReconnect,
    ClosedByServer,
    ClosedByClient,
    ClosedFailed,
}

impl SessionState {
    pub fn is_closed(self) -> bool {
        matches!(
            self,
            SessionState::ClosedByServer | SessionState::ClosedByClient | SessionState::ClosedFailed
        )
    }

    pub fn is_connected(self) -> bool {
        self == SessionState::ConnectedActive
    }
}

/// Validate a topic path: non-empty, no leading/trailing slash, no empty segments.
pub fn validate_path(path: &str) -> bool {
    !path.is_empty() && path.split('/').all(|segment| !segment.is_empty())
}

/// Number of segments in a path.
pub fn path_depth(path: &str) -> usize {
    path.split('/').count()
}

/// Whether `path` is `ancestor` or lies beneath it.
pub fn is_in_branch(path: &str, ancestor: &str) -> bool {
    path == ancestor
        || (path.len() > ancestor.len()
            && path.starts_with(ancestor)
            && path.as_bytes()[ancestor.len()] == b'/')
}
