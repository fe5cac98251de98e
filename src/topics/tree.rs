//! The topic tree and per-topic value state.
//!
//! The tree maps paths to nodes under one `RwLock`; each node guards its
//! mutable state with its own `Mutex`, so updates to unrelated topics never
//! contend. Structural changes (add, remove) hold the tree write lock.

use super::removal::{PolicyTracker, RemovalPolicy};
use crate::delivery::UpdateEvent;
use crate::error::{AddFailureReason, EngineError, Result};
use crate::selectors::TopicSelector;
use crate::types::{
    validate_path, AddOutcome, SessionId, Sequence, Timestamp, TopicSpecification, TopicType,
};
use crate::values::{
    apply_patch, compute_delta, PatchOperation, TimeSeriesEvent, TimeSeriesLog, TopicValue,
};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Delivery progress of one subscribed session on one topic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DeliveryPhase {
    /// Subscribed; the first value will be sent in full.
    AwaitingValue,
    /// Has a value; further values are sent as deltas where possible.
    Streaming,
}

/// Subscriber key: the session and the path it knows the topic by.
pub(crate) type SubscriberKey = (SessionId, String);

pub(crate) struct TopicState {
    pub(crate) value: Option<TopicValue>,
    pub(crate) sequence: Sequence,
    pub(crate) removed: bool,
    pub(crate) series: Option<TimeSeriesLog>,
    pub(crate) subscribers: BTreeMap<SubscriberKey, DeliveryPhase>,
    pub(crate) created_at: Timestamp,
    pub(crate) last_updated: Option<Timestamp>,
    pub(crate) owner: Option<SessionId>,
    pub(crate) owner_closed: bool,
    pub(crate) removal: Option<(RemovalPolicy, PolicyTracker)>,
}

pub(crate) struct TopicNode {
    pub(crate) path: String,
    pub(crate) specification: TopicSpecification,
    pub(crate) state: Mutex<TopicState>,
}

impl TopicNode {
    fn new(
        path: String,
        specification: TopicSpecification,
        removal: Option<RemovalPolicy>,
        series: Option<TimeSeriesLog>,
        owner: Option<SessionId>,
        now: Timestamp,
    ) -> Self {
        Self {
            path,
            specification,
            state: Mutex::new(TopicState {
                value: None,
                sequence: Sequence(0),
                removed: false,
                series,
                subscribers: BTreeMap::new(),
                created_at: now,
                last_updated: None,
                owner,
                owner_closed: false,
                removal: removal.map(|policy| {
                    let tracker = policy.tracker(now);
                    (policy, tracker)
                }),
            }),
        }
    }

    pub(crate) fn topic_type(&self) -> TopicType {
        self.specification.topic_type
    }
}

impl TopicState {
    fn check_value_type(&self, path: &str, spec: &TopicSpecification, value: &TopicValue) -> Result<()> {
        let expected = match spec.topic_type {
            TopicType::TimeSeries => event_value_type(spec)?,
            TopicType::Routing => {
                return Err(EngineError::InvalidUpdate {
                    path: path.to_string(),
                    reason: "routing topics have no value".to_string(),
                })
            }
            other => other,
        };
        if value.topic_type() != expected {
            return Err(EngineError::InvalidUpdate {
                path: path.to_string(),
                reason: format!(
                    "expected a {} value, got {}",
                    expected.name(),
                    value.topic_type().name()
                ),
            });
        }
        if let TopicValue::Record(record) = value {
            if !record.is_encodable() {
                return Err(EngineError::InvalidUpdate {
                    path: path.to_string(),
                    reason: "record field contains a reserved delimiter byte".to_string(),
                });
            }
        }
        Ok(())
    }

    fn record(&mut self, spec: &TopicSpecification, path: &str, new_value: TopicValue, now: Timestamp) -> UpdateEvent {
        let retain = !spec.flag(TopicSpecification::DONT_RETAIN_VALUE);
        let old_value = if retain { self.value.take() } else { None };
        let delta = old_value
            .as_ref()
            .filter(|_| spec.topic_type.supports_delta())
            .and_then(|old| compute_delta(old, &new_value));
        self.sequence = self.sequence.next();
        self.last_updated = Some(now);
        if retain {
            self.value = Some(new_value.clone());
        }
        UpdateEvent {
            path: path.to_string(),
            topic_type: spec.topic_type,
            sequence: self.sequence,
            timestamp: now,
            old_value,
            new_value,
            delta,
        }
    }

    /// Replace the value. A time series topic appends it as an event.
    pub(crate) fn set(
        &mut self,
        node: &TopicNode,
        value: TopicValue,
        author: &str,
        now: Timestamp,
    ) -> Result<UpdateEvent> {
        if node.topic_type() == TopicType::TimeSeries {
            return self.append(node, value, author, now);
        }
        self.check_value_type(&node.path, &node.specification, &value)?;
        Ok(self.record(&node.specification, &node.path, value, now))
    }

    pub(crate) fn patch(
        &mut self,
        node: &TopicNode,
        operations: &[PatchOperation],
        now: Timestamp,
    ) -> Result<UpdateEvent> {
        if node.topic_type() != TopicType::Json {
            return Err(EngineError::InvalidUpdate {
                path: node.path.clone(),
                reason: "JSON patch requires a JSON topic".to_string(),
            });
        }
        let current = match &self.value {
            Some(TopicValue::Json(current)) => current.clone(),
            _ => serde_json::Value::Null,
        };
        let patched = apply_patch(&current, operations)?;
        Ok(self.record(&node.specification, &node.path, TopicValue::Json(patched), now))
    }

    fn series_mut(&mut self, path: &str) -> Result<&mut TimeSeriesLog> {
        self.series.as_mut().ok_or_else(|| EngineError::InvalidUpdate {
            path: path.to_string(),
            reason: "not a time series topic".to_string(),
        })
    }

    pub(crate) fn append(
        &mut self,
        node: &TopicNode,
        value: TopicValue,
        author: &str,
        timestamp: Timestamp,
    ) -> Result<UpdateEvent> {
        self.check_value_type(&node.path, &node.specification, &value)?;
        let event = self.series_mut(&node.path)?.append(value, timestamp, author)?;
        Ok(self.record_event(node, event, timestamp))
    }

    pub(crate) fn edit(
        &mut self,
        node: &TopicNode,
        sequence: Sequence,
        value: TopicValue,
        author: &str,
        now: Timestamp,
    ) -> Result<UpdateEvent> {
        self.check_value_type(&node.path, &node.specification, &value)?;
        let event = self
            .series_mut(&node.path)?
            .edit(&node.path, sequence, value, now, author)?;
        Ok(self.record_event(node, event, now))
    }

    fn record_event(&mut self, node: &TopicNode, event: TimeSeriesEvent, now: Timestamp) -> UpdateEvent {
        let timestamp = event.timestamp;
        let mut update = self.record(
            &node.specification,
            &node.path,
            TopicValue::Event(Box::new(event.clone())),
            now,
        );
        // Event sequences are the topic's sequences.
        self.sequence = event.sequence;
        update.sequence = event.sequence;
        update.timestamp = timestamp;
        update
    }
}

/// The value type of a time series topic's events.
pub(crate) fn event_value_type(spec: &TopicSpecification) -> Result<TopicType> {
    spec.property(TopicSpecification::TIME_SERIES_EVENT_VALUE_TYPE)
        .and_then(TopicType::from_name)
        .filter(|t| !matches!(t, TopicType::TimeSeries | TopicType::Routing))
        .ok_or_else(|| {
            EngineError::InvalidUpdate {
                path: String::new(),
                reason: "time series topic needs a valid event value type".to_string(),
            }
        })
}

fn retained_range(spec: &TopicSpecification, default: usize) -> std::result::Result<usize, String> {
    match spec.property(TopicSpecification::TIME_SERIES_RETAINED_RANGE) {
        None => Ok(default),
        Some(range) => {
            let digits = range.trim().trim_start_matches("limit").trim();
            digits
                .parse::<usize>()
                .map_err(|_| format!("invalid retained range '{}'", range))
        }
    }
}

/// Map of paths to topics.
#[derive(Default)]
pub(crate) struct TopicMap {
    topics: BTreeMap<String, Arc<TopicNode>>,
}

impl TopicMap {
    pub(crate) fn get(&self, path: &str) -> Option<&Arc<TopicNode>> {
        self.topics.get(path)
    }

    pub(crate) fn len(&self) -> usize {
        self.topics.len()
    }

    /// Topics matched by `selector`, in path order.
    pub(crate) fn matching(&self, selector: &TopicSelector) -> Vec<Arc<TopicNode>> {
        let prefix = selector.path_prefix();
        self.topics
            .range::<str, _>((std::ops::Bound::Included(prefix.as_str()), std::ops::Bound::Unbounded))
            .take_while(|(path, _)| path.starts_with(prefix.as_str()))
            .filter(|(path, _)| selector.matches(path))
            .map(|(_, node)| Arc::clone(node))
            .collect()
    }

    /// Create a topic or confirm an identical one exists.
    pub(crate) fn add(
        &mut self,
        path: &str,
        specification: &TopicSpecification,
        owner: Option<SessionId>,
        retained_events: usize,
        now: Timestamp,
    ) -> Result<(AddOutcome, Arc<TopicNode>)> {
        let failed = |reason: AddFailureReason| EngineError::TopicAddFailed {
            path: path.to_string(),
            reason,
        };
        if !validate_path(path) {
            return Err(failed(AddFailureReason::InvalidPath));
        }
        if let Some(existing) = self.topics.get(path) {
            if existing.specification.topic_type != specification.topic_type {
                return Err(EngineError::IncompatibleTopicExists {
                    path: path.to_string(),
                    existing: existing.specification.topic_type,
                });
            }
            if existing.specification != *specification {
                return Err(failed(AddFailureReason::ExistsMismatch));
            }
            return Ok((AddOutcome::Exists, Arc::clone(existing)));
        }

        let removal = specification
            .property(TopicSpecification::REMOVAL)
            .map(RemovalPolicy::parse)
            .transpose()
            .map_err(|e| failed(AddFailureReason::InvalidDetails(e.to_string())))?;

        let series = if specification.topic_type == TopicType::TimeSeries {
            event_value_type(specification)
                .map_err(|e| failed(AddFailureReason::InvalidDetails(e.to_string())))?;
            let retained = retained_range(specification, retained_events)
                .map_err(|e| failed(AddFailureReason::InvalidDetails(e)))?;
            Some(TimeSeriesLog::new(retained))
        } else {
            None
        };

        let node = Arc::new(TopicNode::new(
            path.to_string(),
            specification.clone(),
            removal,
            series,
            owner,
            now,
        ));
        self.topics.insert(path.to_string(), Arc::clone(&node));
        Ok((AddOutcome::Created, node))
    }

    pub(crate) fn remove(&mut self, path: &str) -> Option<Arc<TopicNode>> {
        self.topics.remove(path)
    }

    pub(crate) fn paths(&self) -> impl Iterator<Item = &String> {
        self.topics.keys()
    }

    pub(crate) fn nodes(&self) -> impl Iterator<Item = &Arc<TopicNode>> {
        self.topics.values()
    }
}

/// The shared topic tree.
#[derive(Default)]
pub(crate) struct TopicTree {
    map: RwLock<TopicMap>,
}

impl TopicTree {
    pub(crate) fn read(&self) -> RwLockReadGuard<'_, TopicMap> {
        self.map.read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, TopicMap> {
        self.map.write()
    }

    pub(crate) fn get(&self, path: &str) -> Option<Arc<TopicNode>> {
        self.map.read().get(path).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::values::RecordValue;

    fn add(map: &mut TopicMap, path: &str, spec: &TopicSpecification) -> Result<AddOutcome> {
        map.add(path, spec, None, 100, Timestamp(0)).map(|(outcome, _)| outcome)
    }

    #[test]
    fn test_add_is_idempotent_for_identical_spec() {
        let mut map = TopicMap::default();
        let spec = TopicSpecification::new(TopicType::String);
        assert_eq!(add(&mut map, "a/b", &spec).unwrap(), AddOutcome::Created);
        assert_eq!(add(&mut map, "a/b", &spec).unwrap(), AddOutcome::Exists);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_add_conflicts() {
        let mut map = TopicMap::default();
        add(&mut map, "a", &TopicSpecification::new(TopicType::String)).unwrap();
        assert!(matches!(
            add(&mut map, "a", &TopicSpecification::new(TopicType::Json)),
            Err(EngineError::IncompatibleTopicExists { existing: TopicType::String, .. })
        ));
        assert!(matches!(
            add(
                &mut map,
                "a",
                &TopicSpecification::new(TopicType::String).with_property("X", "1")
            ),
            Err(EngineError::TopicAddFailed { reason: AddFailureReason::ExistsMismatch, .. })
        ));
        assert!(matches!(
            add(&mut map, "a//b", &TopicSpecification::new(TopicType::String)),
            Err(EngineError::TopicAddFailed { reason: AddFailureReason::InvalidPath, .. })
        ));
    }

    #[test]
    fn test_time_series_needs_event_type() {
        let mut map = TopicMap::default();
        assert!(add(&mut map, "ts", &TopicSpecification::new(TopicType::TimeSeries)).is_err());
        let spec = TopicSpecification::new(TopicType::TimeSeries)
            .with_property(TopicSpecification::TIME_SERIES_EVENT_VALUE_TYPE, "string")
            .with_property(TopicSpecification::TIME_SERIES_RETAINED_RANGE, "limit 5");
        assert_eq!(add(&mut map, "ts", &spec).unwrap(), AddOutcome::Created);
    }

    #[test]
    fn test_matching_uses_prefix_range() {
        let mut map = TopicMap::default();
        let spec = TopicSpecification::new(TopicType::String);
        for path in ["FX", "FX/GBP/USD", "FX/EUR/USD", "FXO", "Rates/GBP"] {
            add(&mut map, path, &spec).unwrap();
        }
        let selector: TopicSelector = "?FX//".parse().unwrap();
        let paths: Vec<String> = map.matching(&selector).iter().map(|n| n.path.clone()).collect();
        assert_eq!(paths, vec!["FX", "FX/EUR/USD", "FX/GBP/USD"]);
    }

    #[test]
    fn test_set_computes_delta_after_first_value() {
        let mut map = TopicMap::default();
        let (_, node) = map
            .add("r", &TopicSpecification::new(TopicType::Record), None, 10, Timestamp(0))
            .unwrap();
        let mut state = node.state.lock();
        let first = state
            .set(&node, TopicValue::Record(RecordValue::new().with("Bid", "1")), "p", Timestamp(1))
            .unwrap();
        assert!(first.delta.is_none());
        let second = state
            .set(&node, TopicValue::Record(RecordValue::new().with("Bid", "2")), "p", Timestamp(2))
            .unwrap();
        assert!(second.delta.is_some());
        assert_eq!(second.sequence, Sequence(2));
        assert!(state.set(&node, TopicValue::string("x"), "p", Timestamp(3)).is_err());
    }
}
