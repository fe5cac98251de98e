//! Client-side value streams.
//!
//! [`ValueStreams`] consumes a session's deliveries, keeps the latest value
//! of each subscribed topic (rebuilding full values from deltas) and routes
//! events to streams. A topic claimed by any specific stream never reaches
//! the fallback streams.

use crate::delivery::{Delivery, Payload, UnsubscribeReason};
use crate::error::{EngineError, Result};
use crate::selectors::TopicSelector;
use crate::types::{Sequence, TopicSpecification, TypeFilter};
use crate::values::TopicValue;
use std::collections::HashMap;

/// An event seen by a value stream.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    Subscribed {
        path: String,
        specification: TopicSpecification,
    },
    Value {
        path: String,
        sequence: Sequence,
        old_value: Option<TopicValue>,
        new_value: TopicValue,
    },
    Unsubscribed {
        path: String,
        reason: UnsubscribeReason,
    },
}

impl StreamEvent {
    pub fn path(&self) -> &str {
        match self {
            StreamEvent::Subscribed { path, .. }
            | StreamEvent::Value { path, .. }
            | StreamEvent::Unsubscribed { path, .. } => path,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamId(pub u64);

type Handler = Box<dyn FnMut(&StreamEvent) + Send>;

struct Stream {
    id: StreamId,
    /// `None` for a fallback stream.
    selector: Option<TopicSelector>,
    filter: TypeFilter,
    handler: Handler,
}

struct CachedTopic {
    specification: TopicSpecification,
    value: Option<TopicValue>,
}

#[derive(Default)]
pub struct ValueStreams {
    streams: Vec<Stream>,
    topics: HashMap<String, CachedTopic>,
    next_id: u64,
}

impl ValueStreams {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, selector: Option<TopicSelector>, filter: TypeFilter, handler: Handler) -> StreamId {
        self.next_id += 1;
        let id = StreamId(self.next_id);
        self.streams.push(Stream {
            id,
            selector,
            filter,
            handler,
        });
        id
    }

    /// A stream for topics matching `selector`.
    pub fn add_stream(
        &mut self,
        selector: TopicSelector,
        filter: TypeFilter,
        handler: impl FnMut(&StreamEvent) + Send + 'static,
    ) -> StreamId {
        self.push(Some(selector), filter, Box::new(handler))
    }

    /// A stream for topics no specific stream claims.
    pub fn add_fallback_stream(
        &mut self,
        filter: TypeFilter,
        handler: impl FnMut(&StreamEvent) + Send + 'static,
    ) -> StreamId {
        self.push(None, filter, Box::new(handler))
    }

    pub fn remove_stream(&mut self, id: StreamId) -> bool {
        let before = self.streams.len();
        self.streams.retain(|s| s.id != id);
        self.streams.len() != before
    }

    pub fn value(&self, path: &str) -> Option<&TopicValue> {
        self.topics.get(path).and_then(|t| t.value.as_ref())
    }

    pub fn is_subscribed(&self, path: &str) -> bool {
        self.topics.contains_key(path)
    }

    /// Apply one delivery and dispatch the resulting event.
    pub fn apply(&mut self, delivery: Delivery) -> Result<()> {
        let (specification, event) = match delivery {
            Delivery::Subscription {
                path,
                specification,
            } => {
                self.topics.insert(
                    path.clone(),
                    CachedTopic {
                        specification: specification.clone(),
                        value: None,
                    },
                );
                let event = StreamEvent::Subscribed {
                    path,
                    specification: specification.clone(),
                };
                (specification, event)
            }
            Delivery::Value {
                path,
                sequence,
                payload,
                ..
            } => {
                let cached = self
                    .topics
                    .get_mut(&path)
                    .ok_or_else(|| EngineError::InvalidOperation(format!("value for unsubscribed topic '{}'", path)))?;
                let new_value = match payload {
                    Payload::Full(value) => value,
                    Payload::Delta(delta) => {
                        let base = cached.value.as_ref().ok_or_else(|| EngineError::InvalidUpdate {
                            path: path.clone(),
                            reason: "delta received before any value".to_string(),
                        })?;
                        delta.apply(base)?
                    }
                };
                let old_value = cached.value.replace(new_value.clone());
                let event = StreamEvent::Value {
                    path,
                    sequence,
                    old_value,
                    new_value,
                };
                (cached.specification.clone(), event)
            }
            Delivery::Unsubscription { path, reason } => {
                let cached = self
                    .topics
                    .remove(&path)
                    .ok_or_else(|| EngineError::InvalidOperation(format!("not subscribed to '{}'", path)))?;
                (cached.specification, StreamEvent::Unsubscribed { path, reason })
            }
        };
        self.dispatch(&specification, &event);
        Ok(())
    }

    fn dispatch(&mut self, specification: &TopicSpecification, event: &StreamEvent) {
        let path = event.path();
        let topic_type = specification.topic_type;
        let claimed = self.streams.iter().any(|s| {
            s.selector.as_ref().is_some_and(|sel| sel.matches(path)) && s.filter.accepts(topic_type)
        });
        for stream in &mut self.streams {
            let eligible = match &stream.selector {
                Some(selector) => claimed && selector.matches(path),
                None => !claimed,
            };
            if eligible && stream.filter.accepts(topic_type) {
                (stream.handler)(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Timestamp, TopicType};
    use crate::values::{compute_delta, RecordValue};
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<String>>>;

    fn recorder(log: &Log, name: &'static str) -> impl FnMut(&StreamEvent) + Send + 'static {
        let log = Arc::clone(log);
        move |event: &StreamEvent| log.lock().unwrap().push(format!("{}:{}", name, event.path()))
    }

    fn subscription(path: &str, topic_type: TopicType) -> Delivery {
        Delivery::Subscription {
            path: path.to_string(),
            specification: TopicSpecification::new(topic_type),
        }
    }

    #[test]
    fn test_specific_stream_takes_precedence() {
        let log: Log = Arc::default();
        let mut streams = ValueStreams::new();
        streams.add_stream("a/b".parse().unwrap(), TypeFilter::Any, recorder(&log, "specific"));
        streams.add_fallback_stream(TypeFilter::Any, recorder(&log, "fallback"));

        streams.apply(subscription("a/b", TopicType::String)).unwrap();
        streams.apply(subscription("a/c", TopicType::String)).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["specific:a/b", "fallback:a/c"]);
    }

    #[test]
    fn test_type_filter_limits_claim() {
        let log: Log = Arc::default();
        let mut streams = ValueStreams::new();
        streams.add_stream(
            "?a//".parse().unwrap(),
            TypeFilter::Only(vec![TopicType::Json]),
            recorder(&log, "json"),
        );
        streams.add_fallback_stream(TypeFilter::Any, recorder(&log, "fallback"));
        streams.apply(subscription("a/s", TopicType::String)).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["fallback:a/s"]);
    }

    #[test]
    fn test_deltas_rebuild_values() {
        let mut streams = ValueStreams::new();
        streams.apply(subscription("r", TopicType::Record)).unwrap();
        let v1 = TopicValue::Record(RecordValue::new().with("Bid", "1").with("Ask", "2"));
        let v2 = TopicValue::Record(RecordValue::new().with("Bid", "3").with("Ask", "2"));
        streams
            .apply(Delivery::Value {
                path: "r".into(),
                sequence: Sequence(1),
                timestamp: Timestamp(0),
                payload: Payload::Full(v1.clone()),
            })
            .unwrap();
        streams
            .apply(Delivery::Value {
                path: "r".into(),
                sequence: Sequence(2),
                timestamp: Timestamp(0),
                payload: Payload::Delta(compute_delta(&v1, &v2).unwrap()),
            })
            .unwrap();
        assert_eq!(streams.value("r"), Some(&v2));

        streams
            .apply(Delivery::Unsubscription {
                path: "r".into(),
                reason: UnsubscribeReason::Removal,
            })
            .unwrap();
        assert!(!streams.is_subscribed("r"));
    }

    #[test]
    fn test_delta_without_base_rejected() {
        let mut streams = ValueStreams::new();
        streams.apply(subscription("r", TopicType::Record)).unwrap();
        let v1 = TopicValue::Record(RecordValue::new().with("Bid", "1"));
        let v2 = TopicValue::Record(RecordValue::new().with("Bid", "2"));
        let result = streams.apply(Delivery::Value {
            path: "r".into(),
            sequence: Sequence(1),
            timestamp: Timestamp(0),
            payload: Payload::Delta(compute_delta(&v1, &v2).unwrap()),
        });
        assert!(result.is_err());
    }
}
