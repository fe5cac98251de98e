//! Property tests for deltas, paging and conflation.

use arbor::{
    compute_delta, Delta, Engine, EngineConfig, FetchRequest, FieldChange, ManualClock, RecordDelta,
    RecordValue, Sequence, SessionOptions, StreamEvent, Timestamp, TopicSpecification, TopicType,
    TopicValue, TypeFilter, UpdateConstraint, ValueStreams,
};
use proptest::prelude::*;
use serde_json::Value;
use std::sync::{Arc, Mutex};

const FIELDS: [&str; 3] = ["Ask", "Bid", "Venue"];

fn record() -> impl Strategy<Value = RecordValue> {
    prop::collection::vec("[a-z0-9.]{0,3}", FIELDS.len()).prop_map(|values| {
        FIELDS
            .iter()
            .zip(values)
            .fold(RecordValue::new(), |r, (name, value)| r.with(*name, value))
    })
}

fn json_leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        (-50i64..50).prop_map(Value::from),
        "[a-z]{0,4}".prop_map(Value::String),
    ]
}

fn json_object() -> impl Strategy<Value = Value> {
    let nested = json_leaf().prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[ab/~]{1,2}", inner, 0..4)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    });
    prop::collection::btree_map("[ab/~]{1,2}", nested, 0..5)
        .prop_map(|m| Value::Object(m.into_iter().collect()))
}

proptest! {
    #[test]
    fn test_record_delta_applies_to_base(old in record(), new in record()) {
        let delta = RecordDelta::between(&old, &new).unwrap();
        prop_assert_eq!(delta.apply(&old).unwrap(), new.clone());

        let names: Vec<String> = FIELDS.iter().map(|s| s.to_string()).collect();
        let decoded = RecordDelta::decode(&delta.encode(), &names).unwrap();
        prop_assert_eq!(&decoded, &delta);

        for ((name, change), field) in delta.fields.iter().zip(FIELDS) {
            prop_assert_eq!(name.as_str(), field);
            let same = old.get(field) == new.get(field);
            prop_assert_eq!(*change == FieldChange::Unchanged, same);
        }
    }

    #[test]
    fn test_json_delta_applies_to_base(old in json_object(), new in json_object()) {
        let old = TopicValue::Json(old);
        let new = TopicValue::Json(new);
        let delta = compute_delta(&old, &new).unwrap();
        prop_assert_eq!(delta.is_empty(), old == new);
        prop_assert_eq!(delta.apply(&old).unwrap(), new);
    }

    #[test]
    fn test_paging_partitions_the_range(
        paths in prop::collection::btree_set("[a-c]{1,2}(/[a-c]{1,2}){0,2}", 0..30),
        page in 1usize..7,
    ) {
        let all: Vec<String> = paths.into_iter().collect();
        let mut seen: Vec<String> = Vec::new();
        let mut request = FetchRequest::new().first(page);
        loop {
            let (items, has_more) = request.select(all.clone(), |p| p.as_str());
            prop_assert!(items.len() <= page);
            seen.extend(items.iter().cloned());
            match items.last() {
                Some(last) if has_more => request = FetchRequest::new().after(last.clone()).first(page),
                _ => break,
            }
        }
        prop_assert_eq!(seen, all);
    }

    #[test]
    fn test_conflated_stream_never_regresses(
        updates in prop::collection::vec((record(), any::<bool>()), 1..25),
    ) {
        let clock = ManualClock::new(Timestamp(0));
        let engine = Engine::with_clock(EngineConfig::default(), Arc::new(clock));
        let publisher = engine.open_session(SessionOptions::new("publisher")).unwrap();
        let client = engine.open_session(SessionOptions::new("client")).unwrap();
        engine
            .add_and_set(
                publisher,
                "q",
                &TopicSpecification::new(TopicType::Record),
                TopicValue::Record(RecordValue::new().with("Ask", "").with("Bid", "").with("Venue", "")),
                &UpdateConstraint::Unconstrained,
            )
            .unwrap();
        engine.subscribe(client, "q").wait().unwrap();
        engine.set_conflated(client, true).unwrap();

        let sequences: Arc<Mutex<Vec<Sequence>>> = Arc::default();
        let mut streams = ValueStreams::new();
        let log = Arc::clone(&sequences);
        streams.add_fallback_stream(TypeFilter::Any, move |event: &StreamEvent| {
            if let StreamEvent::Value { sequence, .. } = event {
                log.lock().unwrap().push(*sequence);
            }
        });

        let mut last = None;
        for (value, drain) in updates {
            let value = TopicValue::Record(value);
            engine.set(publisher, "q", value.clone(), &UpdateConstraint::Unconstrained).unwrap();
            last = Some(value);
            if drain {
                for delivery in engine.drain(client).unwrap() {
                    streams.apply(delivery).unwrap();
                }
            }
        }
        for delivery in engine.drain(client).unwrap() {
            streams.apply(delivery).unwrap();
        }

        prop_assert_eq!(streams.value("q"), last.as_ref());
        let seen = sequences.lock().unwrap();
        prop_assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }
}

#[test]
fn test_delta_of_different_shapes_is_full() {
    let old = TopicValue::Record(RecordValue::new().with("A", "1"));
    let new = TopicValue::Record(RecordValue::new().with("B", "1"));
    assert!(compute_delta(&old, &new).is_none());
    assert!(compute_delta(&TopicValue::Int64(1), &TopicValue::Int64(2)).is_none());
    assert!(matches!(
        compute_delta(&TopicValue::json(serde_json::json!({})), &TopicValue::json(serde_json::json!({"a": 1}))),
        Some(Delta::Json(ops)) if ops.len() == 1
    ));
}
