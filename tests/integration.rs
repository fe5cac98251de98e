//! Integration tests for the topic engine.

use arbor::{
    AuthDecision, Credentials, Delivery, Delta, Engine, EngineConfig, EngineError, FetchRequest,
    LockScope, ManualClock, MissingTopicNotification, Payload, QueueConfig, QueueEvent, RangeQuery,
    RecordValue, SessionId, SessionOptions, SessionProperties, SessionState, StreamEvent, Timestamp,
    TopicEventKind, TopicNotificationKind, TopicPermission, TopicSelector, TopicSpecification,
    TopicType, TopicValue, TypeFilter, UnsubscribeReason, UpdateConstraint, ValueStreams,
};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn test_engine(config: EngineConfig) -> (Arc<Engine>, ManualClock) {
    // Set RUST_LOG=arbor=debug to see engine logs; only the first call installs.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let clock = ManualClock::new(Timestamp(1_700_000_000_000));
    let engine = Engine::with_clock(config, Arc::new(clock.clone()));
    (engine, clock)
}

fn open(engine: &Engine, principal: &str) -> SessionId {
    engine.open_session(SessionOptions::new(principal)).unwrap()
}

fn price(bid: &str, ask: &str) -> TopicValue {
    TopicValue::Record(RecordValue::new().with("Bid", bid).with("Ask", ask))
}

fn string_spec() -> TopicSpecification {
    TopicSpecification::new(TopicType::String)
}

const NONE: &UpdateConstraint = &UpdateConstraint::Unconstrained;

// --- End-to-end ---

#[test]
fn test_fx_price_workflow() {
    let (engine, _) = test_engine(EngineConfig::default());
    let publisher = open(&engine, "publisher");
    let client = open(&engine, "client");

    engine
        .add_and_set(
            publisher,
            "FX/GBP/USD",
            &TopicSpecification::new(TopicType::Record),
            price("1.2500", "1.2505"),
            NONE,
        )
        .unwrap();

    assert_eq!(engine.subscribe(client, "?FX//").wait().unwrap(), 1);
    let deliveries = engine.poll(client).unwrap();
    assert_eq!(deliveries.len(), 2);
    assert!(matches!(
        &deliveries[0],
        Delivery::Subscription { path, specification } if path == "FX/GBP/USD" && specification.topic_type == TopicType::Record
    ));
    match &deliveries[1] {
        Delivery::Value { payload: Payload::Full(value), .. } => {
            assert_eq!(value, &price("1.2500", "1.2505"))
        }
        other => panic!("expected a full value, got {:?}", other),
    }

    // Constrained on the prior value
    let constraint = UpdateConstraint::ValueIs(price("1.2500", "1.2505"));
    engine
        .set(publisher, "FX/GBP/USD", price("1.2510", "1.2505"), &constraint)
        .unwrap();
    let deliveries = engine.poll(client).unwrap();
    assert_eq!(deliveries.len(), 1);
    match &deliveries[0] {
        Delivery::Value { payload: Payload::Delta(Delta::Record(delta)), .. } => {
            let changed: Vec<(&str, &str)> = delta.changed_fields().collect();
            assert_eq!(changed, vec![("Bid", "1.2510")]);
        }
        other => panic!("expected a record delta, got {:?}", other),
    }

    // Same constraint again no longer holds
    let result = engine.set(publisher, "FX/GBP/USD", price("1.2520", "1.2505"), &constraint);
    assert!(matches!(result, Err(EngineError::ConstraintUnsatisfied(_))));
    assert!(engine.poll(client).unwrap().is_empty());
}

// --- Topic tree ---

#[test]
fn test_exact_removal_does_not_cascade() {
    let (engine, _) = test_engine(EngineConfig::default());
    let session = open(&engine, "control");
    for path in ["a/b", "a/b/c"] {
        engine.add_topic(session, path, &string_spec()).unwrap();
    }

    assert_eq!(engine.remove_topics(session, "a/b").unwrap(), 1);
    assert!(engine.topic("a/b").is_none());
    assert!(engine.topic("a/b/c").is_some());

    engine.add_topic(session, "a/b", &string_spec()).unwrap();
    assert_eq!(engine.remove_topics(session, "?a/b//").unwrap(), 2);
    assert_eq!(engine.topic_count(), 0);
}

#[test]
fn test_concurrent_adds_create_once() {
    let (engine, _) = test_engine(EngineConfig::default());
    let session = open(&engine, "control");

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || engine.add_topic(session, "shared/topic", &string_spec()).unwrap())
        })
        .collect();
    let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let created = outcomes
        .iter()
        .filter(|o| **o == arbor::AddOutcome::Created)
        .count();
    assert_eq!(created, 1);
    assert_eq!(engine.topic_count(), 1);
}

#[test]
fn test_removal_unsubscribes_with_reason() {
    let (engine, _) = test_engine(EngineConfig::default());
    let publisher = open(&engine, "publisher");
    let client = open(&engine, "client");
    engine
        .add_and_set(publisher, "news/today", &string_spec(), TopicValue::string("hello"), NONE)
        .unwrap();
    engine.subscribe(client, "?news//").wait().unwrap();
    engine.drain(client).unwrap();

    engine.remove_topics(publisher, "news/today").unwrap();
    assert_eq!(
        engine.drain(client).unwrap(),
        vec![Delivery::Unsubscription {
            path: "news/today".into(),
            reason: UnsubscribeReason::Removal,
        }]
    );

    // Selector stays registered: a re-added topic is delivered again
    engine.add_topic(publisher, "news/today", &string_spec()).unwrap();
    assert!(matches!(
        engine.drain(client).unwrap().as_slice(),
        [Delivery::Subscription { .. }]
    ));
}

// --- Subscriptions ---

#[test]
fn test_type_filtered_subscription() {
    let (engine, _) = test_engine(EngineConfig::default());
    let publisher = open(&engine, "publisher");
    let client = open(&engine, "client");
    engine.add_topic(publisher, "mixed/json", &TopicSpecification::new(TopicType::Json)).unwrap();
    engine.add_topic(publisher, "mixed/bin", &TopicSpecification::new(TopicType::Binary)).unwrap();

    let matched = engine
        .subscribe_with_filter(client, "?mixed//", TypeFilter::JsonCompatible)
        .wait()
        .unwrap();
    assert_eq!(matched, 1);
    assert_eq!(engine.subscriptions(client).unwrap(), vec!["mixed/json".to_string()]);
}

#[test]
fn test_unsubscribe_keeps_other_selectors() {
    let (engine, _) = test_engine(EngineConfig::default());
    let publisher = open(&engine, "publisher");
    let client = open(&engine, "client");
    engine.add_topic(publisher, "s/1", &string_spec()).unwrap();
    engine.add_topic(publisher, "s/2", &string_spec()).unwrap();
    engine.subscribe(client, "?s//").wait().unwrap();
    engine.subscribe(client, "s/1").wait().unwrap();
    engine.drain(client).unwrap();

    assert_eq!(engine.unsubscribe(client, "?s//").unwrap(), 1);
    assert_eq!(
        engine.drain(client).unwrap(),
        vec![Delivery::Unsubscription {
            path: "s/2".into(),
            reason: UnsubscribeReason::Requested,
        }]
    );
    assert_eq!(engine.subscriptions(client).unwrap(), vec!["s/1".to_string()]);
}

#[test]
fn test_specific_stream_beats_fallback() {
    let (engine, _) = test_engine(EngineConfig::default());
    let publisher = open(&engine, "publisher");
    let client = open(&engine, "client");
    for path in ["FX/GBP/USD", "FX/EUR/USD"] {
        engine
            .add_and_set(publisher, path, &TopicSpecification::new(TopicType::Record), price("1", "2"), NONE)
            .unwrap();
    }
    engine.subscribe(client, "?FX//").wait().unwrap();
    engine
        .set(publisher, "FX/GBP/USD", price("3", "2"), NONE)
        .unwrap();

    let specific: Arc<Mutex<Vec<String>>> = Arc::default();
    let fallback: Arc<Mutex<Vec<String>>> = Arc::default();
    let mut streams = ValueStreams::new();
    let log = Arc::clone(&specific);
    streams.add_stream(
        TopicSelector::compile("FX/GBP/USD").unwrap(),
        TypeFilter::Any,
        move |event: &StreamEvent| log.lock().unwrap().push(event.path().to_string()),
    );
    let log = Arc::clone(&fallback);
    streams.add_fallback_stream(TypeFilter::Any, move |event: &StreamEvent| {
        log.lock().unwrap().push(event.path().to_string())
    });

    for delivery in engine.drain(client).unwrap() {
        streams.apply(delivery).unwrap();
    }

    assert_eq!(specific.lock().unwrap().len(), 3);
    assert!(specific.lock().unwrap().iter().all(|p| p == "FX/GBP/USD"));
    assert_eq!(*fallback.lock().unwrap(), vec!["FX/EUR/USD", "FX/EUR/USD"]);
    assert_eq!(streams.value("FX/GBP/USD"), Some(&price("3", "2")));
}

#[test]
fn test_routing_redirects_per_session() {
    let (engine, _) = test_engine(EngineConfig::default());
    let publisher = open(&engine, "publisher");
    let uk = engine
        .open_session(SessionOptions::new("uk").property("Country", "UK"))
        .unwrap();
    let us = engine
        .open_session(SessionOptions::new("us").property("Country", "US"))
        .unwrap();
    engine.set_routing_handler(|_: SessionId, props: &SessionProperties, _: &str| {
        props.get("Country").map(|c| format!("rates/{}", c))
    });
    for (path, rate) in [("rates/UK", "5.25"), ("rates/US", "5.50")] {
        engine.add_and_set(publisher, path, &string_spec(), TopicValue::string(rate), NONE).unwrap();
    }
    engine
        .add_topic(publisher, "rate", &TopicSpecification::new(TopicType::Routing))
        .unwrap();

    engine.subscribe(uk, "rate").wait().unwrap();
    engine.subscribe(us, "rate").wait().unwrap();

    let value_of = |session| {
        engine
            .drain(session)
            .unwrap()
            .into_iter()
            .find_map(|d| match d {
                Delivery::Value { path, payload: Payload::Full(TopicValue::String(v)), .. } => {
                    assert_eq!(path, "rate");
                    Some(v)
                }
                _ => None,
            })
    };
    assert_eq!(value_of(uk).as_deref(), Some("5.25"));
    assert_eq!(value_of(us).as_deref(), Some("5.50"));
}

#[test]
fn test_routing_type_filter_applies_to_target() {
    let (engine, _) = test_engine(EngineConfig::default());
    let publisher = open(&engine, "publisher");
    let uk = engine
        .open_session(SessionOptions::new("uk").property("Country", "UK"))
        .unwrap();
    let us = engine
        .open_session(SessionOptions::new("us").property("Country", "US"))
        .unwrap();
    engine.set_routing_handler(|_: SessionId, props: &SessionProperties, _: &str| {
        match props.get("Country").map(String::as_str) {
            Some("UK") => Some("docs/uk".to_string()),
            _ => Some("blobs/us".to_string()),
        }
    });
    engine
        .add_and_set(
            publisher,
            "docs/uk",
            &TopicSpecification::new(TopicType::Json),
            TopicValue::json(json!({"rate": 5.25})),
            NONE,
        )
        .unwrap();
    engine
        .add_topic(publisher, "blobs/us", &TopicSpecification::new(TopicType::Binary))
        .unwrap();
    engine
        .add_topic(publisher, "rate", &TopicSpecification::new(TopicType::Routing))
        .unwrap();

    let json_only = TypeFilter::JsonCompatible;
    assert_eq!(engine.subscribe_with_filter(uk, "rate", json_only.clone()).wait().unwrap(), 1);
    assert_eq!(engine.subscribe_with_filter(us, "rate", json_only).wait().unwrap(), 0);

    let uk_deliveries = engine.drain(uk).unwrap();
    assert!(matches!(
        &uk_deliveries[..],
        [Delivery::Subscription { path, .. }, Delivery::Value { .. }] if path == "rate"
    ));
    assert!(engine.drain(us).unwrap().is_empty());
}

#[test]
fn test_filter_subscriptions() {
    let (engine, _) = test_engine(EngineConfig::default());
    let publisher = open(&engine, "publisher");
    let fx = engine
        .open_session(SessionOptions::new("trader").property("Desk", "fx"))
        .unwrap();
    let rates = engine
        .open_session(SessionOptions::new("trader").property("Desk", "rates"))
        .unwrap();
    engine.add_topic(publisher, "desk/news", &string_spec()).unwrap();

    assert_eq!(engine.subscribe_by_filter("Desk is 'fx'", "?desk//").unwrap(), 1);
    assert_eq!(engine.subscriptions(fx).unwrap().len(), 1);
    assert!(engine.subscriptions(rates).unwrap().is_empty());

    assert_eq!(engine.unsubscribe_by_filter("Desk in ['fx', 'rates']", "?desk//").unwrap(), 2);
    let deliveries = engine.drain(fx).unwrap();
    assert_eq!(
        deliveries.last(),
        Some(&Delivery::Unsubscription {
            path: "desk/news".into(),
            reason: UnsubscribeReason::Control,
        })
    );
}

// --- Missing topics ---

#[test]
fn test_missing_topic_handler_proceeds() {
    let (engine, _) = test_engine(EngineConfig::default());
    let publisher = open(&engine, "publisher");
    let first = open(&engine, "first");
    let second = open(&engine, "second");
    let (tx, rx) = crossbeam_channel::unbounded();
    engine
        .set_missing_topic_handler("Dynamic", move |n: MissingTopicNotification| {
            tx.send(n).unwrap();
        })
        .unwrap();

    let a = engine.subscribe(first, "Dynamic/Item");
    let b = engine.subscribe(second, "Dynamic/Item");
    assert!(!a.is_ready());
    assert!(!b.is_ready());

    // One notification per distinct path
    let notification = rx.try_recv().unwrap();
    assert!(rx.try_recv().is_err());
    assert_eq!(notification.path, "Dynamic/Item");

    engine.add_topic(publisher, "Dynamic/Item", &string_spec()).unwrap();
    notification.handle.proceed();
    assert_eq!(a.wait().unwrap(), 1);
    assert_eq!(b.wait().unwrap(), 1);
    assert_eq!(engine.pending_missing_topic_requests(), 0);
}

#[test]
fn test_missing_topic_cancel_releases_request() {
    let (engine, _) = test_engine(EngineConfig::default());
    let client = open(&engine, "client");
    let (tx, rx) = crossbeam_channel::unbounded();
    engine
        .set_missing_topic_handler("Lazy", move |n: MissingTopicNotification| {
            tx.send(n).unwrap();
        })
        .unwrap();

    let pending = engine.fetch(client, "?Lazy//", FetchRequest::new());
    let _notification = rx.recv().unwrap();
    assert_eq!(engine.pending_missing_topic_requests(), 1);
    assert!(matches!(pending.cancel(), Err(EngineError::Cancelled)));
    assert_eq!(engine.pending_missing_topic_requests(), 0);
}

#[test]
fn test_missing_topic_timeout_discards() {
    let (engine, clock) = test_engine(EngineConfig::default());
    let client = open(&engine, "client");
    let (tx, rx) = crossbeam_channel::unbounded();
    engine
        .set_missing_topic_handler("Slow", move |n: MissingTopicNotification| {
            tx.send(n).unwrap();
        })
        .unwrap();

    let pending = engine.subscribe(client, "Slow/x");
    let _notification = rx.recv().unwrap();
    clock.advance(Duration::from_secs(31));
    assert_eq!(engine.expire_missing_topic_requests(), 1);
    assert!(matches!(pending.wait(), Err(EngineError::OperationDiscarded(_))));
}

#[test]
fn test_dropped_handle_proceeds() {
    let (engine, _) = test_engine(EngineConfig::default());
    let client = open(&engine, "client");
    engine
        .set_missing_topic_handler("Gone", |_: MissingTopicNotification| {})
        .unwrap();
    assert_eq!(engine.subscribe(client, "Gone/x").wait().unwrap(), 0);
}

// --- Fetch ---

#[test]
fn test_fetch_pages_in_path_order() {
    let (engine, _) = test_engine(EngineConfig::default());
    let publisher = open(&engine, "publisher");
    for i in (0..10).rev() {
        engine
            .add_and_set(
                publisher,
                &format!("Page/{:02}", i),
                &string_spec(),
                TopicValue::string(i.to_string()),
                NONE,
            )
            .unwrap();
    }

    let first = engine
        .fetch(publisher, "?Page//", FetchRequest::new().first(4).with_values())
        .wait()
        .unwrap();
    assert_eq!(first.paths(), vec!["Page/00", "Page/01", "Page/02", "Page/03"]);
    assert!(first.has_more);
    assert_eq!(first.topics[0].value, Some(TopicValue::string("0")));

    let next = engine
        .fetch(
            publisher,
            "?Page//",
            FetchRequest::new().after(first.last_path().unwrap()).first(4),
        )
        .wait()
        .unwrap();
    assert_eq!(next.paths(), vec!["Page/04", "Page/05", "Page/06", "Page/07"]);
    assert!(next.topics[0].value.is_none());

    let last = engine
        .fetch(publisher, "?Page//", FetchRequest::new().last(2).with_properties())
        .wait()
        .unwrap();
    assert_eq!(last.paths(), vec!["Page/08", "Page/09"]);
    assert!(last.topics[0].specification.is_some());
}

// --- Values ---

#[test]
fn test_json_patch_and_deltas() {
    let (engine, _) = test_engine(EngineConfig::default());
    let publisher = open(&engine, "publisher");
    let client = open(&engine, "client");
    engine
        .add_and_set(
            publisher,
            "doc",
            &TopicSpecification::new(TopicType::Json),
            TopicValue::json(json!({"name": "alpha", "count": 1})),
            NONE,
        )
        .unwrap();
    engine.subscribe(client, "doc").wait().unwrap();

    let ops = arbor::parse_json_patch(r#"[{"op": "replace", "path": "/count", "value": 2}]"#).unwrap();
    engine.apply_json_patch(publisher, "doc", &ops, NONE).unwrap();

    let mut streams = ValueStreams::new();
    let deliveries = engine.drain(client).unwrap();
    assert!(matches!(
        deliveries.last(),
        Some(Delivery::Value { payload: Payload::Delta(Delta::Json(_)), .. })
    ));
    for delivery in deliveries {
        streams.apply(delivery).unwrap();
    }
    assert_eq!(
        streams.value("doc"),
        Some(&TopicValue::json(json!({"name": "alpha", "count": 2})))
    );

    let failing = arbor::parse_json_patch(r#"[{"op": "test", "path": "/name", "value": "beta"}]"#).unwrap();
    assert!(matches!(
        engine.apply_json_patch(publisher, "doc", &failing, NONE),
        Err(EngineError::JsonPatchFailed { index: 0, .. })
    ));
}

#[test]
fn test_partial_json_constraint() {
    let (engine, _) = test_engine(EngineConfig::default());
    let session = open(&engine, "publisher");
    engine
        .add_and_set(
            session,
            "cfg",
            &TopicSpecification::new(TopicType::Json),
            TopicValue::json(json!({"version": 3})),
            NONE,
        )
        .unwrap();

    let ok = UpdateConstraint::Unconstrained
        .json_with("/version", json!(3))
        .json_without("/locked");
    engine
        .set(session, "cfg", TopicValue::json(json!({"version": 4})), &ok)
        .unwrap();
    assert!(matches!(
        engine.set(session, "cfg", TopicValue::json(json!({"version": 5})), &ok),
        Err(EngineError::ConstraintUnsatisfied(_))
    ));
}

#[test]
fn test_time_series_append_edit_query() {
    let (engine, clock) = test_engine(EngineConfig::default());
    let session = open(&engine, "publisher");
    let spec = TopicSpecification::new(TopicType::TimeSeries)
        .with_property(TopicSpecification::TIME_SERIES_EVENT_VALUE_TYPE, "int64");
    engine.add_topic(session, "ticks", &spec).unwrap();

    let mut sequences = Vec::new();
    for v in [10, 20, 30] {
        sequences.push(engine.append(session, "ticks", TopicValue::Int64(v)).unwrap());
        clock.advance(Duration::from_millis(5));
    }
    assert!(sequences.windows(2).all(|w| w[0] < w[1]));

    let edit = engine
        .edit(session, "ticks", sequences[1], TopicValue::Int64(21))
        .unwrap();
    assert!(edit > sequences[2]);

    let values = engine
        .time_series_query(session, "ticks", &RangeQuery::values())
        .unwrap();
    let observed: Vec<TopicValue> = values.iter().map(|e| e.value.clone()).collect();
    assert_eq!(
        observed,
        vec![TopicValue::Int64(10), TopicValue::Int64(21), TopicValue::Int64(30)]
    );
    assert_eq!(values[1].original_sequence(), sequences[1]);

    let edits = engine
        .time_series_query(session, "ticks", &RangeQuery::edits())
        .unwrap();
    assert_eq!(edits.len(), 4);

    let ranged = engine
        .time_series_query(
            session,
            "ticks",
            &RangeQuery::values().from_sequence(sequences[1].0).to_sequence(sequences[2].0),
        )
        .unwrap();
    assert_eq!(ranged.len(), 2);
}

// --- Locks ---

#[test]
fn test_lock_constraint() {
    let (engine, _) = test_engine(EngineConfig::default());
    let owner = open(&engine, "owner");
    let other = open(&engine, "other");
    engine
        .add_and_set(owner, "guarded", &string_spec(), TopicValue::string("v0"), NONE)
        .unwrap();

    let lock = engine
        .lock(owner, "guard", LockScope::UnlockOnSessionLoss)
        .wait()
        .unwrap();
    let constraint = UpdateConstraint::locked(&lock);
    engine
        .set(owner, "guarded", TopicValue::string("v1"), &constraint)
        .unwrap();
    assert!(matches!(
        engine.set(other, "guarded", TopicValue::string("v2"), &constraint),
        Err(EngineError::ConstraintUnsatisfied(_))
    ));

    let waiting = engine.lock(other, "guard", LockScope::UnlockOnSessionLoss);
    assert!(!waiting.is_ready());
    engine.unlock(owner, &lock).unwrap();
    let granted = waiting.wait().unwrap();
    assert_eq!(granted.owner, other);
    assert!(matches!(
        engine.set(owner, "guarded", TopicValue::string("v3"), &constraint),
        Err(EngineError::ConstraintUnsatisfied(_))
    ));
}

// --- Notifications ---

#[test]
fn test_topic_notifications() {
    let (engine, _) = test_engine(EngineConfig::default());
    let session = open(&engine, "control");
    engine.add_topic(session, "N/a", &string_spec()).unwrap();

    let listener = engine.topic_notifications();
    engine.select_notifications(listener.id, "?N//").unwrap();
    engine.add_topic(session, "N/b", &string_spec()).unwrap();
    engine.add_topic(session, "Other", &string_spec()).unwrap();
    engine.remove_topics(session, "N/a").unwrap();

    let kinds: Vec<(String, TopicNotificationKind)> = listener
        .receiver
        .try_iter()
        .map(|n| (n.path, n.kind))
        .collect();
    assert_eq!(
        kinds,
        vec![
            ("N/a".to_string(), TopicNotificationKind::Selected),
            ("N/b".to_string(), TopicNotificationKind::Added),
            ("N/a".to_string(), TopicNotificationKind::Removed),
        ]
    );

    engine.deselect_notifications(listener.id, "?N//").unwrap();
    let deselected: Vec<_> = listener.receiver.try_iter().collect();
    assert_eq!(deselected.len(), 1);
    assert_eq!(deselected[0].kind, TopicNotificationKind::Deselected);
}

#[test]
fn test_selecting_large_branch_keeps_listener() {
    let (engine, _) = test_engine(EngineConfig::default());
    let session = open(&engine, "control");
    for i in 0..1500 {
        engine.add_topic(session, &format!("N/{:04}", i), &string_spec()).unwrap();
    }

    let listener = engine.topic_notifications();
    engine.select_notifications(listener.id, "?N//").unwrap();
    assert_eq!(listener.receiver.try_iter().count(), 1500);

    engine.add_topic(session, "N/new", &string_spec()).unwrap();
    let added: Vec<_> = listener.receiver.try_iter().collect();
    assert_eq!(added.len(), 1);
    assert_eq!(added[0].kind, TopicNotificationKind::Added);
    engine.deselect_notifications(listener.id, "?N//").unwrap();
}

#[test]
fn test_topic_subscriber_events() {
    let (engine, _) = test_engine(EngineConfig::default());
    let publisher = open(&engine, "publisher");
    let client = open(&engine, "client");
    engine.add_topic(publisher, "E/x", &string_spec()).unwrap();
    let events = engine.topic_events("E");

    engine.subscribe(client, "E/x").wait().unwrap();
    engine.unsubscribe(client, "E/x").unwrap();

    let kinds: Vec<TopicEventKind> = events.try_iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![TopicEventKind::HasSubscribers, TopicEventKind::NoSubscribers]);
}

// --- Queues ---

#[test]
fn test_conflation_above_high_watermark() {
    let config = EngineConfig {
        queue: QueueConfig {
            high_watermark: 4,
            low_watermark: 1,
            ..QueueConfig::default()
        },
        ..EngineConfig::default()
    };
    let (engine, _) = test_engine(config);
    let publisher = open(&engine, "publisher");
    let client = open(&engine, "client");
    let events = engine.queue_events();
    for i in 1..=3 {
        engine
            .add_and_set(publisher, &format!("P/{}", i), &TopicSpecification::new(TopicType::Record), price("0", "0"), NONE)
            .unwrap();
    }
    engine.subscribe(client, "?P//").wait().unwrap();

    // Queue-event handler reacts by conflating the slow session
    match events.try_recv().unwrap() {
        QueueEvent::UpperThresholdCrossed { session, .. } => {
            engine.set_conflated(session, true).unwrap()
        }
        other => panic!("unexpected {:?}", other),
    }
    for i in 1..=10 {
        engine
            .set(publisher, "P/1", price(&i.to_string(), "0"), NONE)
            .unwrap();
    }

    let deliveries = engine.drain(client).unwrap();
    assert_eq!(deliveries.len(), 6);
    let mut streams = ValueStreams::new();
    for delivery in deliveries {
        streams.apply(delivery).unwrap();
    }
    assert_eq!(streams.value("P/1"), Some(&price("10", "0")));
    assert!(matches!(
        events.try_recv().unwrap(),
        QueueEvent::LowerThresholdCrossed { .. }
    ));
}

#[test]
fn test_throttled_session() {
    let (engine, clock) = test_engine(EngineConfig::default());
    let publisher = open(&engine, "publisher");
    let client = open(&engine, "client");
    engine.add_topic(publisher, "t", &string_spec()).unwrap();
    engine.subscribe(client, "t").wait().unwrap();
    engine.set(publisher, "t", TopicValue::string("1"), NONE).unwrap();
    engine.set(publisher, "t", TopicValue::string("2"), NONE).unwrap();

    engine
        .set_throttled(client, Some(Duration::from_secs(1)))
        .unwrap();
    assert_eq!(engine.poll(client).unwrap().len(), 1);
    assert!(engine.poll(client).unwrap().is_empty());
    clock.advance(Duration::from_secs(1));
    assert_eq!(engine.poll(client).unwrap().len(), 1);
    assert_eq!(engine.queue_depth(client).unwrap(), 1);
}

#[test]
fn test_overflowing_session_is_closed() {
    let config = EngineConfig {
        queue: QueueConfig {
            high_watermark: 3,
            low_watermark: 1,
            max_depth: 4,
            conflate: false,
        },
        ..EngineConfig::default()
    };
    let (engine, _) = test_engine(config);
    let publisher = open(&engine, "publisher");
    let client = open(&engine, "client");
    let events = engine.session_events();
    engine.add_topic(publisher, "fast", &string_spec()).unwrap();
    engine.subscribe(client, "fast").wait().unwrap();

    for i in 0..6 {
        engine
            .set(publisher, "fast", TopicValue::string(i.to_string()), NONE)
            .unwrap();
    }

    assert_eq!(engine.session_state(client).unwrap(), SessionState::ClosedByServer);
    assert!(events
        .try_iter()
        .any(|e| e.session == client && e.reason == Some(arbor::CloseReason::QueueOverflow)));
    assert_eq!(engine.session_state(publisher).unwrap(), SessionState::ConnectedActive);
}

// --- Removal policies ---

#[test]
fn test_removal_after_no_updates() {
    let (engine, clock) = test_engine(EngineConfig::default());
    let session = open(&engine, "control");
    let spec = string_spec().with_property(TopicSpecification::REMOVAL, "when no updates for 10s");
    engine.add_topic(session, "idle", &spec).unwrap();

    clock.advance(Duration::from_secs(5));
    engine.set(session, "idle", TopicValue::string("ping"), NONE).unwrap();
    clock.advance(Duration::from_secs(9));
    assert_eq!(engine.evaluate_removal_policies(), 0);
    clock.advance(Duration::from_secs(2));
    assert_eq!(engine.evaluate_removal_policies(), 1);
    assert!(engine.topic("idle").is_none());
}

#[test]
fn test_removal_when_unsubscribed() {
    let (engine, clock) = test_engine(EngineConfig::default());
    let publisher = open(&engine, "publisher");
    let client = open(&engine, "client");
    let spec = string_spec()
        .with_property(TopicSpecification::REMOVAL, "when subscriptions < 1 for 5s");
    engine.add_topic(publisher, "watched", &spec).unwrap();
    engine.subscribe(client, "watched").wait().unwrap();

    clock.advance(Duration::from_secs(10));
    assert_eq!(engine.evaluate_removal_policies(), 0);

    engine.unsubscribe(client, "watched").unwrap();
    clock.advance(Duration::from_secs(6));
    assert_eq!(engine.evaluate_removal_policies(), 1);
}

#[test]
fn test_removal_when_no_session_has_property() {
    let (engine, clock) = test_engine(EngineConfig::default());
    let publisher = open(&engine, "publisher");
    let spec = string_spec()
        .with_property(TopicSpecification::REMOVAL, "when no session has 'Team is \"blue\"' for 1m");
    engine.add_topic(publisher, "team/blue", &spec).unwrap();
    let member = engine
        .open_session(SessionOptions::new("m").property("Team", "blue"))
        .unwrap();

    clock.advance(Duration::from_secs(120));
    assert_eq!(engine.evaluate_removal_policies(), 0);

    engine.close_session(member).unwrap();
    assert_eq!(engine.evaluate_removal_policies(), 0);
    clock.advance(Duration::from_secs(61));
    assert_eq!(engine.evaluate_removal_policies(), 1);
}

// --- Security ---

#[test]
fn test_authentication_chain() {
    let (engine, _) = test_engine(EngineConfig::default());
    engine.add_authenticator(|principal: &str, credentials: &Credentials, _: &SessionProperties| {
        if principal == "anonymous" {
            return AuthDecision::Abstain;
        }
        match credentials {
            Credentials::Password(p) if p == "secret" => {
                let mut granted = SessionProperties::new();
                granted.insert("Role".into(), "trader".into());
                granted.insert("$Country".into(), "UK".into());
                AuthDecision::Allow(granted)
            }
            _ => AuthDecision::Deny,
        }
    });

    let denied = engine.open_session(
        SessionOptions::new("alice").credentials(Credentials::Password("guess".into())),
    );
    assert!(matches!(denied, Err(EngineError::SessionEstablishment(_))));
    assert!(matches!(
        engine.open_session(SessionOptions::new("anonymous")),
        Err(EngineError::SessionEstablishment(_))
    ));

    let session = engine
        .open_session(
            SessionOptions::new("alice")
                .credentials(Credentials::Password("secret".into()))
                .property("$Country", "FR"),
        )
        .unwrap();
    let props = engine.session_properties(session).unwrap();
    assert_eq!(props.get("Role").map(String::as_str), Some("trader"));
    assert_eq!(props.get("$Country").map(String::as_str), Some("UK"));
    assert_eq!(props.get("$Principal").map(String::as_str), Some("alice"));
}

#[test]
fn test_revoked_read_permission_unsubscribes() {
    let (engine, _) = test_engine(EngineConfig::default());
    let publisher = open(&engine, "publisher");
    let client = open(&engine, "client");
    engine.add_topic(publisher, "Secret/x", &string_spec()).unwrap();
    engine.add_topic(publisher, "Public/x", &string_spec()).unwrap();

    let allowed = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&allowed);
    engine.set_authorizer(
        move |principal: &str, _: &SessionProperties, permission: TopicPermission, path: &str| {
            if principal == "client" && permission == TopicPermission::Read && path.starts_with("Secret") {
                Some(flag.load(Ordering::SeqCst))
            } else {
                None
            }
        },
    );

    assert_eq!(engine.subscribe(client, "?Secret//").wait().unwrap(), 1);
    engine.subscribe(client, "?Public//").wait().unwrap();
    engine.drain(client).unwrap();

    allowed.store(false, Ordering::SeqCst);
    assert_eq!(engine.refresh_permissions(client).unwrap(), 1);
    assert_eq!(
        engine.drain(client).unwrap(),
        vec![Delivery::Unsubscription {
            path: "Secret/x".into(),
            reason: UnsubscribeReason::Authorization,
        }]
    );
    assert_eq!(engine.subscriptions(client).unwrap(), vec!["Public/x".to_string()]);
}
