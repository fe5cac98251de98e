//! Per-session outbound queue with conflation, throttling and watermarks.

use super::types::{Delivery, Payload, QueueEvent};
use crate::config::QueueConfig;
use crate::types::{SessionId, Timestamp};
use crate::values::{compute_delta, TopicValue};
use crossbeam_channel::{Sender, TrySendError};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::{debug, warn};

/// Result of queueing a delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// An earlier pending value for the same topic was replaced.
    Conflated,
    /// The queue is beyond its hard limit; the delivery was not queued.
    Overflow,
}

/// Values the session will have before and after a queued value delivery.
struct ValueState {
    base: Option<TopicValue>,
    current: TopicValue,
}

struct Entry {
    delivery: Delivery,
    value: Option<ValueState>,
}

struct QueueState {
    entries: VecDeque<Entry>,
    /// Absolute position of the front entry.
    head: u64,
    /// Path -> absolute position of its pending value delivery.
    pending_values: HashMap<String, u64>,
    conflate: bool,
    throttle: Option<Duration>,
    last_delivered: Option<Timestamp>,
    above_high: bool,
}

impl QueueState {
    fn tail(&self) -> u64 {
        self.head + self.entries.len() as u64
    }

    fn pop(&mut self) -> Option<Delivery> {
        let entry = self.entries.pop_front()?;
        let position = self.head;
        self.head += 1;
        if self.pending_values.get(entry.delivery.path()) == Some(&position) {
            self.pending_values.remove(entry.delivery.path());
        }
        Some(entry.delivery)
    }
}

/// The outbound queue of one session.
pub struct SessionQueue {
    session: SessionId,
    config: QueueConfig,
    state: Mutex<QueueState>,
    events: Sender<QueueEvent>,
}

impl SessionQueue {
    pub fn new(session: SessionId, config: QueueConfig, events: Sender<QueueEvent>) -> Self {
        let conflate = config.conflate;
        Self {
            session,
            config,
            state: Mutex::new(QueueState {
                entries: VecDeque::new(),
                head: 0,
                pending_values: HashMap::new(),
                conflate,
                throttle: None,
                last_delivered: None,
                above_high: false,
            }),
            events,
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_conflated(&self, conflate: bool) {
        self.state.lock().conflate = conflate;
        debug!(session = %self.session, conflate, "queue conflation changed");
    }

    /// Limit delivery to one message per `interval`; `None` lifts the limit.
    pub fn set_throttled(&self, interval: Option<Duration>) {
        self.state.lock().throttle = interval;
        debug!(session = %self.session, ?interval, "queue throttle changed");
    }

    /// Queue a subscription or unsubscription notice. These are never
    /// conflated and fence off earlier values for the same path.
    pub fn push(&self, delivery: Delivery) -> PushOutcome {
        let mut state = self.state.lock();
        state.pending_values.remove(delivery.path());
        self.append(&mut state, Entry {
            delivery,
            value: None,
        })
    }

    /// Queue a value delivery. `base` is the value the session holds before
    /// this delivery, `current` the full value after it.
    pub fn push_value(
        &self,
        delivery: Delivery,
        base: Option<TopicValue>,
        current: TopicValue,
    ) -> PushOutcome {
        let mut state = self.state.lock();
        let path = delivery.path().to_string();

        if state.conflate {
            if let Some(&position) = state.pending_values.get(&path) {
                let head = state.head;
                if let Some(entry) = state.entries.get_mut((position - head) as usize) {
                    if let (Some(pending), Delivery::Value { sequence, timestamp, .. }) =
                        (entry.value.as_mut(), &delivery)
                    {
                        let payload = match &pending.base {
                            Some(base) => compute_delta(base, &current)
                                .map(Payload::Delta)
                                .unwrap_or_else(|| Payload::Full(current.clone())),
                            None => Payload::Full(current.clone()),
                        };
                        entry.delivery = Delivery::Value {
                            path,
                            sequence: *sequence,
                            timestamp: *timestamp,
                            payload,
                        };
                        pending.current = current;
                        return PushOutcome::Conflated;
                    }
                }
            }
        }

        let position = state.tail();
        let outcome = self.append(
            &mut state,
            Entry {
                delivery,
                value: Some(ValueState { base, current }),
            },
        );
        if outcome == PushOutcome::Queued {
            state.pending_values.insert(path, position);
        }
        outcome
    }

    fn append(&self, state: &mut QueueState, entry: Entry) -> PushOutcome {
        if state.entries.len() >= self.config.max_depth {
            warn!(session = %self.session, depth = state.entries.len(), "session queue overflow");
            return PushOutcome::Overflow;
        }
        state.entries.push_back(entry);
        let depth = state.entries.len();
        if !state.above_high && depth >= self.config.high_watermark {
            state.above_high = true;
            debug!(session = %self.session, depth, "queue above high watermark");
            self.signal(QueueEvent::UpperThresholdCrossed {
                session: self.session,
                depth,
            });
        }
        PushOutcome::Queued
    }

    /// Take the deliveries that may be sent at `now`. A throttled queue
    /// releases at most one message per interval.
    pub fn poll(&self, now: Timestamp) -> Vec<Delivery> {
        let mut state = self.state.lock();
        let mut out = Vec::new();
        match state.throttle {
            Some(interval) => {
                let due = state
                    .last_delivered
                    .map(|last| now.since(last) >= interval)
                    .unwrap_or(true);
                if due {
                    if let Some(delivery) = state.pop() {
                        state.last_delivered = Some(now);
                        out.push(delivery);
                    }
                }
            }
            None => {
                while let Some(delivery) = state.pop() {
                    out.push(delivery);
                }
                if !out.is_empty() {
                    state.last_delivered = Some(now);
                }
            }
        }
        self.check_low(&mut state);
        out
    }

    /// Take everything, ignoring any throttle.
    pub fn drain(&self) -> Vec<Delivery> {
        let mut state = self.state.lock();
        let mut out = Vec::with_capacity(state.entries.len());
        while let Some(delivery) = state.pop() {
            out.push(delivery);
        }
        self.check_low(&mut state);
        out
    }

    pub(crate) fn clear(&self) {
        let mut state = self.state.lock();
        let head = state.tail();
        state.entries.clear();
        state.pending_values.clear();
        state.head = head;
        state.above_high = false;
    }

    fn check_low(&self, state: &mut QueueState) {
        let depth = state.entries.len();
        if state.above_high && depth <= self.config.low_watermark {
            state.above_high = false;
            debug!(session = %self.session, depth, "queue below low watermark");
            self.signal(QueueEvent::LowerThresholdCrossed {
                session: self.session,
                depth,
            });
        }
    }

    fn signal(&self, event: QueueEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(session = %self.session, "queue event listener is full, event dropped")
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}
