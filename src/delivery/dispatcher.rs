//! Fan-out of topic changes to subscribed sessions.
//!
//! Every function here runs with the topic's state locked, which keeps the
//! deliveries for one (session, topic) pair in update order.

use super::queue::PushOutcome;
use super::types::{Delivery, Payload, UnsubscribeReason, UpdateEvent};
use crate::sessions::SessionTable;
use crate::subscriptions::registry::SubscriptionRegistry;
use crate::topics::notifications::{TopicEventKind, TopicEventListeners};
use crate::topics::tree::{DeliveryPhase, TopicNode, TopicState};
use crate::types::{SessionId, Timestamp};
use crate::values::TopicValue;
use tracing::trace;

pub(crate) struct Dispatcher<'a> {
    pub(crate) registry: &'a SubscriptionRegistry,
    pub(crate) sessions: &'a SessionTable,
    pub(crate) topic_events: &'a TopicEventListeners,
    pub(crate) now: Timestamp,
}

/// Sessions whose queues overflowed during a dispatch; the caller closes
/// them once it has released its locks.
#[derive(Default, Debug)]
pub(crate) struct Overflowed(pub(crate) Vec<SessionId>);

impl Overflowed {
    fn note(&mut self, session: SessionId, outcome: PushOutcome) {
        if outcome == PushOutcome::Overflow && !self.0.contains(&session) {
            self.0.push(session);
        }
    }
}

impl Dispatcher<'_> {
    fn subscribers_changed(&self, node: &TopicNode, state: &mut TopicState, before: usize) {
        let after = state.subscribers.len();
        if let Some((policy, tracker)) = state.removal.as_mut() {
            policy.observe_subscribers(tracker, after, self.now);
        }
        match (before, after) {
            (0, 1..) => self.topic_events.emit(&node.path, TopicEventKind::HasSubscribers),
            (1.., 0) => self.topic_events.emit(&node.path, TopicEventKind::NoSubscribers),
            _ => {}
        }
    }

    /// Start delivering `node` to a bound session: a subscription notice
    /// and, if the topic has one, its current value in full.
    pub(crate) fn activate(
        &self,
        node: &TopicNode,
        state: &mut TopicState,
        session: SessionId,
        presented: &str,
        overflowed: &mut Overflowed,
    ) {
        let key = (session, presented.to_string());
        if state.removed
            || state.subscribers.contains_key(&key)
            || !self.registry.is_bound(session, presented, &node.path)
        {
            return;
        }
        let Some(target) = self.sessions.get(session) else {
            return;
        };

        let outcome = target.queue.push(Delivery::Subscription {
            path: presented.to_string(),
            specification: node.specification.clone(),
        });
        overflowed.note(session, outcome);

        let phase = match &state.value {
            Some(value) => {
                let outcome = target.queue.push_value(
                    Delivery::Value {
                        path: presented.to_string(),
                        sequence: state.sequence,
                        timestamp: state.last_updated.unwrap_or(state.created_at),
                        payload: Payload::Full(value.clone()),
                    },
                    None,
                    value.clone(),
                );
                overflowed.note(session, outcome);
                DeliveryPhase::Streaming
            }
            None => DeliveryPhase::AwaitingValue,
        };
        trace!(path = %node.path, %session, presented, "subscription activated");

        let before = state.subscribers.len();
        state.subscribers.insert(key, phase);
        self.subscribers_changed(node, state, before);
    }

    /// Stop delivering `node` to a session, telling it why.
    pub(crate) fn deactivate(
        &self,
        node: &TopicNode,
        state: &mut TopicState,
        session: SessionId,
        presented: &str,
        reason: UnsubscribeReason,
        overflowed: &mut Overflowed,
    ) {
        let before = state.subscribers.len();
        if state
            .subscribers
            .remove(&(session, presented.to_string()))
            .is_none()
        {
            return;
        }
        if let Some(target) = self.sessions.get(session) {
            let outcome = target.queue.push(Delivery::Unsubscription {
                path: presented.to_string(),
                reason,
            });
            overflowed.note(session, outcome);
        }
        self.subscribers_changed(node, state, before);
    }

    /// Deliver an applied update to every bound session.
    pub(crate) fn fan_out(
        &self,
        node: &TopicNode,
        state: &mut TopicState,
        event: &UpdateEvent,
        overflowed: &mut Overflowed,
    ) {
        for (session, presented) in self.registry.subscribers(&node.path) {
            let key = (session, presented.clone());
            if !state.subscribers.contains_key(&key) {
                // Bound but not yet activated; activation sends the
                // retained value, which already includes this update.
                self.activate(node, state, session, &presented, overflowed);
                if state.value.is_some() {
                    continue;
                }
            }
            let Some(phase) = state.subscribers.get(&key).copied() else {
                continue;
            };
            let Some(target) = self.sessions.get(session) else {
                continue;
            };
            let (payload, base) = match (phase, &event.delta, &event.old_value) {
                (DeliveryPhase::Streaming, Some(delta), Some(old)) => {
                    (Payload::Delta(delta.clone()), Some(old.clone()))
                }
                _ => (Payload::Full(event.new_value.clone()), None::<TopicValue>),
            };
            let outcome = target.queue.push_value(
                Delivery::Value {
                    path: presented,
                    sequence: event.sequence,
                    timestamp: event.timestamp,
                    payload,
                },
                base,
                event.new_value.clone(),
            );
            overflowed.note(session, outcome);
            state.subscribers.insert(key, DeliveryPhase::Streaming);
        }
    }
}
