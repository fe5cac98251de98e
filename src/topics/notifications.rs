//! Topic notifications and topic subscriber events.
//!
//! Listeners get an unbounded channel, so selecting a large branch never
//! loses notifications. A listener is dropped only once its receiver is
//! gone.

use crate::error::{EngineError, Result};
use crate::selectors::TopicSelector;
use crate::types::{is_in_branch, TopicSpecification};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Identifies a notification listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListenerId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopicNotificationKind {
    /// A topic matching a selection was added.
    Added,
    /// A topic matching a selection was removed.
    Removed,
    /// An existing topic became selected.
    Selected,
    /// An existing topic is no longer selected.
    Deselected,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicNotification {
    pub path: String,
    pub specification: TopicSpecification,
    pub kind: TopicNotificationKind,
}

/// The receiving end of a notification registration.
pub struct NotificationListener {
    pub id: ListenerId,
    pub receiver: Receiver<TopicNotification>,
}

struct Listener {
    selectors: Vec<TopicSelector>,
    sender: Sender<TopicNotification>,
}

impl Listener {
    fn selects(&self, path: &str) -> bool {
        self.selectors.iter().any(|s| s.matches(path))
    }

    /// False once the receiver is gone.
    fn send(&self, notification: TopicNotification) -> bool {
        self.sender.send(notification).is_ok()
    }
}

#[derive(Default)]
pub(crate) struct TopicNotifications {
    listeners: RwLock<HashMap<ListenerId, Listener>>,
    next_id: AtomicU64,
}

impl TopicNotifications {
    pub(crate) fn register(&self) -> NotificationListener {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let (sender, receiver) = unbounded();
        self.listeners.write().insert(
            id,
            Listener {
                selectors: Vec::new(),
                sender,
            },
        );
        NotificationListener { id, receiver }
    }

    pub(crate) fn close(&self, id: ListenerId) -> bool {
        self.listeners.write().remove(&id).is_some()
    }

    /// Add a selection; `existing` topics it newly selects are reported as
    /// `Selected`. Fails if the listener's receiver has been dropped.
    pub(crate) fn select(
        &self,
        id: ListenerId,
        selector: TopicSelector,
        existing: &[(String, TopicSpecification)],
    ) -> Result<()> {
        let mut listeners = self.listeners.write();
        let listener = listeners
            .get_mut(&id)
            .ok_or_else(|| EngineError::InvalidOperation(format!("no listener {:?}", id)))?;
        let newly: Vec<&(String, TopicSpecification)> = existing
            .iter()
            .filter(|(path, _)| selector.matches(path) && !listener.selects(path))
            .collect();
        listener.selectors.push(selector);
        for (path, specification) in newly {
            if !listener.send(TopicNotification {
                path: path.clone(),
                specification: specification.clone(),
                kind: TopicNotificationKind::Selected,
            }) {
                return Err(Self::closed(&mut listeners, id));
            }
        }
        Ok(())
    }

    /// Remove a selection; topics no longer selected are reported as
    /// `Deselected`.
    pub(crate) fn deselect(
        &self,
        id: ListenerId,
        selector: &TopicSelector,
        existing: &[(String, TopicSpecification)],
    ) -> Result<()> {
        let mut listeners = self.listeners.write();
        let listener = listeners
            .get_mut(&id)
            .ok_or_else(|| EngineError::InvalidOperation(format!("no listener {:?}", id)))?;
        let before: Vec<&(String, TopicSpecification)> = existing
            .iter()
            .filter(|(path, _)| listener.selects(path))
            .collect();
        listener.selectors.retain(|s| s != selector);
        for (path, specification) in before {
            if listener.selects(path) {
                continue;
            }
            if !listener.send(TopicNotification {
                path: path.clone(),
                specification: specification.clone(),
                kind: TopicNotificationKind::Deselected,
            }) {
                return Err(Self::closed(&mut listeners, id));
            }
        }
        Ok(())
    }

    fn closed(listeners: &mut HashMap<ListenerId, Listener>, id: ListenerId) -> EngineError {
        warn!(listener = id.0, "notification listener receiver dropped");
        listeners.remove(&id);
        EngineError::InvalidOperation(format!("listener {:?} is closed", id))
    }

    pub(crate) fn notify(&self, path: &str, specification: &TopicSpecification, kind: TopicNotificationKind) {
        let mut dropped = Vec::new();
        {
            let listeners = self.listeners.read();
            for (id, listener) in listeners.iter() {
                if listener.selects(path)
                    && !listener.send(TopicNotification {
                        path: path.to_string(),
                        specification: specification.clone(),
                        kind,
                    })
                {
                    dropped.push(*id);
                }
            }
        }
        if !dropped.is_empty() {
            let mut listeners = self.listeners.write();
            for id in dropped {
                warn!(listener = id.0, "notification listener dropped");
                listeners.remove(&id);
            }
        }
    }
}

/// Whether a topic gained its first or lost its last subscriber.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopicEventKind {
    HasSubscribers,
    NoSubscribers,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicEvent {
    pub path: String,
    pub kind: TopicEventKind,
}

#[derive(Default)]
pub(crate) struct TopicEventListeners {
    listeners: RwLock<Vec<(String, Sender<TopicEvent>)>>,
}

impl TopicEventListeners {
    pub(crate) fn register(&self, branch: &str) -> Receiver<TopicEvent> {
        let (sender, receiver) = unbounded();
        self.listeners.write().push((branch.to_string(), sender));
        debug!(branch, "topic event listener registered");
        receiver
    }

    pub(crate) fn emit(&self, path: &str, kind: TopicEventKind) {
        let mut stale: Vec<Sender<TopicEvent>> = Vec::new();
        for (branch, sender) in self.listeners.read().iter() {
            if !is_in_branch(path, branch) {
                continue;
            }
            let event = TopicEvent {
                path: path.to_string(),
                kind,
            };
            if sender.send(event).is_err() {
                stale.push(sender.clone());
            }
        }
        if !stale.is_empty() {
            self.listeners
                .write()
                .retain(|(_, sender)| !stale.iter().any(|s| s.same_channel(sender)));
        }
    }
}
