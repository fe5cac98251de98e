//! Server-side session record.

use super::lifecycle::{InitialRetryStrategy, ReconnectionStrategy, SessionLifecycle};
use super::{auth::Credentials, SessionProperties};
use crate::delivery::SessionQueue;
use crate::types::{SessionId, SessionState, Timestamp};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Property holding the session id.
pub const SESSION_ID: &str = "$SessionId";
/// Property holding the authenticated principal.
pub const PRINCIPAL: &str = "$Principal";
/// Property holding the session start time in milliseconds.
pub const START_TIME: &str = "$StartTime";

/// Whether a property name is fixed: clients cannot set it, only
/// authenticators and the engine.
pub fn is_fixed_property(name: &str) -> bool {
    name.starts_with('$')
}

/// Whether the engine itself assigns a fixed property.
fn is_engine_property(name: &str) -> bool {
    matches!(name, SESSION_ID | PRINCIPAL | START_TIME)
}

/// Parameters for opening a session.
#[derive(Clone, Default)]
pub struct SessionOptions {
    pub principal: String,
    pub credentials: Credentials,
    /// Proposed user properties; `$`-prefixed names are ignored.
    pub properties: SessionProperties,
    /// Used when the session loses its connection. Without one the session
    /// waits passively for `reconnected` until the timeout.
    pub reconnection: Option<ReconnectionStrategy>,
    pub initial_retry: Option<InitialRetryStrategy>,
}

impl SessionOptions {
    pub fn new(principal: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            ..Self::default()
        }
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn reconnection(mut self, strategy: ReconnectionStrategy) -> Self {
        self.reconnection = Some(strategy);
        self
    }

    pub fn initial_retry(mut self, strategy: InitialRetryStrategy) -> Self {
        self.initial_retry = Some(strategy);
        self
    }
}

/// Why a session closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    ClosedByClient,
    /// Reconnection timed out, was aborted, or is disabled.
    ConnectionLost,
    QueueOverflow,
    ClosedByController,
}

/// A session state change, published on the engine's session event channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub session: SessionId,
    pub from: SessionState,
    pub to: SessionState,
    pub reason: Option<CloseReason>,
}

pub(crate) struct Session {
    pub(crate) id: SessionId,
    pub(crate) principal: String,
    pub(crate) properties: RwLock<SessionProperties>,
    pub(crate) lifecycle: Mutex<SessionLifecycle>,
    pub(crate) queue: SessionQueue,
    pub(crate) reconnection: Option<ReconnectionStrategy>,
    pub(crate) started_at: Timestamp,
}

impl Session {
    /// `proposed` comes from the client and loses its fixed properties;
    /// `granted` comes from authentication and may set fixed ones such as
    /// `$Country`, but not those the engine assigns.
    pub(crate) fn new(
        id: SessionId,
        principal: String,
        proposed: SessionProperties,
        granted: SessionProperties,
        lifecycle: SessionLifecycle,
        queue: SessionQueue,
        reconnection: Option<ReconnectionStrategy>,
        started_at: Timestamp,
    ) -> Self {
        let mut all: SessionProperties = proposed
            .into_iter()
            .filter(|(name, _)| !is_fixed_property(name))
            .chain(granted.into_iter().filter(|(name, _)| !is_engine_property(name)))
            .collect();
        all.insert(SESSION_ID.to_string(), id.to_string());
        all.insert(PRINCIPAL.to_string(), principal.clone());
        all.insert(START_TIME.to_string(), started_at.0.to_string());
        Self {
            id,
            principal,
            properties: RwLock::new(all),
            lifecycle: Mutex::new(lifecycle),
            queue,
            reconnection,
            started_at,
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        self.lifecycle.lock().state()
    }

    pub(crate) fn properties(&self) -> SessionProperties {
        self.properties.read().clone()
    }

    /// Merge user properties; fixed properties cannot be changed and an
    /// empty value removes the property.
    pub(crate) fn merge_properties(&self, changes: &SessionProperties) -> SessionProperties {
        let mut properties = self.properties.write();
        for (name, value) in changes {
            if is_fixed_property(name) {
                continue;
            }
            if value.is_empty() {
                properties.remove(name);
            } else {
                properties.insert(name.clone(), value.clone());
            }
        }
        properties.clone()
    }
}

/// Live sessions by id.
#[derive(Default)]
pub(crate) struct SessionTable {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
}

impl SessionTable {
    pub(crate) fn insert(&self, session: Arc<Session>) {
        self.sessions.write().insert(session.id, session);
    }

    pub(crate) fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.read().get(&id).cloned()
    }

    pub(crate) fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.write().remove(&id)
    }

    pub(crate) fn all(&self) -> Vec<Arc<Session>> {
        self.sessions.read().values().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use std::time::Duration;

    fn session(props: SessionProperties) -> Session {
        granted_session(props, SessionProperties::new())
    }

    fn granted_session(props: SessionProperties, granted: SessionProperties) -> Session {
        let (tx, _rx) = crossbeam_channel::bounded(1);
        Session::new(
            SessionId(0xab),
            "alice".into(),
            props,
            granted,
            SessionLifecycle::new(SessionId(0xab), Duration::from_secs(1)),
            SessionQueue::new(SessionId(0xab), QueueConfig::default(), tx),
            None,
            Timestamp(42),
        )
    }

    #[test]
    fn test_fixed_properties_assigned() {
        let mut proposed = SessionProperties::new();
        proposed.insert(PRINCIPAL.into(), "mallory".into());
        proposed.insert("Department".into(), "FX".into());
        let props = session(proposed).properties();
        assert_eq!(props[PRINCIPAL], "alice");
        assert_eq!(props[SESSION_ID], "00000000000000ab");
        assert_eq!(props[START_TIME], "42");
        assert_eq!(props["Department"], "FX");
    }

    #[test]
    fn test_granted_fixed_properties_kept() {
        let mut proposed = SessionProperties::new();
        proposed.insert("$Country".into(), "FR".into());
        let mut granted = SessionProperties::new();
        granted.insert("$Country".into(), "UK".into());
        granted.insert("$Roles".into(), "TRADER".into());
        granted.insert(SESSION_ID.into(), "forged".into());
        let props = granted_session(proposed, granted).properties();
        assert_eq!(props["$Country"], "UK");
        assert_eq!(props["$Roles"], "TRADER");
        assert_eq!(props[SESSION_ID], "00000000000000ab");
    }

    #[test]
    fn test_merge_properties() {
        let s = session(SessionProperties::new());
        let mut changes = SessionProperties::new();
        changes.insert("Desk".into(), "rates".into());
        changes.insert(PRINCIPAL.into(), "eve".into());
        s.merge_properties(&changes);
        let mut removal = SessionProperties::new();
        removal.insert("Desk".into(), String::new());
        let props = s.merge_properties(&removal);
        assert!(!props.contains_key("Desk"));
        assert_eq!(props[PRINCIPAL], "alice");
    }
}
