//! Subscription registry.
//!
//! Each session holds registrations (selector plus type filter) and the
//! bindings they currently produce. A binding ties the path the session
//! knows a topic by to the topic whose updates it receives; the two differ
//! only for routing topics.

use crate::error::{EngineError, Result};
use crate::selectors::TopicSelector;
use crate::sessions::SessionProperties;
use crate::types::{SessionId, TopicType, TypeFilter};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Chooses the concrete topic a routing topic subscription reads from.
pub trait RoutingHandler: Send + Sync {
    fn route(&self, session: SessionId, properties: &SessionProperties, path: &str) -> Option<String>;
}

impl<F> RoutingHandler for F
where
    F: Fn(SessionId, &SessionProperties, &str) -> Option<String> + Send + Sync,
{
    fn route(&self, session: SessionId, properties: &SessionProperties, path: &str) -> Option<String> {
        self(session, properties, path)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Binding {
    pub(crate) session: SessionId,
    /// The path the session subscribed to.
    pub(crate) presented: String,
    /// The topic supplying the updates.
    pub(crate) target: String,
}

#[derive(Clone, Debug)]
struct Registration {
    selector: TopicSelector,
    filter: TypeFilter,
}

impl Registration {
    /// A routing topic is covered by its path alone; the filter applies to
    /// the topic it routes to.
    fn covers(&self, path: &str, topic_type: TopicType) -> bool {
        self.selector.matches(path)
            && (topic_type == TopicType::Routing || self.filter.accepts(topic_type))
    }
}

#[derive(Default)]
struct SessionEntry {
    registrations: Vec<Registration>,
    /// Presented path -> (target path, target topic type).
    bound: BTreeMap<String, (String, TopicType)>,
}

impl SessionEntry {
    fn covers(&self, path: &str, topic_type: TopicType) -> bool {
        self.registrations.iter().any(|r| r.covers(path, topic_type))
    }
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<SessionId, SessionEntry>,
    /// Target path -> (session, presented path).
    by_target: HashMap<String, BTreeSet<(SessionId, String)>>,
}

impl RegistryState {
    fn unlink(&mut self, session: SessionId, presented: &str, target: &str) {
        if let Some(set) = self.by_target.get_mut(target) {
            set.remove(&(session, presented.to_string()));
            if set.is_empty() {
                self.by_target.remove(target);
            }
        }
    }
}

#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    state: RwLock<RegistryState>,
}

impl SubscriptionRegistry {
    pub(crate) fn add_session(&self, session: SessionId) {
        self.state.write().sessions.entry(session).or_default();
    }

    /// Forget a session, returning the bindings it had.
    pub(crate) fn remove_session(&self, session: SessionId) -> Vec<Binding> {
        let mut state = self.state.write();
        let Some(entry) = state.sessions.remove(&session) else {
            return Vec::new();
        };
        let mut out = Vec::with_capacity(entry.bound.len());
        for (presented, (target, _)) in entry.bound {
            state.unlink(session, &presented, &target);
            out.push(Binding {
                session,
                presented,
                target,
            });
        }
        out
    }

    pub(crate) fn register(&self, session: SessionId, selector: TopicSelector, filter: TypeFilter) -> Result<()> {
        let mut state = self.state.write();
        let entry = state
            .sessions
            .get_mut(&session)
            .ok_or(EngineError::UnknownSession(session))?;
        let exists = entry
            .registrations
            .iter()
            .any(|r| r.selector == selector && r.filter == filter);
        if !exists {
            entry.registrations.push(Registration { selector, filter });
        }
        Ok(())
    }

    /// Bind a topic to a session if one of its registrations covers the
    /// presented path with the target's type. Returns false if not covered
    /// or already bound.
    pub(crate) fn bind(
        &self,
        session: SessionId,
        presented: &str,
        target_type: TopicType,
        target: &str,
    ) -> bool {
        let mut state = self.state.write();
        let Some(entry) = state.sessions.get_mut(&session) else {
            return false;
        };
        if entry.bound.contains_key(presented) || !entry.covers(presented, target_type) {
            return false;
        }
        entry
            .bound
            .insert(presented.to_string(), (target.to_string(), target_type));
        state
            .by_target
            .entry(target.to_string())
            .or_default()
            .insert((session, presented.to_string()));
        true
    }

    /// Remove registrations using `selector`; returns the bindings no
    /// remaining registration covers.
    pub(crate) fn unregister(&self, session: SessionId, selector: &TopicSelector) -> Result<Vec<Binding>> {
        let mut state = self.state.write();
        let entry = state
            .sessions
            .get_mut(&session)
            .ok_or(EngineError::UnknownSession(session))?;
        entry.registrations.retain(|r| &r.selector != selector);
        let uncovered: Vec<(String, String)> = entry
            .bound
            .iter()
            .filter(|(presented, (_, target_type))| !entry.covers(presented, *target_type))
            .map(|(presented, (target, _))| (presented.clone(), target.clone()))
            .collect();
        for (presented, _) in &uncovered {
            entry.bound.remove(presented);
        }
        let mut out = Vec::with_capacity(uncovered.len());
        for (presented, target) in uncovered {
            state.unlink(session, &presented, &target);
            out.push(Binding {
                session,
                presented,
                target,
            });
        }
        Ok(out)
    }

    /// Drop one binding, leaving registrations in place.
    pub(crate) fn unbind(&self, session: SessionId, presented: &str) -> Option<Binding> {
        let mut state = self.state.write();
        let (target, _) = state.sessions.get_mut(&session)?.bound.remove(presented)?;
        state.unlink(session, presented, &target);
        Some(Binding {
            session,
            presented: presented.to_string(),
            target,
        })
    }

    /// Remove every binding presenting or targeting `path`.
    pub(crate) fn unbind_path(&self, path: &str) -> Vec<Binding> {
        let mut state = self.state.write();
        let mut out = Vec::new();
        if let Some(targeting) = state.by_target.remove(path) {
            for (session, presented) in targeting {
                if let Some(entry) = state.sessions.get_mut(&session) {
                    entry.bound.remove(&presented);
                }
                out.push(Binding {
                    session,
                    presented,
                    target: path.to_string(),
                });
            }
        }
        let presenting: Vec<(SessionId, String)> = state
            .sessions
            .iter()
            .filter_map(|(session, entry)| {
                entry
                    .bound
                    .get(path)
                    .map(|(target, _)| (*session, target.clone()))
            })
            .collect();
        for (session, target) in presenting {
            if let Some(entry) = state.sessions.get_mut(&session) {
                entry.bound.remove(path);
            }
            state.unlink(session, path, &target);
            out.push(Binding {
                session,
                presented: path.to_string(),
                target,
            });
        }
        out
    }

    /// Sessions with a registration covering a topic.
    pub(crate) fn sessions_selecting(&self, path: &str, topic_type: TopicType) -> Vec<SessionId> {
        let state = self.state.read();
        let mut sessions: Vec<SessionId> = state
            .sessions
            .iter()
            .filter(|(_, entry)| entry.covers(path, topic_type))
            .map(|(session, _)| *session)
            .collect();
        sessions.sort();
        sessions
    }

    /// (session, presented path) pairs receiving updates from `target`.
    pub(crate) fn subscribers(&self, target: &str) -> Vec<(SessionId, String)> {
        self.state
            .read()
            .by_target
            .get(target)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn is_bound(&self, session: SessionId, presented: &str, target: &str) -> bool {
        self.state
            .read()
            .sessions
            .get(&session)
            .and_then(|entry| entry.bound.get(presented))
            .is_some_and(|(t, _)| t == target)
    }

    pub(crate) fn bindings(&self, session: SessionId) -> Vec<Binding> {
        self.state
            .read()
            .sessions
            .get(&session)
            .map(|entry| {
                entry
                    .bound
                    .iter()
                    .map(|(presented, (target, _))| Binding {
                        session,
                        presented: presented.clone(),
                        target: target.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of the session's bindings whose presented path `selector` matches.
    pub(crate) fn matched_count(&self, session: SessionId, selector: &TopicSelector) -> usize {
        self.state
            .read()
            .sessions
            .get(&session)
            .map(|entry| entry.bound.keys().filter(|p| selector.matches(p)).count())
            .unwrap_or(0)
    }

    pub(crate) fn selectors(&self, session: SessionId) -> Vec<TopicSelector> {
        self.state
            .read()
            .sessions
            .get(&session)
            .map(|entry| entry.registrations.iter().map(|r| r.selector.clone()).collect())
            .unwrap_or_default()
    }
}
