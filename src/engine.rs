//! The engine façade tying the topic tree, subscriptions, sessions and
//! delivery together.
//!
//! Locks are always taken in this order: the tree lock, the topic view
//! table, one topic's state, the subscription registry, the session table,
//! then a session's own lifecycle and queue. No two topic states are ever
//! held together, and user handlers (routing, authorization, missing
//! topics, requests) run with no lock held.

use crate::clock::{Clock, SystemClock};
use crate::completion::Completion;
use crate::config::EngineConfig;
use crate::delivery::dispatcher::{Dispatcher, Overflowed};
use crate::delivery::{Delivery, QueueEvent, UnsubscribeReason, UpdateEvent};
use crate::error::{AddFailureReason, EngineError, Result};
use crate::messaging::{FilterRequest, FilterResponse, Registered, Request, RequestHandler, RequestHandlers, Responder};
use crate::selectors::{FetchRequest, FetchResult, FetchedTopic, TopicSelector};
use crate::sessions::{
    establish, run_recovery, AuthDecision, Authenticator, AuthenticatorChain, Authorizer,
    CloseReason, InitialRetryStrategy, LockScope, LockTable, RecoveryOutcome, Session,
    SessionEvent, SessionFilter, SessionLifecycle, SessionLock, SessionOptions,
    SessionProperties, SessionTable, TopicPermission,
};
use crate::subscriptions::registry::{Binding, SubscriptionRegistry};
use crate::subscriptions::RoutingHandler;
use crate::topics::missing::{MissingTopicHandler, MissingTopicNotification, MissingTopics, Resume};
use crate::topics::notifications::{
    ListenerId, NotificationListener, TopicEvent, TopicEventListeners, TopicNotificationKind,
    TopicNotifications,
};
use crate::topics::removal::PolicyInputs;
use crate::topics::tree::{TopicNode, TopicState, TopicTree};
use crate::topics::views::{mirrored, reference_specification, TopicView, TopicViews, ViewDefinition};
use crate::types::{
    AddOutcome, SessionId, SessionState, Sequence, Timestamp, TopicSpecification, TopicType,
    TypeFilter,
};
use crate::values::{PatchOperation, RangeQuery, TimeSeriesEvent, TopicValue, UpdateConstraint};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Capacity of the queue event and session event channels.
const EVENT_BUFFER: usize = 1024;

/// Author recorded on time series events copied by topic views.
const VIEW_AUTHOR: &str = "$TopicView";

/// The topic engine.
///
/// Provides a unified interface for:
/// - Opening, recovering and closing sessions
/// - Adding, updating and removing topics
/// - Subscribing sessions to selectors and delivering updates to their queues
/// - Fetching, locks, notifications and removal policies
/// - Topic views and request/response messaging
pub struct Engine {
    /// Engine configuration.
    config: EngineConfig,

    /// Time source.
    clock: Arc<dyn Clock>,

    /// All topics.
    tree: TopicTree,

    /// Selector registrations and bindings per session.
    registry: SubscriptionRegistry,

    /// Live sessions.
    sessions: SessionTable,

    /// Final states and close times of recently closed sessions, so later
    /// calls report `SessionClosed`. Kept for `closed_session_retention`.
    closed: RwLock<HashMap<SessionId, (SessionState, Timestamp)>>,

    /// Named session locks.
    locks: Arc<LockTable>,

    /// Missing-topic handlers and the requests waiting on them.
    missing: Arc<MissingTopics>,

    /// Topic views and their reference topics.
    views: TopicViews,

    /// Request handlers by branch and request streams by session.
    requests: RequestHandlers,

    notifications: TopicNotifications,
    topic_events: TopicEventListeners,
    authenticators: AuthenticatorChain,
    authorizer: RwLock<Option<Arc<dyn Authorizer>>>,
    routing: RwLock<Option<Arc<dyn RoutingHandler>>>,

    queue_events: (Sender<QueueEvent>, Receiver<QueueEvent>),
    session_events: (Sender<SessionEvent>, Receiver<SessionEvent>),

    next_session: AtomicU64,

    /// Handle to ourselves for continuations of suspended requests.
    me: Weak<Engine>,
}

impl Engine {
    /// Create an engine reading the wall clock.
    pub fn new(config: EngineConfig) -> Arc<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create an engine with an explicit time source.
    pub fn with_clock(config: EngineConfig, clock: Arc<dyn Clock>) -> Arc<Self> {
        info!(
            reconnection_timeout_ms = config.reconnection_timeout.as_millis() as u64,
            high_watermark = config.queue.high_watermark,
            "engine created"
        );
        Arc::new_cyclic(|me| Self {
            config,
            clock,
            tree: TopicTree::default(),
            registry: SubscriptionRegistry::default(),
            sessions: SessionTable::default(),
            closed: RwLock::new(HashMap::new()),
            locks: LockTable::new(),
            missing: Arc::new(MissingTopics::default()),
            views: TopicViews::default(),
            requests: RequestHandlers::default(),
            notifications: TopicNotifications::default(),
            topic_events: TopicEventListeners::default(),
            authenticators: AuthenticatorChain::default(),
            authorizer: RwLock::new(None),
            routing: RwLock::new(None),
            queue_events: bounded(EVENT_BUFFER),
            session_events: bounded(EVENT_BUFFER),
            next_session: AtomicU64::new(1),
            me: me.clone(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    fn dispatcher(&self, now: Timestamp) -> Dispatcher<'_> {
        Dispatcher {
            registry: &self.registry,
            sessions: &self.sessions,
            topic_events: &self.topic_events,
            now,
        }
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Authenticate and open a session.
    pub fn open_session(&self, options: SessionOptions) -> Result<SessionId> {
        let SessionOptions {
            principal,
            credentials,
            properties,
            reconnection,
            ..
        } = options;

        let granted = match self
            .authenticators
            .authenticate(&principal, &credentials, &properties)
        {
            AuthDecision::Allow(granted) => granted,
            AuthDecision::Deny | AuthDecision::Abstain => {
                warn!(principal = %principal, "authentication denied");
                return Err(EngineError::SessionEstablishment(format!(
                    "authentication denied for '{}'",
                    principal
                )));
            }
        };

        let id = SessionId(self.next_session.fetch_add(1, Ordering::SeqCst));
        let now = self.clock.now();
        let mut lifecycle = SessionLifecycle::new(id, self.config.reconnection_timeout);
        lifecycle.connected()?;
        let queue = crate::delivery::SessionQueue::new(
            id,
            self.config.queue.clone(),
            self.queue_events.0.clone(),
        );
        let session = Arc::new(Session::new(
            id,
            principal,
            properties,
            granted,
            lifecycle,
            queue,
            reconnection,
            now,
        ));

        self.registry.add_session(id);
        self.sessions.insert(Arc::clone(&session));
        info!(session = %id, principal = %session.principal, "session opened");
        self.publish(SessionEvent {
            session: id,
            from: SessionState::Connecting,
            to: SessionState::ConnectedActive,
            reason: None,
        });
        Ok(id)
    }

    /// Open a session once `connect` manages to reach the engine, retrying
    /// per the options' initial retry strategy. `connect` returns `Ok(false)`
    /// for a transient failure.
    pub fn open_session_with_retry(
        &self,
        options: SessionOptions,
        mut connect: impl FnMut(u32) -> Result<bool>,
    ) -> Result<SessionId> {
        let strategy = options
            .initial_retry
            .clone()
            .unwrap_or_else(InitialRetryStrategy::none);
        establish(&strategy, self.clock.as_ref(), |attempt| {
            Ok(connect(attempt)?.then_some(()))
        })?;
        self.open_session(options)
    }

    /// Close a session at the client's request.
    pub fn close_session(&self, id: SessionId) -> Result<()> {
        let session = self.session(id)?;
        self.close(&session, SessionState::ClosedByClient, CloseReason::ClosedByClient)
    }

    /// Close a session from the server side.
    pub fn close_session_by_server(&self, id: SessionId) -> Result<()> {
        let session = self.session(id)?;
        self.close(&session, SessionState::ClosedByServer, CloseReason::ClosedByController)
    }

    /// The transport lost the session's connection.
    ///
    /// With reconnection enabled the session enters recovery and keeps its
    /// subscriptions and queue; otherwise it closes at once.
    pub fn connection_lost(&self, id: SessionId) -> Result<SessionState> {
        let session = self.session(id)?;
        let now = self.clock.now();
        let (from, to) = {
            let mut lifecycle = session.lifecycle.lock();
            let from = lifecycle.state();
            (from, lifecycle.connection_lost(now)?)
        };
        if from == to {
            return Ok(to);
        }
        self.publish(SessionEvent {
            session: id,
            from,
            to,
            reason: to.is_closed().then_some(CloseReason::ConnectionLost),
        });
        if to.is_closed() {
            self.release(&session, to);
        } else {
            let released = self.locks.release_session(id, false);
            if !released.is_empty() {
                debug!(session = %id, locks = ?released, "locks released on connection loss");
            }
        }
        Ok(to)
    }

    /// The transport restored the session's connection. Fails with
    /// `SessionClosed` if the recovery window has passed.
    pub fn reconnected(&self, id: SessionId) -> Result<()> {
        let session = self.session_any(id)?;
        let now = self.clock.now();
        let (from, result, to) = {
            let mut lifecycle = session.lifecycle.lock();
            let from = lifecycle.state();
            let result = lifecycle.reconnected(now);
            (from, result, lifecycle.state())
        };
        if from != to {
            self.publish(SessionEvent {
                session: id,
                from,
                to,
                reason: to.is_closed().then_some(CloseReason::ConnectionLost),
            });
            if to.is_closed() {
                self.release(&session, to);
            } else {
                info!(session = %id, queued = session.queue.len(), "session reconnected");
            }
        }
        result
    }

    /// Drive the session's reconnection strategy. `attempt` tries to
    /// restore the transport and reports success. A session the strategy
    /// gives up on, or that runs out of time, is closed by the server.
    pub fn recover_session(
        &self,
        id: SessionId,
        attempt: impl FnMut(u32) -> bool,
    ) -> Result<RecoveryOutcome> {
        let session = self.session(id)?;
        let strategy = session.reconnection.clone().ok_or_else(|| {
            EngineError::InvalidOperation(format!("session {} has no reconnection strategy", id))
        })?;
        let (timeout, disconnected_at) = {
            let lifecycle = session.lifecycle.lock();
            match (lifecycle.state(), lifecycle.disconnected_at()) {
                (SessionState::RecoveringReconnect, Some(at)) => (lifecycle.reconnection_timeout(), at),
                (state, _) => {
                    return Err(EngineError::InvalidOperation(format!(
                        "session {} is not recovering ({:?})",
                        id, state
                    )))
                }
            }
        };

        let outcome = run_recovery(&strategy, timeout, disconnected_at, self.clock.as_ref(), attempt);
        match outcome {
            RecoveryOutcome::Reconnected { .. } => self.reconnected(id)?,
            RecoveryOutcome::Aborted { attempts } | RecoveryOutcome::TimedOut { attempts } => {
                warn!(session = %id, attempts, ?outcome, "reconnection failed");
                if self
                    .close(&session, SessionState::ClosedByServer, CloseReason::ConnectionLost)
                    .is_err()
                {
                    debug!(session = %id, "session already closed");
                }
            }
        }
        Ok(outcome)
    }

    /// Close every session whose recovery window has passed, and forget
    /// sessions closed longer ago than the retention period.
    pub fn expire_sessions(&self) -> Vec<SessionId> {
        let now = self.clock.now();
        self.prune_closed(now);
        let mut expired = Vec::new();
        for session in self.sessions.all() {
            if session.lifecycle.lock().expire(now) {
                self.publish(SessionEvent {
                    session: session.id,
                    from: SessionState::RecoveringReconnect,
                    to: SessionState::ClosedByServer,
                    reason: Some(CloseReason::ConnectionLost),
                });
                self.release(&session, SessionState::ClosedByServer);
                expired.push(session.id);
            }
        }
        expired
    }

    pub fn session_state(&self, id: SessionId) -> Result<SessionState> {
        if let Some(session) = self.sessions.get(id) {
            return Ok(session.state());
        }
        self.closed
            .read()
            .get(&id)
            .map(|(state, _)| *state)
            .ok_or(EngineError::UnknownSession(id))
    }

    /// Number of closed sessions still remembered.
    pub fn closed_session_count(&self) -> usize {
        self.closed.read().len()
    }

    fn prune_closed(&self, now: Timestamp) {
        let retention = self.config.closed_session_retention;
        let mut closed = self.closed.write();
        let before = closed.len();
        closed.retain(|_, (_, at)| now.since(*at) < retention);
        if closed.len() < before {
            debug!(forgotten = before - closed.len(), "closed sessions forgotten");
        }
    }

    pub fn session_properties(&self, id: SessionId) -> Result<SessionProperties> {
        Ok(self.session(id)?.properties())
    }

    /// Merge user properties into a session. An empty value removes one.
    pub fn set_session_properties(
        &self,
        id: SessionId,
        changes: &SessionProperties,
    ) -> Result<SessionProperties> {
        Ok(self.session(id)?.merge_properties(changes))
    }

    /// Open sessions, in no particular order.
    pub fn sessions(&self) -> Vec<SessionId> {
        self.sessions.all().iter().map(|s| s.id).collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Channel of session state changes.
    pub fn session_events(&self) -> Receiver<SessionEvent> {
        self.session_events.1.clone()
    }

    /// An open session.
    fn session(&self, id: SessionId) -> Result<Arc<Session>> {
        let session = self.session_any(id)?;
        session.lifecycle.lock().ensure_open()?;
        Ok(session)
    }

    /// A session still in the table, which may be on its way to closing.
    fn session_any(&self, id: SessionId) -> Result<Arc<Session>> {
        match self.sessions.get(id) {
            Some(session) => Ok(session),
            None if self.closed.read().contains_key(&id) => Err(EngineError::SessionClosed(id)),
            None => Err(EngineError::UnknownSession(id)),
        }
    }

    fn publish(&self, event: SessionEvent) {
        if self.session_events.0.try_send(event).is_err() {
            debug!("session event channel full, event dropped");
        }
    }

    fn close(&self, session: &Arc<Session>, to: SessionState, reason: CloseReason) -> Result<()> {
        let from = {
            let mut lifecycle = session.lifecycle.lock();
            let from = lifecycle.state();
            if !lifecycle.close(to) {
                return Err(EngineError::SessionClosed(session.id));
            }
            from
        };
        self.publish(SessionEvent {
            session: session.id,
            from,
            to,
            reason: Some(reason),
        });
        self.release(session, to);
        Ok(())
    }

    /// Free everything a closed session held.
    fn release(&self, session: &Arc<Session>, state: SessionState) {
        let id = session.id;
        let now = self.clock.now();
        self.prune_closed(now);
        self.closed.write().insert(id, (state, now));
        self.sessions.remove(id);

        let bindings = self.registry.remove_session(id);
        let unsubscribed = bindings.len();
        self.deactivate_all(bindings, UnsubscribeReason::SessionClosed);
        let locks = self.locks.release_session(id, true);
        self.missing.discard_session(id);
        let handlers = self.requests.discard_session(id);
        if handlers > 0 {
            debug!(session = %id, handlers, "request handlers discarded");
        }
        session.queue.clear();
        info!(session = %id, ?state, unsubscribed, locks = locks.len(), "session released");

        let nodes: Vec<Arc<TopicNode>> = self.tree.read().nodes().cloned().collect();
        let mut owner_policy = false;
        for node in nodes {
            let mut topic = node.state.lock();
            if topic.owner == Some(id) {
                topic.owner_closed = true;
                owner_policy |= topic
                    .removal
                    .as_ref()
                    .is_some_and(|(policy, _)| policy.on_session_close());
            }
        }
        if owner_policy {
            self.evaluate_removal_policies();
        }
    }

    fn close_overflowed(&self, overflowed: Overflowed) {
        for id in overflowed.0 {
            let Some(session) = self.sessions.get(id) else {
                continue;
            };
            warn!(session = %id, depth = session.queue.len(), "closing session with overflowing queue");
            // Already closing if this fails.
            let _ = self.close(&session, SessionState::ClosedByServer, CloseReason::QueueOverflow);
        }
    }

    // ------------------------------------------------------------------
    // Security
    // ------------------------------------------------------------------

    /// Append an authentication handler to the chain.
    pub fn add_authenticator(&self, handler: impl Authenticator + 'static) {
        self.authenticators.push(Arc::new(handler));
    }

    pub fn set_authorizer(&self, authorizer: impl Authorizer + 'static) {
        *self.authorizer.write() = Some(Arc::new(authorizer));
    }

    fn permitted(&self, session: &Session, permission: TopicPermission, path: &str) -> bool {
        let Some(authorizer) = self.authorizer.read().clone() else {
            return true;
        };
        authorizer
            .authorize(&session.principal, &session.properties(), permission, path)
            .unwrap_or(true)
    }

    fn authorize(&self, session: &Session, permission: TopicPermission, path: &str) -> Result<()> {
        if self.permitted(session, permission, path) {
            Ok(())
        } else {
            Err(EngineError::PermissionDenied(format!(
                "{:?} permission on '{}' denied to session {}",
                permission, path, session.id
            )))
        }
    }

    /// Re-check read permission on every topic a session is subscribed to,
    /// unsubscribing it from topics it may no longer read.
    pub fn refresh_permissions(&self, id: SessionId) -> Result<usize> {
        let session = self.session(id)?;
        let lost: Vec<Binding> = self
            .registry
            .bindings(id)
            .into_iter()
            .filter(|b| !self.permitted(&session, TopicPermission::Read, &b.presented))
            .filter_map(|b| self.registry.unbind(id, &b.presented))
            .collect();
        let count = lost.len();
        if count > 0 {
            info!(session = %id, count, "subscriptions revoked");
        }
        self.deactivate_all(lost, UnsubscribeReason::Authorization);
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Topics
    // ------------------------------------------------------------------

    /// Add a topic. Adding an identical topic again reports `Exists`.
    pub fn add_topic(
        &self,
        session: SessionId,
        path: &str,
        specification: &TopicSpecification,
    ) -> Result<AddOutcome> {
        self.create_topic(session, path, specification, None, &UpdateConstraint::Unconstrained)
    }

    /// Add a topic with an initial value, or set the value of an existing
    /// identical topic. `NoTopic` constraints fail if the topic exists.
    pub fn add_and_set(
        &self,
        session: SessionId,
        path: &str,
        specification: &TopicSpecification,
        value: TopicValue,
        constraint: &UpdateConstraint,
    ) -> Result<AddOutcome> {
        match self.create_topic(session, path, specification, Some(value.clone()), constraint)? {
            AddOutcome::Created => Ok(AddOutcome::Created),
            AddOutcome::Exists => {
                self.set(session, path, value, constraint)?;
                Ok(AddOutcome::Exists)
            }
        }
    }

    fn create_topic(
        &self,
        session: SessionId,
        path: &str,
        specification: &TopicSpecification,
        initial: Option<TopicValue>,
        constraint: &UpdateConstraint,
    ) -> Result<AddOutcome> {
        let owner = self.session(session)?;
        if !self.permitted(&owner, TopicPermission::Modify, path) {
            return Err(EngineError::TopicAddFailed {
                path: path.to_string(),
                reason: AddFailureReason::PermissionDenied,
            });
        }
        let now = self.clock.now();

        let (node, selecting) = {
            let mut map = self.tree.write();
            if self.views.is_reference(path) {
                return Err(EngineError::TopicAddFailed {
                    path: path.to_string(),
                    reason: AddFailureReason::ExclusiveUpdaterConflict,
                });
            }
            if map.get(path).is_none() {
                constraint.check(session, None, self.locks.as_ref())?;
            }
            let (outcome, node) = map.add(
                path,
                specification,
                Some(session),
                self.config.time_series_retained_events,
                now,
            )?;
            if outcome == AddOutcome::Exists {
                return Ok(outcome);
            }
            if let Some(value) = initial {
                let applied = node.state.lock().set(&node, value, &owner.principal, now);
                if let Err(e) = applied {
                    map.remove(path);
                    return Err(e);
                }
            }
            let selecting = self.registry.sessions_selecting(path, specification.topic_type);
            (node, selecting)
        };

        info!(path, topic_type = specification.topic_type.name(), session = %session, "topic added");
        self.announce(&node, selecting);
        for view in self.views.selecting(path) {
            self.add_reference(&view, &node);
        }
        Ok(AddOutcome::Created)
    }

    /// Notify listeners of a new topic and subscribe the sessions selecting it.
    fn announce(&self, node: &Arc<TopicNode>, selecting: Vec<SessionId>) {
        self.notifications
            .notify(&node.path, &node.specification, TopicNotificationKind::Added);
        let pairs = selecting
            .into_iter()
            .filter_map(|id| self.sessions.get(id))
            .map(|s| (s, Arc::clone(node)))
            .collect();
        self.bind_and_activate(pairs);
    }

    /// Remove the topics `selector` matches. An exact path removes only that
    /// topic; descendants go only when the selector names them.
    pub fn remove_topics(&self, session: SessionId, selector: &str) -> Result<usize> {
        let selector = TopicSelector::compile(selector)?;
        let requester = self.session(session)?;
        let candidates: Vec<String> = self
            .tree
            .read()
            .matching(&selector)
            .iter()
            .map(|n| n.path.clone())
            .collect();
        let allowed: Vec<String> = candidates
            .into_iter()
            .filter(|path| !self.views.is_reference(path))
            .filter(|path| self.permitted(&requester, TopicPermission::Modify, path))
            .collect();
        if allowed.is_empty() {
            if let Some(path) = selector.exact_path() {
                if self.tree.get(path).is_some() {
                    return Err(EngineError::PermissionDenied(format!(
                        "Modify permission on '{}' denied to session {}",
                        path, session
                    )));
                }
            }
        }
        Ok(self.remove_paths(&allowed))
    }

    fn remove_paths(&self, paths: &[String]) -> usize {
        let now = self.clock.now();
        let dispatcher = self.dispatcher(now);
        let mut overflowed = Overflowed::default();
        let mut removed: Vec<Arc<TopicNode>> = Vec::new();
        // Routing subscriptions whose delivery state lives on another topic.
        let mut detached: Vec<Binding> = Vec::new();
        {
            let mut map = self.tree.write();
            for path in paths {
                let Some(node) = map.remove(path) else {
                    continue;
                };
                let mut state = node.state.lock();
                state.removed = true;
                for binding in self.registry.unbind_path(path) {
                    if binding.target == *path {
                        dispatcher.deactivate(
                            &node,
                            &mut state,
                            binding.session,
                            &binding.presented,
                            UnsubscribeReason::Removal,
                            &mut overflowed,
                        );
                    } else {
                        detached.push(binding);
                    }
                }
                let remaining: Vec<(SessionId, String)> = state.subscribers.keys().cloned().collect();
                for (session, presented) in remaining {
                    dispatcher.deactivate(
                        &node,
                        &mut state,
                        session,
                        &presented,
                        UnsubscribeReason::Removal,
                        &mut overflowed,
                    );
                }
                drop(state);
                removed.push(node);
            }
        }
        for binding in detached {
            if let Some(target) = self.tree.get(&binding.target) {
                let mut state = target.state.lock();
                dispatcher.deactivate(
                    &target,
                    &mut state,
                    binding.session,
                    &binding.presented,
                    UnsubscribeReason::Removal,
                    &mut overflowed,
                );
            }
        }
        for node in &removed {
            debug!(path = %node.path, "topic removed");
            self.notifications
                .notify(&node.path, &node.specification, TopicNotificationKind::Removed);
        }
        if !removed.is_empty() {
            info!(count = removed.len(), "topics removed");
        }
        self.close_overflowed(overflowed);

        let mut references = Vec::new();
        for node in &removed {
            self.views.forget(&node.path);
            references.extend(self.views.references_of(&node.path));
        }
        if !references.is_empty() {
            debug!(count = references.len(), "removing references of removed topics");
            self.remove_paths(&references);
        }
        removed.len()
    }

    /// A snapshot of one topic.
    pub fn topic(&self, path: &str) -> Option<FetchedTopic> {
        let node = self.tree.get(path)?;
        let value = node.state.lock().value.clone();
        Some(FetchedTopic {
            path: node.path.clone(),
            topic_type: node.topic_type(),
            specification: Some(node.specification.clone()),
            value,
        })
    }

    pub fn topic_count(&self) -> usize {
        self.tree.read().len()
    }

    /// All topic paths in order.
    pub fn topic_paths(&self) -> Vec<String> {
        self.tree.read().paths().cloned().collect()
    }

    /// Apply an update to one topic under its lock, then deliver it.
    fn update(
        &self,
        session: SessionId,
        path: &str,
        constraint: &UpdateConstraint,
        apply: impl FnOnce(&mut TopicState, &TopicNode, &str, Timestamp) -> Result<UpdateEvent>,
    ) -> Result<UpdateEvent> {
        let updater = self.session(session)?;
        self.authorize(&updater, TopicPermission::Update, path)?;
        if let Some(view) = self.views.maintainer(path) {
            return Err(EngineError::InvalidUpdate {
                path: path.to_string(),
                reason: format!("maintained by topic view '{}'", view),
            });
        }
        let node = self
            .tree
            .get(path)
            .ok_or_else(|| EngineError::NoSuchTopic(path.to_string()))?;
        let now = self.clock.now();
        let mut overflowed = Overflowed::default();
        let event = {
            let mut state = node.state.lock();
            if state.removed {
                return Err(EngineError::NoSuchTopic(path.to_string()));
            }
            constraint.check(session, Some(state.value.as_ref()), self.locks.as_ref())?;
            let event = apply(&mut state, &node, &updater.principal, now)?;
            self.dispatcher(now)
                .fan_out(&node, &mut state, &event, &mut overflowed);
            event
        };
        trace!(path, sequence = event.sequence.0, delta = event.is_delta(), "topic updated");
        self.close_overflowed(overflowed);
        self.propagate(path, &event);
        Ok(event)
    }

    /// Set a topic's value if `constraint` holds. On a time series topic
    /// the value is appended as an event.
    pub fn set(
        &self,
        session: SessionId,
        path: &str,
        value: TopicValue,
        constraint: &UpdateConstraint,
    ) -> Result<UpdateEvent> {
        self.update(session, path, constraint, |state, node, author, now| {
            state.set(node, value, author, now)
        })
    }

    /// Apply JSON patch operations to a JSON topic, all or nothing.
    pub fn apply_json_patch(
        &self,
        session: SessionId,
        path: &str,
        operations: &[PatchOperation],
        constraint: &UpdateConstraint,
    ) -> Result<UpdateEvent> {
        self.update(session, path, constraint, |state, node, _, now| {
            state.patch(node, operations, now)
        })
    }

    /// Append an event to a time series topic, returning its sequence.
    pub fn append(&self, session: SessionId, path: &str, value: TopicValue) -> Result<Sequence> {
        let event = self.update(session, path, &UpdateConstraint::Unconstrained, |state, node, author, now| {
            state.append(node, value, author, now)
        })?;
        Ok(event.sequence)
    }

    /// Append an event with an explicit timestamp.
    pub fn append_at(
        &self,
        session: SessionId,
        path: &str,
        value: TopicValue,
        timestamp: Timestamp,
    ) -> Result<Sequence> {
        let event = self.update(session, path, &UpdateConstraint::Unconstrained, |state, node, author, _| {
            state.append(node, value, author, timestamp)
        })?;
        Ok(event.sequence)
    }

    /// Edit an earlier event, returning the sequence of the edit event.
    pub fn edit(
        &self,
        session: SessionId,
        path: &str,
        sequence: Sequence,
        value: TopicValue,
    ) -> Result<Sequence> {
        let event = self.update(session, path, &UpdateConstraint::Unconstrained, |state, node, author, now| {
            state.edit(node, sequence, value, author, now)
        })?;
        Ok(event.sequence)
    }

    /// Query a time series topic's retained events.
    pub fn time_series_query(
        &self,
        session: SessionId,
        path: &str,
        query: &RangeQuery,
    ) -> Result<Vec<TimeSeriesEvent>> {
        let reader = self.session(session)?;
        self.authorize(&reader, TopicPermission::Read, path)?;
        let node = self
            .tree
            .get(path)
            .ok_or_else(|| EngineError::NoSuchTopic(path.to_string()))?;
        let state = node.state.lock();
        let series = state.series.as_ref().ok_or_else(|| EngineError::InvalidUpdate {
            path: path.to_string(),
            reason: "not a time series topic".to_string(),
        })?;
        Ok(series.query(query))
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Subscribe a session to every topic `selector` matches, now and later.
    /// Resolves to the number of topics the selector currently matches for
    /// the session.
    pub fn subscribe(&self, session: SessionId, selector: &str) -> Completion<usize> {
        self.subscribe_with_filter(session, selector, TypeFilter::Any)
    }

    /// Subscribe, limited to topics whose type `filter` accepts.
    pub fn subscribe_with_filter(
        &self,
        session: SessionId,
        selector: &str,
        filter: TypeFilter,
    ) -> Completion<usize> {
        let selector = match TopicSelector::compile(selector) {
            Ok(selector) => selector,
            Err(e) => return Completion::ready(Err(e)),
        };
        if let Err(e) = self.session(session) {
            return Completion::ready(Err(e));
        }
        let deferred_selector = selector.clone();
        let deferred_filter = filter.clone();
        if let Some(completion) = self.defer_if_missing(session, &selector, move |engine| {
            engine.subscribe_now(session, deferred_selector, deferred_filter)
        }) {
            return completion;
        }
        Completion::ready(self.subscribe_now(session, selector, filter))
    }

    fn subscribe_now(&self, id: SessionId, selector: TopicSelector, filter: TypeFilter) -> Result<usize> {
        let session = self.session(id)?;
        self.registry.register(id, selector.clone(), filter.clone())?;
        let pairs = self
            .tree
            .read()
            .matching(&selector)
            .into_iter()
            .filter(|node| node.topic_type() == TopicType::Routing || filter.accepts(node.topic_type()))
            .map(|node| (Arc::clone(&session), node))
            .collect();
        self.bind_and_activate(pairs);
        let matched = self.registry.matched_count(id, &selector);
        debug!(session = %id, selector = selector.expression(), matched, "subscribed");
        Ok(matched)
    }

    /// Bind each (session, topic) pair the session may read, resolving
    /// routing topics, then start delivery.
    fn bind_and_activate(&self, pairs: Vec<(Arc<Session>, Arc<TopicNode>)>) {
        let mut planned = Vec::with_capacity(pairs.len());
        for (session, node) in pairs {
            if !self.permitted(&session, TopicPermission::Read, &node.path) {
                continue;
            }
            let target = if node.topic_type() == TopicType::Routing {
                match self.route(&session, &node.path) {
                    Some(target) => target,
                    None => continue,
                }
            } else {
                node.path.clone()
            };
            planned.push((session.id, node, target));
        }

        let mut activations = Vec::new();
        {
            let map = self.tree.read();
            for (session, node, target) in planned {
                let current = map.get(&node.path).is_some_and(|n| Arc::ptr_eq(n, &node));
                let Some(target_node) = map.get(&target).filter(|t| t.topic_type() != TopicType::Routing)
                else {
                    continue;
                };
                if current && self.registry.bind(session, &node.path, target_node.topic_type(), &target) {
                    activations.push((session, node.path.clone(), Arc::clone(target_node)));
                }
            }
        }

        let dispatcher = self.dispatcher(self.clock.now());
        let mut overflowed = Overflowed::default();
        for (session, presented, node) in activations {
            let mut state = node.state.lock();
            dispatcher.activate(&node, &mut state, session, &presented, &mut overflowed);
        }
        self.close_overflowed(overflowed);
    }

    fn route(&self, session: &Session, path: &str) -> Option<String> {
        let Some(handler) = self.routing.read().clone() else {
            warn!(path, "routing topic selected but no routing handler is set");
            return None;
        };
        let target = handler.route(session.id, &session.properties(), path);
        if target.is_none() {
            debug!(session = %session.id, path, "routing handler declined");
        }
        target
    }

    fn deactivate_all(&self, bindings: Vec<Binding>, reason: UnsubscribeReason) {
        let dispatcher = self.dispatcher(self.clock.now());
        let mut overflowed = Overflowed::default();
        for binding in bindings {
            if let Some(node) = self.tree.get(&binding.target) {
                let mut state = node.state.lock();
                dispatcher.deactivate(
                    &node,
                    &mut state,
                    binding.session,
                    &binding.presented,
                    reason,
                    &mut overflowed,
                );
            }
        }
        self.close_overflowed(overflowed);
    }

    /// Withdraw a selector. Topics still covered by another of the session's
    /// selectors stay subscribed.
    pub fn unsubscribe(&self, session: SessionId, selector: &str) -> Result<usize> {
        let selector = TopicSelector::compile(selector)?;
        self.session(session)?;
        let dropped = self.registry.unregister(session, &selector)?;
        let count = dropped.len();
        self.deactivate_all(dropped, UnsubscribeReason::Requested);
        debug!(session = %session, selector = selector.expression(), count, "unsubscribed");
        Ok(count)
    }

    /// Subscribe every open session whose properties match `filter`.
    /// Returns the number of sessions subscribed.
    pub fn subscribe_by_filter(&self, filter: &str, selector: &str) -> Result<usize> {
        let filter = SessionFilter::parse(filter)?;
        let selector = TopicSelector::compile(selector)?;
        let mut count = 0;
        for session in self.matching_sessions(&filter) {
            match self.subscribe_now(session, selector.clone(), TypeFilter::Any) {
                Ok(_) => count += 1,
                Err(e) => debug!(session = %session, error = %e, "filter subscription skipped"),
            }
        }
        info!(filter = filter.expression(), selector = selector.expression(), count, "subscribed by filter");
        Ok(count)
    }

    /// Unsubscribe every open session whose properties match `filter`.
    pub fn unsubscribe_by_filter(&self, filter: &str, selector: &str) -> Result<usize> {
        let filter = SessionFilter::parse(filter)?;
        let selector = TopicSelector::compile(selector)?;
        let mut count = 0;
        for session in self.matching_sessions(&filter) {
            if let Ok(dropped) = self.registry.unregister(session, &selector) {
                self.deactivate_all(dropped, UnsubscribeReason::Control);
                count += 1;
            }
        }
        info!(filter = filter.expression(), selector = selector.expression(), count, "unsubscribed by filter");
        Ok(count)
    }

    fn matching_sessions(&self, filter: &SessionFilter) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self
            .sessions
            .all()
            .into_iter()
            .filter(|s| !s.state().is_closed() && filter.matches(&s.properties()))
            .map(|s| s.id)
            .collect();
        ids.sort();
        ids
    }

    /// The selectors a session has registered.
    pub fn selectors(&self, session: SessionId) -> Result<Vec<TopicSelector>> {
        self.session(session)?;
        Ok(self.registry.selectors(session))
    }

    /// Paths the session is currently subscribed to.
    pub fn subscriptions(&self, session: SessionId) -> Result<Vec<String>> {
        self.session(session)?;
        Ok(self
            .registry
            .bindings(session)
            .into_iter()
            .map(|b| b.presented)
            .collect())
    }

    /// Fetch the current state of matching topics.
    pub fn fetch(&self, session: SessionId, selector: &str, request: FetchRequest) -> Completion<FetchResult> {
        let selector = match TopicSelector::compile(selector) {
            Ok(selector) => selector,
            Err(e) => return Completion::ready(Err(e)),
        };
        if let Err(e) = self.session(session) {
            return Completion::ready(Err(e));
        }
        let deferred_selector = selector.clone();
        let deferred_request = request.clone();
        if let Some(completion) = self.defer_if_missing(session, &selector, move |engine| {
            engine.fetch_now(session, &deferred_selector, &deferred_request)
        }) {
            return completion;
        }
        Completion::ready(self.fetch_now(session, &selector, &request))
    }

    fn fetch_now(&self, id: SessionId, selector: &TopicSelector, request: &FetchRequest) -> Result<FetchResult> {
        let session = self.session(id)?;
        let nodes: Vec<Arc<TopicNode>> = self
            .tree
            .read()
            .matching(selector)
            .into_iter()
            .filter(|n| request.accepts_type(n.topic_type()))
            .collect();
        let readable: Vec<Arc<TopicNode>> = nodes
            .into_iter()
            .filter(|n| self.permitted(&session, TopicPermission::Read, &n.path))
            .collect();
        let (page, has_more) = request.select(readable, |n| n.path.as_str());
        let topics = page
            .into_iter()
            .map(|node| FetchedTopic {
                path: node.path.clone(),
                topic_type: node.topic_type(),
                specification: request
                    .wants_properties()
                    .then(|| node.specification.clone()),
                value: if request.wants_values() {
                    node.state.lock().value.clone()
                } else {
                    None
                },
            })
            .collect();
        Ok(FetchResult { topics, has_more })
    }

    // ------------------------------------------------------------------
    // Missing topics and routing
    // ------------------------------------------------------------------

    /// Handle requests that match nothing under `branch`.
    pub fn set_missing_topic_handler(
        &self,
        branch: &str,
        handler: impl MissingTopicHandler + 'static,
    ) -> Result<()> {
        self.missing.register(branch, Arc::new(handler))
    }

    pub fn remove_missing_topic_handler(&self, branch: &str) -> bool {
        self.missing.unregister(branch)
    }

    pub fn set_routing_handler(&self, handler: impl RoutingHandler + 'static) {
        *self.routing.write() = Some(Arc::new(handler));
    }

    /// Suspend a request whose selector matches nothing under a branch with
    /// a missing-topic handler. `run` completes it once the handler proceeds.
    fn defer_if_missing<T: Send + 'static>(
        &self,
        session: SessionId,
        selector: &TopicSelector,
        run: impl FnOnce(&Engine) -> Result<T> + Send + 'static,
    ) -> Option<Completion<T>> {
        let prefix = selector.path_prefix();
        let path = prefix.trim_end_matches('/');
        let handler = self.missing.handler_for(path)?;
        if !self.tree.read().matching(selector).is_empty() {
            return None;
        }

        let (completer, completion) = Completion::pending();
        let engine = self.me.clone();
        let resume: Resume = Box::new(move |result: Result<()>| {
            let outcome = result.and_then(|()| match engine.upgrade() {
                Some(engine) => run(&engine),
                None => Err(EngineError::OperationDiscarded("engine dropped".to_string())),
            });
            completer.complete(outcome);
        });
        let deadline = self.clock.now().plus(self.config.missing_topic_timeout);
        let (ticket, handle) = self.missing.defer(path, session, deadline, resume);

        let missing = Arc::downgrade(&self.missing);
        let withdrawn = path.to_string();
        let completion = completion.on_cancel(move || {
            if let Some(missing) = missing.upgrade() {
                missing.withdraw(&withdrawn, ticket);
            }
        });
        if let Some(handle) = handle {
            debug!(session = %session, path, selector = selector.expression(), "notifying missing topic handler");
            handler.on_missing_topic(MissingTopicNotification {
                session,
                path: path.to_string(),
                selector: selector.clone(),
                handle,
            });
        }
        Some(completion)
    }

    /// Fail requests whose missing-topic handler has not proceeded in time.
    pub fn expire_missing_topic_requests(&self) -> usize {
        self.missing.expire(self.clock.now())
    }

    pub fn pending_missing_topic_requests(&self) -> usize {
        self.missing.pending_count()
    }

    // ------------------------------------------------------------------
    // Topic views
    // ------------------------------------------------------------------

    /// Create or replace a topic view from a `map <selector> to <path>`
    /// expression, adding a reference topic for every topic it selects.
    pub fn create_topic_view(&self, session: SessionId, name: &str, expression: &str) -> Result<TopicView> {
        let creator = self.session(session)?;
        let view = Arc::new(ViewDefinition::parse(name, expression)?);
        self.authorize(&creator, TopicPermission::Modify, &view.target.literal_prefix())?;

        let replaced = self.views.define(Arc::clone(&view));
        self.remove_paths(&replaced);
        let sources: Vec<Arc<TopicNode>> = self
            .tree
            .read()
            .matching(&view.source)
            .into_iter()
            .filter(|node| !self.views.is_reference(&node.path))
            .collect();
        for source in &sources {
            self.add_reference(&view, source);
        }
        info!(view = name, expression, sources = sources.len(), "topic view created");
        Ok(TopicView {
            name: view.name.clone(),
            specification: view.expression.clone(),
        })
    }

    /// Remove a topic view and its reference topics. False if there was no
    /// such view.
    pub fn remove_topic_view(&self, session: SessionId, name: &str) -> Result<bool> {
        self.session(session)?;
        let Some(references) = self.views.remove(name) else {
            return Ok(false);
        };
        let removed = self.remove_paths(&references);
        info!(view = name, removed, "topic view removed");
        Ok(true)
    }

    pub fn topic_view(&self, name: &str) -> Option<TopicView> {
        self.views.get(name)
    }

    /// Topic views in name order.
    pub fn topic_views(&self) -> Vec<TopicView> {
        self.views.list()
    }

    /// Add `view`'s reference topic for `source`, unless its path is
    /// unmappable or taken.
    fn add_reference(&self, view: &ViewDefinition, source: &Arc<TopicNode>) {
        let Some(target) = view.target.expand(&source.path) else {
            debug!(view = %view.name, source = %source.path, "source path does not map");
            return;
        };
        let now = self.clock.now();
        let specification = reference_specification(&source.specification);
        let (node, selecting) = {
            let mut map = self.tree.write();
            if map.get(&target).is_some() {
                warn!(view = %view.name, source = %source.path, path = %target, "reference path is taken");
                return;
            }
            if !self.views.claim(&target, &view.name, &source.path) {
                return;
            }
            let node = match map.add(&target, &specification, None, self.config.time_series_retained_events, now) {
                Ok((_, node)) => node,
                Err(e) => {
                    self.views.forget(&target);
                    warn!(view = %view.name, path = %target, error = %e, "reference topic not added");
                    return;
                }
            };
            let value = source.state.lock().value.clone();
            if let Some(value) = value {
                if let Err(e) = node.state.lock().set(&node, mirrored(value), VIEW_AUTHOR, now) {
                    warn!(path = %target, error = %e, "reference topic value not copied");
                }
            }
            (node, self.registry.sessions_selecting(&target, specification.topic_type))
        };
        debug!(view = %view.name, source = %source.path, path = %target, "reference topic added");
        self.announce(&node, selecting);
    }

    /// Copy an update of a source topic to its reference topics.
    fn propagate(&self, source: &str, event: &UpdateEvent) {
        for target in self.views.references_of(source) {
            let Some(node) = self.tree.get(&target) else {
                continue;
            };
            let now = self.clock.now();
            let mut overflowed = Overflowed::default();
            {
                let mut state = node.state.lock();
                if state.removed {
                    continue;
                }
                match state.set(&node, mirrored(event.new_value.clone()), VIEW_AUTHOR, now) {
                    Ok(update) => self
                        .dispatcher(now)
                        .fan_out(&node, &mut state, &update, &mut overflowed),
                    Err(e) => warn!(source, path = %target, error = %e, "reference topic not updated"),
                }
            }
            self.close_overflowed(overflowed);
        }
    }

    // ------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------

    /// Handle requests sent to `path` or below it. Only the registering
    /// session may replace or remove the handler; it goes when the session
    /// closes.
    pub fn add_request_handler(
        &self,
        session: SessionId,
        path: &str,
        request_type: TopicType,
        response_type: TopicType,
        handler: impl RequestHandler + 'static,
    ) -> Result<()> {
        let owner = self.session(session)?;
        self.authorize(&owner, TopicPermission::Message, path)?;
        self.requests.add_handler(
            path,
            Registered {
                owner: session,
                request_type,
                response_type,
                handler: Arc::new(handler),
            },
        )
    }

    pub fn remove_request_handler(&self, session: SessionId, path: &str) -> Result<bool> {
        self.session(session)?;
        Ok(self.requests.remove_handler(session, path))
    }

    /// Receive requests sent to this session on exactly `path`.
    pub fn set_request_stream(
        &self,
        session: SessionId,
        path: &str,
        request_type: TopicType,
        response_type: TopicType,
        handler: impl RequestHandler + 'static,
    ) -> Result<()> {
        self.session(session)?;
        self.requests.set_stream(
            path,
            Registered {
                owner: session,
                request_type,
                response_type,
                handler: Arc::new(handler),
            },
        )
    }

    pub fn remove_request_stream(&self, session: SessionId, path: &str) -> Result<bool> {
        self.session(session)?;
        Ok(self.requests.remove_stream(session, path))
    }

    /// Send a request to the handler registered for `path`.
    pub fn send_request(&self, sender: SessionId, path: &str, value: TopicValue) -> Completion<TopicValue> {
        let prepared = self.prepare_request(sender, path, &value).and_then(|request| {
            let registered = self
                .requests
                .handler_for(path)
                .ok_or_else(|| EngineError::NoRequestHandler(path.to_string()))?;
            Ok((request, registered))
        });
        match prepared {
            Ok((request, registered)) => self.dispatch_request(request, &registered),
            Err(e) => Completion::ready(Err(e)),
        }
    }

    /// Send a request to the stream `target` registered for `path`.
    pub fn send_request_to_session(
        &self,
        sender: SessionId,
        target: SessionId,
        path: &str,
        value: TopicValue,
    ) -> Completion<TopicValue> {
        let prepared = self.prepare_request(sender, path, &value).and_then(|request| {
            self.session(target)?;
            let registered = self.requests.stream(target, path).ok_or_else(|| {
                EngineError::NoRequestHandler(format!("{} on session {}", path, target))
            })?;
            Ok((request, registered))
        });
        match prepared {
            Ok((request, registered)) => self.dispatch_request(request, &registered),
            Err(e) => Completion::ready(Err(e)),
        }
    }

    /// Send a request to every open session matching `filter` that has a
    /// stream for `path` accepting the value. Responses arrive on the
    /// returned channel as each session answers.
    pub fn send_request_to_filter(
        &self,
        sender: SessionId,
        filter: &str,
        path: &str,
        value: TopicValue,
    ) -> Result<FilterRequest> {
        let filter = SessionFilter::parse(filter)?;
        let request = self.prepare_request(sender, path, &value)?;
        let targets: Vec<(SessionId, Registered)> = self
            .matching_sessions(&filter)
            .into_iter()
            .filter_map(|id| self.requests.stream(id, path).map(|r| (id, r)))
            .filter(|(id, registered)| match registered.check_request(path, &value) {
                Ok(()) => true,
                Err(e) => {
                    debug!(session = %id, error = %e, "filtered request skipped");
                    false
                }
            })
            .collect();

        let (responses, receiver) = unbounded();
        for (session, registered) in &targets {
            let responses = responses.clone();
            let session = *session;
            let responder = Responder::new(
                path,
                registered.response_type,
                Box::new(move |result: Result<TopicValue>| {
                    // The sender may have stopped listening.
                    let _ = responses.send(FilterResponse { session, result });
                }),
            );
            registered.handler.on_request(request.clone(), responder);
        }
        info!(filter = filter.expression(), path, expected = targets.len(), "request sent to filter");
        Ok(FilterRequest {
            expected: targets.len(),
            responses: receiver,
        })
    }

    fn prepare_request(&self, sender: SessionId, path: &str, value: &TopicValue) -> Result<Request> {
        let session = self.session(sender)?;
        self.authorize(&session, TopicPermission::Message, path)?;
        Ok(Request {
            path: path.to_string(),
            sender,
            sender_properties: session.properties(),
            value: value.clone(),
        })
    }

    fn dispatch_request(&self, request: Request, registered: &Registered) -> Completion<TopicValue> {
        if let Err(e) = registered.check_request(&request.path, &request.value) {
            return Completion::ready(Err(e));
        }
        let (completer, completion) = Completion::pending();
        let responder = Responder::new(
            &request.path,
            registered.response_type,
            Box::new(move |result: Result<TopicValue>| {
                completer.complete(result);
            }),
        );
        trace!(path = %request.path, sender = %request.sender, handler = %registered.owner, "dispatching request");
        registered.handler.on_request(request, responder);
        completion
    }

    // ------------------------------------------------------------------
    // Locks
    // ------------------------------------------------------------------

    /// Acquire a named lock for a session. Waiters are served in order.
    pub fn lock(&self, session: SessionId, name: &str, scope: LockScope) -> Completion<SessionLock> {
        match self.session(session) {
            Ok(_) => self.locks.acquire(session, name, scope),
            Err(e) => Completion::ready(Err(e)),
        }
    }

    pub fn unlock(&self, session: SessionId, lock: &SessionLock) -> Result<()> {
        self.session(session)?;
        if lock.owner != session {
            return Err(EngineError::InvalidOperation(format!(
                "lock '{}' is not owned by session {}",
                lock.name, session
            )));
        }
        self.locks.release(lock)
    }

    pub fn lock_holder(&self, name: &str) -> Option<SessionLock> {
        self.locks.holder(name)
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    /// Register for topic notifications. Nothing is reported until a
    /// selection is made.
    pub fn topic_notifications(&self) -> NotificationListener {
        self.notifications.register()
    }

    pub fn select_notifications(&self, listener: ListenerId, selector: &str) -> Result<()> {
        let selector = TopicSelector::compile(selector)?;
        let existing = self.specifications(&selector);
        self.notifications.select(listener, selector, &existing)
    }

    pub fn deselect_notifications(&self, listener: ListenerId, selector: &str) -> Result<()> {
        let selector = TopicSelector::compile(selector)?;
        let existing = self.specifications(&selector);
        self.notifications.deselect(listener, &selector, &existing)
    }

    pub fn close_notifications(&self, listener: ListenerId) -> bool {
        self.notifications.close(listener)
    }

    fn specifications(&self, selector: &TopicSelector) -> Vec<(String, TopicSpecification)> {
        self.tree
            .read()
            .matching(selector)
            .iter()
            .map(|n| (n.path.clone(), n.specification.clone()))
            .collect()
    }

    /// Subscriber-count events for topics in `branch`.
    pub fn topic_events(&self, branch: &str) -> Receiver<TopicEvent> {
        self.topic_events.register(branch)
    }

    /// Queue threshold crossings of every session.
    pub fn queue_events(&self) -> Receiver<QueueEvent> {
        self.queue_events.1.clone()
    }

    // ------------------------------------------------------------------
    // Queues
    // ------------------------------------------------------------------

    pub fn set_conflated(&self, session: SessionId, conflate: bool) -> Result<()> {
        self.session(session)?.queue.set_conflated(conflate);
        Ok(())
    }

    pub fn set_throttled(&self, session: SessionId, interval: Option<Duration>) -> Result<()> {
        self.session(session)?.queue.set_throttled(interval);
        Ok(())
    }

    pub fn queue_depth(&self, session: SessionId) -> Result<usize> {
        Ok(self.session(session)?.queue.len())
    }

    /// Deliveries the session may be sent now.
    pub fn poll(&self, session: SessionId) -> Result<Vec<Delivery>> {
        let session = self.session(session)?;
        Ok(session.queue.poll(self.clock.now()))
    }

    /// Every queued delivery, ignoring throttling.
    pub fn drain(&self, session: SessionId) -> Result<Vec<Delivery>> {
        Ok(self.session(session)?.queue.drain())
    }

    // ------------------------------------------------------------------
    // Removal policies
    // ------------------------------------------------------------------

    /// Evaluate every topic's removal policy, removing the topics whose
    /// policies hold. Returns the number of topics removed.
    pub fn evaluate_removal_policies(&self) -> usize {
        let now = self.clock.now();
        let properties: Vec<SessionProperties> = self
            .sessions
            .all()
            .iter()
            .filter(|s| !s.state().is_closed())
            .map(|s| s.properties())
            .collect();
        let session_matches = |filter: &SessionFilter| properties.iter().any(|p| filter.matches(p));

        let nodes: Vec<Arc<TopicNode>> = self.tree.read().nodes().cloned().collect();
        let mut selectors: Vec<TopicSelector> = Vec::new();
        for node in nodes {
            let mut state = node.state.lock();
            if state.removed {
                continue;
            }
            let inputs = PolicyInputs {
                now,
                created_at: state.created_at,
                last_updated: state.last_updated,
                owner_closed: state.owner_closed,
                session_matches: &session_matches,
            };
            let Some((policy, tracker)) = state.removal.as_mut() else {
                continue;
            };
            if !policy.evaluate(tracker, &inputs) {
                continue;
            }
            info!(path = %node.path, policy = policy.expression(), "removal policy satisfied");
            match policy.remove_selector() {
                Some(selector) => selectors.push(selector.clone()),
                None => match TopicSelector::path(&node.path) {
                    Ok(selector) => selectors.push(selector),
                    Err(e) => warn!(path = %node.path, error = %e, "cannot select topic for removal"),
                },
            }
        }

        let mut paths: Vec<String> = {
            let map = self.tree.read();
            selectors
                .iter()
                .flat_map(|s| map.matching(s))
                .map(|n| n.path.clone())
                .collect()
        };
        paths.sort();
        paths.dedup();
        self.remove_paths(&paths)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("topics", &self.topic_count())
            .field("sessions", &self.session_count())
            .finish()
    }
}
