//! Request handler registry and responders.

use crate::error::{EngineError, Result};
use crate::sessions::SessionProperties;
use crate::types::{is_in_branch, validate_path, SessionId, TopicType};
use crate::values::TopicValue;
use crossbeam_channel::Receiver;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// A request as a handler sees it.
#[derive(Clone, Debug)]
pub struct Request {
    /// The path the request was sent to.
    pub path: String,
    pub sender: SessionId,
    pub sender_properties: SessionProperties,
    pub value: TopicValue,
}

type Reply = Box<dyn FnOnce(Result<TopicValue>) + Send>;

/// Answers one request. Dropping it unanswered discards the request.
pub struct Responder {
    path: String,
    response_type: TopicType,
    reply: Option<Reply>,
}

impl Responder {
    pub(crate) fn new(path: &str, response_type: TopicType, reply: Reply) -> Self {
        Self {
            path: path.to_string(),
            response_type,
            reply: Some(reply),
        }
    }

    /// Send the response. A value of the wrong type fails the request for
    /// both sides.
    pub fn respond(mut self, value: TopicValue) -> Result<()> {
        if value.topic_type() != self.response_type {
            let reason = format!(
                "response to '{}' must be {}, got {}",
                self.path,
                self.response_type.name(),
                value.topic_type().name()
            );
            self.finish(Err(EngineError::InvalidMessage(reason.clone())));
            return Err(EngineError::InvalidMessage(reason));
        }
        self.finish(Ok(value));
        Ok(())
    }

    /// Fail the request with a reason the sender sees.
    pub fn reject(mut self, reason: impl Into<String>) {
        self.finish(Err(EngineError::RequestRejected(reason.into())));
    }

    fn finish(&mut self, result: Result<TopicValue>) {
        if let Some(reply) = self.reply.take() {
            reply(result);
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if self.reply.is_some() {
            debug!(path = %self.path, "request dropped unanswered");
            self.finish(Err(EngineError::OperationDiscarded(
                "request was not answered".to_string(),
            )));
        }
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("path", &self.path)
            .field("answered", &self.reply.is_none())
            .finish()
    }
}

pub trait RequestHandler: Send + Sync {
    fn on_request(&self, request: Request, responder: Responder);
}

impl<F> RequestHandler for F
where
    F: Fn(Request, Responder) + Send + Sync,
{
    fn on_request(&self, request: Request, responder: Responder) {
        self(request, responder)
    }
}

/// One response to a filtered request.
#[derive(Debug)]
pub struct FilterResponse {
    pub session: SessionId,
    pub result: Result<TopicValue>,
}

/// A request sent to every session a filter matched.
#[derive(Debug)]
pub struct FilterRequest {
    /// Sessions the request reached; this many responses will arrive.
    pub expected: usize,
    pub responses: Receiver<FilterResponse>,
}

/// A handler or stream with the message types it accepts.
#[derive(Clone)]
pub(crate) struct Registered {
    pub(crate) owner: SessionId,
    pub(crate) request_type: TopicType,
    pub(crate) response_type: TopicType,
    pub(crate) handler: Arc<dyn RequestHandler>,
}

impl Registered {
    /// Fail early if `value` is not the request type this handler takes.
    pub(crate) fn check_request(&self, path: &str, value: &TopicValue) -> Result<()> {
        if value.topic_type() == self.request_type {
            return Ok(());
        }
        Err(EngineError::InvalidMessage(format!(
            "request to '{}' must be {}, got {}",
            path,
            self.request_type.name(),
            value.topic_type().name()
        )))
    }
}

/// Path handlers by branch, and request streams by session and path.
#[derive(Default)]
pub(crate) struct RequestHandlers {
    paths: RwLock<BTreeMap<String, Registered>>,
    streams: RwLock<HashMap<(SessionId, String), Registered>>,
}

impl RequestHandlers {
    /// Register a handler for `branch`. A session may replace its own
    /// handler but not another session's.
    pub(crate) fn add_handler(&self, branch: &str, registered: Registered) -> Result<()> {
        if !validate_path(branch) {
            return Err(EngineError::InvalidPath(branch.to_string()));
        }
        let mut paths = self.paths.write();
        if let Some(existing) = paths.get(branch) {
            if existing.owner != registered.owner {
                return Err(EngineError::InvalidOperation(format!(
                    "request handler for '{}' is registered by session {}",
                    branch, existing.owner
                )));
            }
        }
        debug!(branch, session = %registered.owner, "request handler registered");
        paths.insert(branch.to_string(), registered);
        Ok(())
    }

    pub(crate) fn remove_handler(&self, owner: SessionId, branch: &str) -> bool {
        let mut paths = self.paths.write();
        if paths.get(branch).is_some_and(|r| r.owner == owner) {
            paths.remove(branch);
            return true;
        }
        false
    }

    /// The handler of the deepest registered branch containing `path`.
    pub(crate) fn handler_for(&self, path: &str) -> Option<Registered> {
        self.paths
            .read()
            .iter()
            .filter(|(branch, _)| is_in_branch(path, branch))
            .max_by_key(|(branch, _)| branch.len())
            .map(|(_, registered)| registered.clone())
    }

    pub(crate) fn set_stream(&self, path: &str, registered: Registered) -> Result<()> {
        if !validate_path(path) {
            return Err(EngineError::InvalidPath(path.to_string()));
        }
        self.streams
            .write()
            .insert((registered.owner, path.to_string()), registered);
        Ok(())
    }

    pub(crate) fn remove_stream(&self, session: SessionId, path: &str) -> bool {
        self.streams
            .write()
            .remove(&(session, path.to_string()))
            .is_some()
    }

    pub(crate) fn stream(&self, session: SessionId, path: &str) -> Option<Registered> {
        self.streams.read().get(&(session, path.to_string())).cloned()
    }

    /// Drop everything a closed session registered.
    pub(crate) fn discard_session(&self, session: SessionId) -> usize {
        let mut paths = self.paths.write();
        let mut streams = self.streams.write();
        let before = paths.len() + streams.len();
        paths.retain(|_, r| r.owner != session);
        streams.retain(|(owner, _), _| *owner != session);
        before - paths.len() - streams.len()
    }
}
