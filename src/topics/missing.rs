//! Missing-topic handlers.
//!
//! A subscribe or fetch that matches nothing below a handler's branch is
//! suspended and the handler is told once per distinct missing path. The
//! handler answers through a [`ProceedHandle`]; every request waiting on the
//! path then resumes. Dropping the handle proceeds as well.

use crate::error::{EngineError, Result};
use crate::selectors::TopicSelector;
use crate::types::{is_in_branch, validate_path, SessionId, Timestamp};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Told about a request that matched no topic.
pub struct MissingTopicNotification {
    pub session: SessionId,
    /// The selector's literal path prefix.
    pub path: String,
    pub selector: TopicSelector,
    pub handle: ProceedHandle,
}

pub trait MissingTopicHandler: Send + Sync {
    fn on_missing_topic(&self, notification: MissingTopicNotification);
}

impl<F> MissingTopicHandler for F
where
    F: Fn(MissingTopicNotification) + Send + Sync,
{
    fn on_missing_topic(&self, notification: MissingTopicNotification) {
        self(notification)
    }
}

/// Lets suspended requests for one missing path resume.
pub struct ProceedHandle {
    table: Weak<MissingTopics>,
    path: String,
    done: bool,
}

impl ProceedHandle {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Resume every request waiting on this path.
    pub fn proceed(mut self) {
        self.resume();
    }

    fn resume(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        if let Some(table) = self.table.upgrade() {
            table.proceed(&self.path);
        }
    }
}

impl Drop for ProceedHandle {
    fn drop(&mut self) {
        self.resume();
    }
}

pub(crate) type Resume = Box<dyn FnOnce(Result<()>) + Send>;

struct Waiter {
    ticket: u64,
    session: SessionId,
    resume: Resume,
}

struct Pending {
    waiters: Vec<Waiter>,
    deadline: Timestamp,
}

/// Handler registrations and suspended requests.
#[derive(Default)]
pub(crate) struct MissingTopics {
    handlers: RwLock<Vec<(String, Arc<dyn MissingTopicHandler>)>>,
    pending: Mutex<HashMap<String, Pending>>,
    next_ticket: AtomicU64,
}

impl MissingTopics {
    /// Register `handler` for `branch`, replacing any handler there.
    pub(crate) fn register(&self, branch: &str, handler: Arc<dyn MissingTopicHandler>) -> Result<()> {
        if !validate_path(branch) {
            return Err(EngineError::InvalidPath(branch.to_string()));
        }
        let mut handlers = self.handlers.write();
        handlers.retain(|(b, _)| b != branch);
        handlers.push((branch.to_string(), handler));
        debug!(branch, "missing topic handler registered");
        Ok(())
    }

    pub(crate) fn unregister(&self, branch: &str) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(b, _)| b != branch);
        handlers.len() != before
    }

    /// The handler of the deepest registered branch containing `path`.
    pub(crate) fn handler_for(&self, path: &str) -> Option<Arc<dyn MissingTopicHandler>> {
        if path.is_empty() {
            return None;
        }
        self.handlers
            .read()
            .iter()
            .filter(|(branch, _)| is_in_branch(path, branch))
            .max_by_key(|(branch, _)| branch.len())
            .map(|(_, handler)| Arc::clone(handler))
    }

    /// Suspend a request on `path`. Returns the waiter's ticket, and a
    /// handle if this is the first waiter, in which case the caller
    /// notifies the handler.
    pub(crate) fn defer(
        self: &Arc<Self>,
        path: &str,
        session: SessionId,
        deadline: Timestamp,
        resume: Resume,
    ) -> (u64, Option<ProceedHandle>) {
        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst);
        let mut pending = self.pending.lock();
        let first = !pending.contains_key(path);
        pending
            .entry(path.to_string())
            .or_insert_with(|| Pending {
                waiters: Vec::new(),
                deadline,
            })
            .waiters
            .push(Waiter {
                ticket,
                session,
                resume,
            });
        let handle = first.then(|| ProceedHandle {
            table: Arc::downgrade(self),
            path: path.to_string(),
            done: false,
        });
        (ticket, handle)
    }

    /// Drop a cancelled request without resuming it.
    pub(crate) fn withdraw(&self, path: &str, ticket: u64) {
        let mut pending = self.pending.lock();
        if let Some(entry) = pending.get_mut(path) {
            entry.waiters.retain(|w| w.ticket != ticket);
            if entry.waiters.is_empty() {
                pending.remove(path);
                debug!(path, "last request for missing topic cancelled");
            }
        }
    }

    fn proceed(&self, path: &str) {
        let waiters = self
            .pending
            .lock()
            .remove(path)
            .map(|p| p.waiters)
            .unwrap_or_default();
        debug!(path, waiting = waiters.len(), "missing topic handler proceeded");
        for waiter in waiters {
            (waiter.resume)(Ok(()));
        }
    }

    /// Fail requests whose handler has not proceeded by `now`.
    pub(crate) fn expire(&self, now: Timestamp) -> usize {
        let expired: Vec<(String, Pending)> = {
            let mut pending = self.pending.lock();
            let paths: Vec<String> = pending
                .iter()
                .filter(|(_, p)| p.deadline <= now)
                .map(|(path, _)| path.clone())
                .collect();
            paths
                .into_iter()
                .filter_map(|path| pending.remove(&path).map(|p| (path, p)))
                .collect()
        };
        let mut count = 0;
        for (path, entry) in expired {
            warn!(path = %path, waiting = entry.waiters.len(), "missing topic handler did not proceed in time");
            for waiter in entry.waiters {
                count += 1;
                (waiter.resume)(Err(EngineError::OperationDiscarded(format!(
                    "missing topic handler for '{}' timed out",
                    path
                ))));
            }
        }
        count
    }

    /// Fail the requests of a closed session.
    pub(crate) fn discard_session(&self, session: SessionId) {
        let discarded: Vec<Waiter> = {
            let mut pending = self.pending.lock();
            let mut out = Vec::new();
            for entry in pending.values_mut() {
                let (theirs, others): (Vec<Waiter>, Vec<Waiter>) =
                    entry.waiters.drain(..).partition(|w| w.session == session);
                entry.waiters = others;
                out.extend(theirs);
            }
            pending.retain(|_, p| !p.waiters.is_empty());
            out
        };
        for waiter in discarded {
            (waiter.resume)(Err(EngineError::OperationDiscarded(format!(
                "session {} closed",
                session
            ))));
        }
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.lock().values().map(|p| p.waiters.len()).sum()
    }
}
