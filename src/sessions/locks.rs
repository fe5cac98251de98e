//! Named session locks.
//!
//! A lock is held by at most one session. Requests from other sessions
//! queue in FIFO order and are granted when the holder releases. Each
//! grant carries a fresh sequence so stale handles can be detected.

use crate::completion::{Completer, Completion};
use crate::error::{EngineError, Result};
use crate::types::SessionId;
use crate::values::LockOracle;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use tracing::debug;

/// When a held lock is released automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockScope {
    /// Released when the session closes.
    #[default]
    UnlockOnSessionLoss,
    /// Released as soon as the session loses its connection.
    UnlockOnConnectionLoss,
}

/// A granted lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLock {
    pub name: String,
    pub sequence: u64,
    pub owner: SessionId,
    pub scope: LockScope,
}

struct Waiter {
    ticket: u64,
    session: SessionId,
    scope: LockScope,
    completer: Completer<SessionLock>,
}

#[derive(Default)]
struct LockEntry {
    holder: Option<SessionLock>,
    waiters: VecDeque<Waiter>,
}

#[derive(Default)]
struct LockState {
    entries: HashMap<String, LockEntry>,
    next_sequence: u64,
    next_ticket: u64,
}

impl LockState {
    fn grant(&mut self, name: &str, session: SessionId, scope: LockScope) -> SessionLock {
        self.next_sequence += 1;
        SessionLock {
            name: name.to_string(),
            sequence: self.next_sequence,
            owner: session,
            scope,
        }
    }

    /// Hand `name` to the next live waiter, or drop the entry.
    fn pass_on(&mut self, name: &str) {
        loop {
            let waiter = match self.entries.get_mut(name).and_then(|e| e.waiters.pop_front()) {
                Some(waiter) => waiter,
                None => {
                    self.entries.remove(name);
                    return;
                }
            };
            let lock = self.grant(name, waiter.session, waiter.scope);
            if waiter.completer.complete(Ok(lock.clone())) {
                debug!(lock = name, session = %lock.owner, sequence = lock.sequence, "lock handed over");
                if let Some(entry) = self.entries.get_mut(name) {
                    entry.holder = Some(lock);
                }
                return;
            }
        }
    }
}

/// The table of named locks shared by all sessions.
#[derive(Default)]
pub struct LockTable {
    state: Mutex<LockState>,
}

impl LockTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Request `name` for `session`. Resolves immediately if the lock is
    /// free or already held by the session.
    pub fn acquire(self: &Arc<Self>, session: SessionId, name: &str, scope: LockScope) -> Completion<SessionLock> {
        let mut state = self.state.lock();
        let held = state.entries.get(name).and_then(|e| e.holder.clone());
        match held {
            Some(lock) if lock.owner == session => Completion::ready(Ok(lock)),
            None => {
                let lock = state.grant(name, session, scope);
                state.entries.entry(name.to_string()).or_default().holder = Some(lock.clone());
                debug!(lock = name, session = %session, sequence = lock.sequence, "lock acquired");
                self.reclaiming(Completion::ready(Ok(lock)))
            }
            Some(_) => {
                state.next_ticket += 1;
                let ticket = state.next_ticket;
                let (completer, completion) = Completion::pending();
                state.entries.entry(name.to_string()).or_default().waiters.push_back(Waiter {
                    ticket,
                    session,
                    scope,
                    completer,
                });
                let table: Weak<LockTable> = Arc::downgrade(self);
                let name = name.to_string();
                self.reclaiming(completion.on_cancel(move || {
                    if let Some(table) = table.upgrade() {
                        table.withdraw(&name, ticket);
                    }
                }))
            }
        }
    }

    /// Release a grant whose request is cancelled after it was made.
    fn reclaiming(self: &Arc<Self>, completion: Completion<SessionLock>) -> Completion<SessionLock> {
        let table: Weak<LockTable> = Arc::downgrade(self);
        completion.on_reclaim(move |lock| {
            if let Some(table) = table.upgrade() {
                if table.release(&lock).is_ok() {
                    debug!(lock = %lock.name, session = %lock.owner, "cancelled grant released");
                }
            }
        })
    }

    fn withdraw(&self, name: &str, ticket: u64) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get_mut(name) {
            entry.waiters.retain(|w| w.ticket != ticket);
        }
    }

    /// Release a lock. Fails if the handle is not the current grant.
    pub fn release(&self, lock: &SessionLock) -> Result<()> {
        let mut state = self.state.lock();
        let current = state.entries.get(&lock.name).and_then(|e| e.holder.as_ref());
        if current != Some(lock) {
            return Err(EngineError::InvalidOperation(format!(
                "lock '{}' sequence {} is not held",
                lock.name, lock.sequence
            )));
        }
        if let Some(entry) = state.entries.get_mut(&lock.name) {
            entry.holder = None;
        }
        debug!(lock = %lock.name, session = %lock.owner, "lock released");
        state.pass_on(&lock.name);
        Ok(())
    }

    /// Release the locks of a session that lost its connection or closed.
    ///
    /// On connection loss only `UnlockOnConnectionLoss` locks go. On close
    /// every lock goes and queued requests fail with `SessionClosed`.
    pub fn release_session(&self, session: SessionId, closed: bool) -> Vec<String> {
        let mut state = self.state.lock();
        let mut released = Vec::new();
        let names: Vec<String> = state.entries.keys().cloned().collect();
        for name in names {
            let Some(entry) = state.entries.get_mut(&name) else {
                continue;
            };
            if closed {
                let (theirs, others): (VecDeque<Waiter>, VecDeque<Waiter>) =
                    entry.waiters.drain(..).partition(|w| w.session == session);
                entry.waiters = others;
                for waiter in theirs {
                    waiter.completer.complete(Err(EngineError::SessionClosed(session)));
                }
            }
            let releases = entry.holder.as_ref().is_some_and(|h| {
                h.owner == session && (closed || h.scope == LockScope::UnlockOnConnectionLoss)
            });
            if releases {
                entry.holder = None;
                released.push(name.clone());
                state.pass_on(&name);
            } else if entry.holder.is_none() && entry.waiters.is_empty() {
                state.entries.remove(&name);
            }
        }
        released
    }

    pub fn holder(&self, name: &str) -> Option<SessionLock> {
        self.state.lock().entries.get(name).and_then(|e| e.holder.clone())
    }
}

impl LockOracle for LockTable {
    fn holds(&self, session: SessionId, name: &str, sequence: u64) -> bool {
        self.holder(name)
            .is_some_and(|lock| lock.owner == session && lock.sequence == sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: SessionId = SessionId(1);
    const B: SessionId = SessionId(2);

    #[test]
    fn test_fifo_handover() {
        let table = LockTable::new();
        let first = table.acquire(A, "L", LockScope::default()).wait().unwrap();
        let waiting = table.acquire(B, "L", LockScope::default());
        assert!(!waiting.is_ready());

        table.release(&first).unwrap();
        let second = waiting.wait().unwrap();
        assert_eq!(second.owner, B);
        assert!(second.sequence > first.sequence);
        assert!(!table.holds(A, "L", first.sequence));
        assert!(table.holds(B, "L", second.sequence));
    }

    #[test]
    fn test_stale_release_rejected() {
        let table = LockTable::new();
        let lock = table.acquire(A, "L", LockScope::default()).wait().unwrap();
        table.release(&lock).unwrap();
        assert!(table.release(&lock).is_err());
    }

    #[test]
    fn test_cancelled_waiter_is_skipped() {
        let table = LockTable::new();
        let held = table.acquire(A, "L", LockScope::default()).wait().unwrap();
        let cancelled = table.acquire(B, "L", LockScope::default());
        let _ = cancelled.cancel();
        table.release(&held).unwrap();
        assert!(table.holder("L").is_none());
    }

    #[test]
    fn test_cancel_racing_handover_never_strands_lock() {
        const C: SessionId = SessionId(3);
        for _ in 0..2000 {
            let table = LockTable::new();
            let held = table.acquire(A, "L", LockScope::default()).wait().unwrap();
            let cancelled = table.acquire(B, "L", LockScope::default());
            let next = table.acquire(C, "L", LockScope::default());

            let releaser = {
                let table = Arc::clone(&table);
                std::thread::spawn(move || table.release(&held).unwrap())
            };
            let _ = cancelled.cancel();
            releaser.join().unwrap();

            assert_eq!(next.wait().unwrap().owner, C);
            assert_eq!(table.holder("L").map(|l| l.owner), Some(C));
        }
    }

    #[test]
    fn test_cancel_after_grant_releases() {
        let table = LockTable::new();
        let held = table.acquire(A, "L", LockScope::default()).wait().unwrap();
        let granted = table.acquire(B, "L", LockScope::default());
        table.release(&held).unwrap();
        assert!(granted.is_ready());
        assert!(granted.cancel().is_ok());
        assert!(table.holder("L").is_none());
    }

    #[test]
    fn test_connection_loss_scope() {
        let table = LockTable::new();
        table.acquire(A, "keep", LockScope::UnlockOnSessionLoss).wait().unwrap();
        table.acquire(A, "drop", LockScope::UnlockOnConnectionLoss).wait().unwrap();

        assert_eq!(table.release_session(A, false), vec!["drop".to_string()]);
        assert!(table.holder("keep").is_some());

        table.release_session(A, true);
        assert!(table.holder("keep").is_none());
    }

    #[test]
    fn test_close_fails_pending_requests() {
        let table = LockTable::new();
        table.acquire(A, "L", LockScope::default()).wait().unwrap();
        let pending = table.acquire(B, "L", LockScope::default());
        table.release_session(B, true);
        assert!(matches!(pending.wait(), Err(EngineError::SessionClosed(_))));
    }
}
