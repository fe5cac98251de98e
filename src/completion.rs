//! Single-result completions for operations that may finish later.
//!
//! A [`Completion`] is handed back by operations that can be suspended
//! (missing-topic handling, lock acquisition, requests). It resolves exactly
//! once to a `Result`; cancelling it releases whatever the engine reserved
//! for it.
//!
//! The cancel hook withdraws the request under the producer's own lock, so
//! once it returns no further result can arrive. A result that arrived
//! first is passed to the reclaim hook instead of being dropped.

use crate::error::{EngineError, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::fmt;
use std::time::Duration;

type CancelHook = Box<dyn FnOnce() + Send + 'static>;
type ReclaimHook<T> = Box<dyn FnOnce(T) + Send + 'static>;

/// The pending result of an operation.
pub struct Completion<T> {
    receiver: Receiver<Result<T>>,
    on_cancel: Option<CancelHook>,
    on_reclaim: Option<ReclaimHook<T>>,
}

/// The producing side of a [`Completion`].
pub(crate) struct Completer<T> {
    sender: Sender<Result<T>>,
}

impl<T> Completer<T> {
    /// Resolve the completion. Returns false if it was already dropped.
    pub(crate) fn complete(self, result: Result<T>) -> bool {
        self.sender.try_send(result).is_ok()
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("ready", &!self.receiver.is_empty())
            .finish()
    }
}

impl<T> Completion<T> {
    /// A completion that is already resolved.
    pub(crate) fn ready(result: Result<T>) -> Self {
        let (completer, completion) = Self::pending();
        completer.complete(result);
        completion
    }

    pub(crate) fn pending() -> (Completer<T>, Self) {
        let (sender, receiver) = bounded(1);
        (
            Completer { sender },
            Self {
                receiver,
                on_cancel: None,
                on_reclaim: None,
            },
        )
    }

    pub(crate) fn on_cancel(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_cancel = Some(Box::new(hook));
        self
    }

    /// Hand a result nobody will take back to its producer.
    pub(crate) fn on_reclaim(mut self, hook: impl FnOnce(T) + Send + 'static) -> Self {
        self.on_reclaim = Some(Box::new(hook));
        self
    }

    pub fn is_ready(&self) -> bool {
        !self.receiver.is_empty()
    }

    /// Block until resolved. A completion whose producer went away
    /// resolves to `OperationDiscarded`.
    pub fn wait(self) -> Result<T> {
        self.receiver.recv().unwrap_or_else(|_| {
            Err(EngineError::OperationDiscarded(
                "operation was dropped before completing".to_string(),
            ))
        })
    }

    /// Block for at most `timeout`. On timeout the operation is cancelled,
    /// unless its result arrives while withdrawing.
    pub fn wait_timeout(mut self, timeout: Duration) -> Result<T> {
        match self.receiver.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                self.run_cancel();
                match self.receiver.try_recv() {
                    Ok(result) => result,
                    Err(_) => Err(EngineError::OperationDiscarded("timed out".to_string())),
                }
            }
            Err(RecvTimeoutError::Disconnected) => Err(EngineError::OperationDiscarded(
                "operation was dropped before completing".to_string(),
            )),
        }
    }

    /// Take the result if it is available.
    pub fn try_take(&self) -> Option<Result<T>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(EngineError::OperationDiscarded(
                "operation was dropped before completing".to_string(),
            ))),
        }
    }

    /// Cancel the operation, releasing anything reserved for it.
    ///
    /// Returns `Ok` if the operation had already completed. Either way a
    /// successful result is reclaimed, so a granted lock is released.
    pub fn cancel(mut self) -> Result<()> {
        let completed = self.is_ready();
        self.run_cancel();
        if let Ok(Ok(value)) = self.receiver.try_recv() {
            if let Some(reclaim) = self.on_reclaim.take() {
                reclaim(value);
            }
        }
        if completed {
            Ok(())
        } else {
            Err(EngineError::Cancelled)
        }
    }

    fn run_cancel(&mut self) {
        if let Some(hook) = self.on_cancel.take() {
            hook();
        }
    }
}
