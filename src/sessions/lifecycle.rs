//! Session state machine and reconnection policy.

use crate::clock::Clock;
use crate::error::{EngineError, Result};
use crate::types::{SessionId, SessionState, Timestamp};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What a reconnection strategy asks for next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    RetryAfter(Duration),
    Abort,
}

/// Decides, from the attempt number (starting at 1) and the time spent
/// disconnected so far, whether and when to try again.
pub type ReconnectionStrategy = Arc<dyn Fn(u32, Duration) -> ReconnectDecision + Send + Sync>;

/// Retry at a fixed interval, optionally giving up after `max_attempts`.
pub fn fixed_interval(interval: Duration, max_attempts: Option<u32>) -> ReconnectionStrategy {
    Arc::new(move |attempt, _elapsed| match max_attempts {
        Some(max) if attempt > max => ReconnectDecision::Abort,
        _ => ReconnectDecision::RetryAfter(interval),
    })
}

/// Double the wait after each attempt, capped at `max_interval`.
pub fn exponential_backoff(
    initial: Duration,
    max_interval: Duration,
    max_attempts: Option<u32>,
) -> ReconnectionStrategy {
    Arc::new(move |attempt, _elapsed| {
        if max_attempts.is_some_and(|max| attempt > max) {
            return ReconnectDecision::Abort;
        }
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        let wait = initial.checked_mul(factor).unwrap_or(max_interval);
        ReconnectDecision::RetryAfter(wait.min(max_interval))
    })
}

/// Bounded retry for the first connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitialRetryStrategy {
    pub interval: Duration,
    /// Retries after the first attempt.
    pub attempts: u32,
}

impl InitialRetryStrategy {
    pub fn none() -> Self {
        Self {
            interval: Duration::ZERO,
            attempts: 0,
        }
    }

    pub fn new(interval: Duration, attempts: u32) -> Self {
        Self { interval, attempts }
    }
}

/// Run `attempt` until it succeeds or the retries run out.
///
/// `Ok(None)` from `attempt` is a transient failure worth retrying; an
/// error ends the loop at once.
pub fn establish<T>(
    strategy: &InitialRetryStrategy,
    clock: &dyn Clock,
    mut attempt: impl FnMut(u32) -> Result<Option<T>>,
) -> Result<T> {
    let total = strategy.attempts.saturating_add(1);
    for n in 1..=total {
        if let Some(value) = attempt(n)? {
            return Ok(value);
        }
        debug!(attempt = n, of = total, "initial connection attempt failed");
        if n < total {
            clock.sleep(strategy.interval);
        }
    }
    Err(EngineError::SessionEstablishment(format!(
        "no connection after {} attempts",
        total
    )))
}

/// Shortest wait between reconnection attempts, whatever the strategy asks.
pub const MIN_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// How a recovery loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Reconnected { attempts: u32 },
    Aborted { attempts: u32 },
    TimedOut { attempts: u32 },
}

/// Drive reconnection attempts for a session that lost its connection.
///
/// The loop stops when `attempt` reports success, the strategy aborts, or
/// `timeout` has elapsed since `disconnected_at`. Waits shorter than
/// [`MIN_RETRY_INTERVAL`] are lengthened to it, which bounds the number of
/// attempts by the timeout.
pub fn run_recovery(
    strategy: &ReconnectionStrategy,
    timeout: Duration,
    disconnected_at: Timestamp,
    clock: &dyn Clock,
    mut attempt: impl FnMut(u32) -> bool,
) -> RecoveryOutcome {
    let mut attempts = 0;
    loop {
        let elapsed = clock.now().since(disconnected_at);
        if elapsed >= timeout {
            return RecoveryOutcome::TimedOut { attempts };
        }
        match strategy(attempts + 1, elapsed) {
            ReconnectDecision::Abort => return RecoveryOutcome::Aborted { attempts },
            ReconnectDecision::RetryAfter(wait) => {
                clock.sleep(wait.max(MIN_RETRY_INTERVAL).min(timeout - elapsed));
            }
        }
        if clock.now().since(disconnected_at) > timeout {
            return RecoveryOutcome::TimedOut { attempts };
        }
        attempts += 1;
        if attempt(attempts) {
            return RecoveryOutcome::Reconnected { attempts };
        }
    }
}

/// Tracks one session's position in the lifecycle.
#[derive(Debug, Clone)]
pub struct SessionLifecycle {
    session: SessionId,
    state: SessionState,
    disconnected_at: Option<Timestamp>,
    reconnection_timeout: Duration,
}

impl SessionLifecycle {
    pub fn new(session: SessionId, reconnection_timeout: Duration) -> Self {
        Self {
            session,
            state: SessionState::Connecting,
            disconnected_at: None,
            reconnection_timeout,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn disconnected_at(&self) -> Option<Timestamp> {
        self.disconnected_at
    }

    pub fn reconnection_timeout(&self) -> Duration {
        self.reconnection_timeout
    }

    /// Fails with `SessionClosed` once the session has reached a closed state.
    pub fn ensure_open(&self) -> Result<()> {
        if self.state.is_closed() {
            Err(EngineError::SessionClosed(self.session))
        } else {
            Ok(())
        }
    }

    fn transition(&mut self, to: SessionState) -> SessionState {
        let from = self.state;
        self.state = to;
        if to.is_closed() {
            info!(session = %self.session, ?from, ?to, "session closed");
        } else {
            debug!(session = %self.session, ?from, ?to, "session state changed");
        }
        from
    }

    pub fn connected(&mut self) -> Result<()> {
        match self.state {
            SessionState::Connecting => {
                self.transition(SessionState::ConnectedActive);
                Ok(())
            }
            other => Err(EngineError::InvalidOperation(format!(
                "cannot complete connection from {:?}",
                other
            ))),
        }
    }

    /// The connection dropped. Enters recovery, or closes at once when
    /// reconnection is disabled.
    pub fn connection_lost(&mut self, now: Timestamp) -> Result<SessionState> {
        self.ensure_open()?;
        if self.state != SessionState::ConnectedActive {
            return Ok(self.state);
        }
        if self.reconnection_timeout.is_zero() {
            self.transition(SessionState::ClosedByServer);
        } else {
            warn!(session = %self.session, timeout_ms = self.reconnection_timeout.as_millis() as u64, "connection lost, recovering");
            self.disconnected_at = Some(now);
            self.transition(SessionState::RecoveringReconnect);
        }
        Ok(self.state)
    }

    /// The connection came back. Succeeds only inside the timeout window.
    pub fn reconnected(&mut self, now: Timestamp) -> Result<()> {
        if self.expire(now) {
            return Err(EngineError::SessionClosed(self.session));
        }
        self.ensure_open()?;
        if self.state == SessionState::RecoveringReconnect {
            self.disconnected_at = None;
            self.transition(SessionState::ConnectedActive);
        }
        Ok(())
    }

    /// Close the session if its recovery window has passed. Returns true
    /// only for the call that performed the close.
    pub fn expire(&mut self, now: Timestamp) -> bool {
        match (self.state, self.disconnected_at) {
            (SessionState::RecoveringReconnect, Some(since))
                if now.since(since) > self.reconnection_timeout =>
            {
                self.transition(SessionState::ClosedByServer);
                true
            }
            _ => false,
        }
    }

    /// Returns false if the session was already closed.
    pub fn close(&mut self, state: SessionState) -> bool {
        if self.state.is_closed() {
            return false;
        }
        self.transition(state);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn lifecycle(timeout_ms: u64) -> SessionLifecycle {
        let mut l = SessionLifecycle::new(SessionId(7), Duration::from_millis(timeout_ms));
        l.connected().unwrap();
        l
    }

    #[test]
    fn test_reconnect_within_window() {
        let mut l = lifecycle(1000);
        assert_eq!(
            l.connection_lost(Timestamp(0)).unwrap(),
            SessionState::RecoveringReconnect
        );
        l.reconnected(Timestamp(900)).unwrap();
        assert_eq!(l.state(), SessionState::ConnectedActive);
    }

    #[test]
    fn test_zero_timeout_closes_immediately() {
        let mut l = lifecycle(0);
        assert_eq!(
            l.connection_lost(Timestamp(0)).unwrap(),
            SessionState::ClosedByServer
        );
        assert!(matches!(l.ensure_open(), Err(EngineError::SessionClosed(_))));
    }

    #[test]
    fn test_expiry_fires_once() {
        let mut l = lifecycle(1000);
        l.connection_lost(Timestamp(0)).unwrap();
        assert!(!l.expire(Timestamp(1000)));
        assert!(l.expire(Timestamp(1001)));
        assert!(!l.expire(Timestamp(5000)));
        assert!(l.reconnected(Timestamp(5000)).is_err());
    }

    #[test]
    fn test_exponential_backoff() {
        let s = exponential_backoff(Duration::from_millis(100), Duration::from_millis(500), Some(5));
        assert_eq!(s(1, Duration::ZERO), ReconnectDecision::RetryAfter(Duration::from_millis(100)));
        assert_eq!(s(3, Duration::ZERO), ReconnectDecision::RetryAfter(Duration::from_millis(400)));
        assert_eq!(s(4, Duration::ZERO), ReconnectDecision::RetryAfter(Duration::from_millis(500)));
        assert_eq!(s(6, Duration::ZERO), ReconnectDecision::Abort);
    }

    #[test]
    fn test_recovery_aborts_after_strategy_limit() {
        let clock = ManualClock::new(Timestamp(0));
        let strategy = fixed_interval(Duration::from_millis(10), Some(3));
        let mut tries = 0;
        let outcome = run_recovery(&strategy, Duration::from_secs(60), Timestamp(0), &clock, |_| {
            tries += 1;
            false
        });
        assert_eq!(outcome, RecoveryOutcome::Aborted { attempts: 3 });
        assert_eq!(tries, 3);
    }

    #[test]
    fn test_recovery_times_out() {
        let clock = ManualClock::new(Timestamp(0));
        let strategy = fixed_interval(Duration::from_secs(20), None);
        let outcome = run_recovery(&strategy, Duration::from_secs(60), Timestamp(0), &clock, |_| false);
        assert!(matches!(outcome, RecoveryOutcome::TimedOut { .. }));
        assert!(clock.now().0 >= 60_000);
    }

    #[test]
    fn test_zero_wait_strategy_is_bounded() {
        let clock = ManualClock::new(Timestamp(0));
        let strategy: ReconnectionStrategy = Arc::new(|_, _| ReconnectDecision::RetryAfter(Duration::ZERO));
        let outcome = run_recovery(&strategy, Duration::from_secs(2), Timestamp(0), &clock, |_| false);
        assert_eq!(outcome, RecoveryOutcome::TimedOut { attempts: 20 });
        assert_eq!(clock.now(), Timestamp(2000));
    }

    #[test]
    fn test_establish_retries_then_succeeds() {
        let clock = ManualClock::new(Timestamp(0));
        let strategy = InitialRetryStrategy::new(Duration::from_millis(50), 3);
        let value = establish(&strategy, &clock, |n| Ok(if n == 3 { Some(n) } else { None })).unwrap();
        assert_eq!(value, 3);
        assert_eq!(clock.now(), Timestamp(100));

        let failed: Result<u32> = establish(&strategy, &clock, |_| Ok(None));
        assert!(matches!(failed, Err(EngineError::SessionEstablishment(_))));
    }
}
