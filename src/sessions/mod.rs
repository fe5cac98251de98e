//! Sessions: lifecycle, properties, locks and security.

pub mod auth;
pub mod filter;
pub mod lifecycle;
pub mod locks;
mod session;

use std::collections::BTreeMap;

/// Session properties by name.
pub type SessionProperties = BTreeMap<String, String>;

pub use auth::{AuthDecision, Authenticator, AuthenticatorChain, Authorizer, Credentials, TopicPermission};
pub use filter::SessionFilter;
pub use lifecycle::{
    establish, exponential_backoff, fixed_interval, run_recovery, InitialRetryStrategy,
    ReconnectDecision, ReconnectionStrategy, RecoveryOutcome, SessionLifecycle,
};
pub use locks::{LockScope, LockTable, SessionLock};
pub use session::{
    is_fixed_property, CloseReason, SessionEvent, SessionOptions, PRINCIPAL, SESSION_ID, START_TIME,
};
pub(crate) use session::{Session, SessionTable};
