//! Authentication handlers and topic permission checks.

use super::SessionProperties;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Credentials presented when a session opens.
#[derive(Clone, PartialEq, Eq, Default)]
pub enum Credentials {
    #[default]
    None,
    Password(String),
    Token(Vec<u8>),
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::None => f.write_str("None"),
            Credentials::Password(_) => f.write_str("Password(***)"),
            Credentials::Token(t) => write!(f, "Token({} bytes)", t.len()),
        }
    }
}

/// A handler's verdict. `Allow` may add session properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    Allow(SessionProperties),
    Deny,
    Abstain,
}

pub trait Authenticator: Send + Sync {
    fn authenticate(
        &self,
        principal: &str,
        credentials: &Credentials,
        proposed: &SessionProperties,
    ) -> AuthDecision;
}

impl<F> Authenticator for F
where
    F: Fn(&str, &Credentials, &SessionProperties) -> AuthDecision + Send + Sync,
{
    fn authenticate(
        &self,
        principal: &str,
        credentials: &Credentials,
        proposed: &SessionProperties,
    ) -> AuthDecision {
        self(principal, credentials, proposed)
    }
}

/// Handlers consulted in registration order; the first that does not
/// abstain decides. With no handlers every session is allowed; when every
/// handler abstains the session is denied.
#[derive(Default)]
pub struct AuthenticatorChain {
    handlers: RwLock<Vec<Arc<dyn Authenticator>>>,
}

impl AuthenticatorChain {
    pub fn push(&self, handler: Arc<dyn Authenticator>) {
        self.handlers.write().push(handler);
    }

    pub fn authenticate(
        &self,
        principal: &str,
        credentials: &Credentials,
        proposed: &SessionProperties,
    ) -> AuthDecision {
        let handlers = self.handlers.read().clone();
        if handlers.is_empty() {
            return AuthDecision::Allow(SessionProperties::new());
        }
        for (index, handler) in handlers.iter().enumerate() {
            match handler.authenticate(principal, credentials, proposed) {
                AuthDecision::Abstain => continue,
                decision => {
                    debug!(principal, handler = index, allowed = matches!(decision, AuthDecision::Allow(_)), "authentication decided");
                    return decision;
                }
            }
        }
        AuthDecision::Deny
    }
}

/// Permissions checked against a topic path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicPermission {
    /// Subscribe and fetch.
    Read,
    /// Set values.
    Update,
    /// Add and remove topics and topic views.
    Modify,
    /// Send requests to a path, or handle requests sent to it.
    Message,
}

/// Decides topic permissions for a session. Returning `None` leaves the
/// default (allow) in place.
pub trait Authorizer: Send + Sync {
    fn authorize(
        &self,
        principal: &str,
        properties: &SessionProperties,
        permission: TopicPermission,
        path: &str,
    ) -> Option<bool>;
}

impl<F> Authorizer for F
where
    F: Fn(&str, &SessionProperties, TopicPermission, &str) -> Option<bool> + Send + Sync,
{
    fn authorize(
        &self,
        principal: &str,
        properties: &SessionProperties,
        permission: TopicPermission,
        path: &str,
    ) -> Option<bool> {
        self(principal, properties, permission, path)
    }
}
