//! Request/response messaging.
//!
//! Sessions send requests to a path, to one session, or to every session a
//! filter matches. Path requests go to the handler registered for the
//! deepest branch containing the path. Session requests go to the request
//! stream the target registered for that exact path.

pub(crate) mod handlers;

pub use handlers::{FilterRequest, FilterResponse, Request, RequestHandler, Responder};
pub(crate) use handlers::{Registered, RequestHandlers};
