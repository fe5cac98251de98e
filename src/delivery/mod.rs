//! Update dispatch and per-session outbound queues.

pub(crate) mod dispatcher;
pub mod queue;
pub mod types;

pub use queue::{PushOutcome, SessionQueue};
pub use types::{Delivery, Payload, QueueEvent, UnsubscribeReason, UpdateEvent};
