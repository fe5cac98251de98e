//! Subscription registry, routing and client-side value streams.

pub(crate) mod registry;
pub mod streams;

pub use registry::RoutingHandler;
pub use streams::{StreamEvent, StreamId, ValueStreams};
