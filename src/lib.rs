//! # Arbor
//!
//! A topic-tree publish/subscribe engine. Sessions subscribe to selectors
//! over a hierarchy of typed topics and receive the topics' values, first in
//! full and then as deltas, through per-session queues that conflate and
//! throttle for slow consumers.
//!
//! ## Core Concepts
//!
//! - **Topics**: Typed values at slash-delimited paths, with properties
//!   such as removal policies
//! - **Selectors**: Compiled expressions matching paths (exact, branch,
//!   regex, sets)
//! - **Sessions**: Authenticated clients with properties, a lifecycle that
//!   survives reconnection, and an outbound queue
//! - **Deliveries**: Subscription notices, full values, deltas and
//!   unsubscription notices with a reason
//! - **Topic views**: Reference topics mirroring the topics a selector
//!   matches under mapped paths
//! - **Messaging**: Requests with a single response, sent to a path
//!   handler, one session or a filtered set of sessions
//!
//! ## Example
//!
//! ```ignore
//! use arbor::{Engine, EngineConfig, SessionOptions, TopicSpecification, TopicType, TopicValue,
//!     RecordValue, UpdateConstraint};
//!
//! let engine = Engine::new(EngineConfig::default());
//! let publisher = engine.open_session(SessionOptions::new("publisher"))?;
//! let client = engine.open_session(SessionOptions::new("client"))?;
//!
//! let price = TopicValue::Record(RecordValue::new().with("Bid", "1.2500").with("Ask", "1.2505"));
//! engine.add_and_set(publisher, "FX/GBP/USD", &TopicSpecification::new(TopicType::Record),
//!     price, &UpdateConstraint::Unconstrained)?;
//!
//! // Subscribe and read the subscription notice and the full value
//! engine.subscribe(client, "?FX//").wait()?;
//! for delivery in engine.poll(client)? {
//!     println!("{:?}", delivery);
//! }
//! ```

pub mod clock;
pub mod completion;
pub mod config;
pub mod delivery;
pub mod engine;
pub mod error;
pub mod messaging;
pub mod selectors;
pub mod sessions;
pub mod subscriptions;
pub mod topics;
pub mod types;
pub mod values;

// Re-exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use completion::Completion;
pub use config::{EngineConfig, QueueConfig};
pub use delivery::{Delivery, Payload, PushOutcome, QueueEvent, SessionQueue, UnsubscribeReason, UpdateEvent};
pub use engine::Engine;
pub use error::{AddFailureReason, EngineError, Result};
pub use messaging::{FilterRequest, FilterResponse, Request, RequestHandler, Responder};
pub use selectors::{FetchRequest, FetchResult, FetchedTopic, Qualifier, TopicSelector};
pub use sessions::{
    exponential_backoff, fixed_interval, AuthDecision, Authenticator, Authorizer, CloseReason,
    Credentials, InitialRetryStrategy, LockScope, ReconnectDecision, ReconnectionStrategy,
    RecoveryOutcome, SessionEvent, SessionFilter, SessionLock, SessionOptions, SessionProperties,
    TopicPermission,
};
pub use subscriptions::{RoutingHandler, StreamEvent, StreamId, ValueStreams};
pub use topics::{
    ListenerId, MissingTopicHandler, MissingTopicNotification, NotificationListener, ProceedHandle,
    RemovalPolicy, TopicEvent, TopicEventKind, TopicNotification, TopicNotificationKind, TopicView,
};
pub use types::*;
pub use values::{
    apply_patch, compute_delta, parse_json_patch, Delta, FieldChange, PatchOperation, QueryView,
    RangeAnchor, RangeQuery, RecordDelta, RecordValue, TimeSeriesEvent, TopicValue,
    UpdateConstraint,
};
