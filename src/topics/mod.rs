//! The topic tree, missing-topic handling, removal policies, topic views
//! and topic notifications.

pub mod missing;
pub mod notifications;
pub mod removal;
pub(crate) mod tree;
pub mod views;

pub use missing::{MissingTopicHandler, MissingTopicNotification, ProceedHandle};
pub use notifications::{
    ListenerId, NotificationListener, TopicEvent, TopicEventKind, TopicNotification,
    TopicNotificationKind,
};
pub use removal::RemovalPolicy;
pub use views::TopicView;
