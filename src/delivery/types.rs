//! What the engine delivers to sessions.

use crate::error::Result;
use crate::types::{SessionId, Sequence, Timestamp, TopicSpecification, TopicType};
use crate::values::{Delta, TopicValue};
use serde::{Deserialize, Serialize};

/// Why a session stopped receiving a topic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnsubscribeReason {
    /// The session unsubscribed.
    Requested,
    /// Another session unsubscribed it, for example by session filter.
    Control,
    /// The topic was removed.
    Removal,
    /// The session lost read permission.
    Authorization,
    /// The session closed.
    SessionClosed,
}

/// A value delivery's payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Full(TopicValue),
    Delta(Delta),
}

impl Payload {
    pub fn is_delta(&self) -> bool {
        matches!(self, Payload::Delta(_))
    }
}

/// One message on a session's outbound queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Delivery {
    /// The session is now subscribed to `path`.
    Subscription {
        path: String,
        specification: TopicSpecification,
    },
    Value {
        path: String,
        sequence: Sequence,
        timestamp: Timestamp,
        payload: Payload,
    },
    Unsubscription {
        path: String,
        reason: UnsubscribeReason,
    },
}

impl Delivery {
    pub fn path(&self) -> &str {
        match self {
            Delivery::Subscription { path, .. }
            | Delivery::Value { path, .. }
            | Delivery::Unsubscription { path, .. } => path,
        }
    }

    pub fn is_value(&self) -> bool {
        matches!(self, Delivery::Value { .. })
    }

    /// MessagePack encoding handed to the transport.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// The record of one applied update, returned to the publisher.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdateEvent {
    pub path: String,
    pub topic_type: TopicType,
    pub sequence: Sequence,
    pub timestamp: Timestamp,
    pub old_value: Option<TopicValue>,
    pub new_value: TopicValue,
    /// Present when the update could be expressed as a delta.
    pub delta: Option<Delta>,
}

impl UpdateEvent {
    /// Whether subscribers that already have a value receive a delta.
    pub fn is_delta(&self) -> bool {
        self.delta.is_some()
    }
}

/// Queue depth signals for a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueEvent {
    UpperThresholdCrossed { session: SessionId, depth: usize },
    LowerThresholdCrossed { session: SessionId, depth: usize },
}

impl QueueEvent {
    pub fn session(&self) -> SessionId {
        match self {
            QueueEvent::UpperThresholdCrossed { session, .. }
            | QueueEvent::LowerThresholdCrossed { session, .. } => *session,
        }
    }
}
