//! Error types for the topic engine.

use crate::types::{SessionId, TopicType};
use thiserror::Error;

/// Why an add-topic request was refused.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AddFailureReason {
    /// The calling session may not modify this part of the tree.
    PermissionDenied,
    /// The path is empty or has empty segments.
    InvalidPath,
    /// A topic of the same type but a different specification exists.
    ExistsMismatch,
    /// The specification itself is unusable (bad removal policy, value type).
    InvalidDetails(String),
    /// The path holds a reference topic maintained by a topic view.
    ExclusiveUpdaterConflict,
}

impl std::fmt::Display for AddFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddFailureReason::PermissionDenied => write!(f, "permission denied"),
            AddFailureReason::InvalidPath => write!(f, "invalid path"),
            AddFailureReason::ExistsMismatch => {
                write!(f, "topic exists with a different specification")
            }
            AddFailureReason::InvalidDetails(detail) => write!(f, "invalid details: {}", detail),
            AddFailureReason::ExclusiveUpdaterConflict => write!(f, "exclusive updater conflict"),
        }
    }
}

/// Main error type for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Topic {path} already exists with type {existing:?}")]
    IncompatibleTopicExists { path: String, existing: TopicType },

    #[error("Failed to add topic {path}: {reason}")]
    TopicAddFailed {
        path: String,
        reason: AddFailureReason,
    },

    #[error("Update constraint not satisfied: {0}")]
    ConstraintUnsatisfied(String),

    #[error("Session closed: {0}")]
    SessionClosed(SessionId),

    #[error("Session establishment failed: {0}")]
    SessionEstablishment(String),

    #[error("Unknown session: {0}")]
    UnknownSession(SessionId),

    #[error("Operation discarded: {0}")]
    OperationDiscarded(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("No such topic: {0}")]
    NoSuchTopic(String),

    #[error("Invalid topic path: {0:?}")]
    InvalidPath(String),

    #[error("Invalid topic selector {expression:?}: {reason}")]
    InvalidSelector { expression: String, reason: String },

    #[error("Invalid session filter {expression:?}: {reason}")]
    InvalidFilter { expression: String, reason: String },

    #[error("Invalid removal policy {expression:?}: {reason}")]
    InvalidRemovalPolicy { expression: String, reason: String },

    #[error("Invalid update for {path}: {reason}")]
    InvalidUpdate { path: String, reason: String },

    #[error("JSON patch operation {index} failed: {reason}")]
    JsonPatchFailed { index: usize, reason: String },

    #[error("Invalid sequence {sequence} for time series {path}")]
    InvalidSequence { path: String, sequence: u64 },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Invalid topic view {expression:?}: {reason}")]
    InvalidTopicView { expression: String, reason: String },

    #[error("No request handler for {0}")]
    NoRequestHandler(String),

    #[error("Request rejected: {0}")]
    RequestRejected(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for EngineError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for EngineError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        EngineError::Deserialization(e.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
