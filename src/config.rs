//! Engine configuration.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Outbound queue limits applied to every new session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Depth at which `UpperThresholdCrossed` is signalled.
    /// Default: 1000
    pub high_watermark: usize,

    /// Depth at which `LowerThresholdCrossed` is signalled after a high crossing.
    /// Default: 100
    pub low_watermark: usize,

    /// Hard limit after conflation; a session beyond it is closed.
    /// Default: 10_000
    pub max_depth: usize,

    /// Whether new sessions start with conflation enabled.
    pub conflate: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            high_watermark: 1000,
            low_watermark: 100,
            max_depth: 10_000,
            conflate: false,
        }
    }
}

/// Engine configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long a disconnected session is kept for reconnection.
    /// Zero disables reconnection.
    pub reconnection_timeout: Duration,

    /// Queue limits for new sessions.
    pub queue: QueueConfig,

    /// How long a request waits for a missing-topic handler to proceed.
    pub missing_topic_timeout: Duration,

    /// Default number of events a time series topic keeps.
    pub time_series_retained_events: usize,

    /// How long a closed session is remembered so that calls on it fail
    /// with `SessionClosed` rather than `UnknownSession`.
    /// Default: 10 minutes
    pub closed_session_retention: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reconnection_timeout: Duration::from_secs(60),
            queue: QueueConfig::default(),
            missing_topic_timeout: Duration::from_secs(30),
            time_series_retained_events: 1000,
            closed_session_retention: Duration::from_secs(600),
        }
    }
}

impl EngineConfig {
    /// Parse a JSON configuration document. Missing fields take defaults.
    pub fn from_json(document: &str) -> Result<Self> {
        Ok(serde_json::from_str(document)?)
    }

    pub fn reconnection_enabled(&self) -> bool {
        !self.reconnection_timeout.is_zero()
    }
}
