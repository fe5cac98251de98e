//! Topic values, deltas, patches, update constraints and time series.
//!
//! The delta engine keeps the distinction between a field that did not
//! change and a field that changed to the empty string; see
//! [`FieldChange`] and [`RecordDelta::encode`].

mod constraint;
mod delta;
mod patch;
mod timeseries;
mod value;

pub use constraint::{LockOracle, UpdateConstraint};
pub use delta::{compute_delta, diff_json, Delta, FieldChange, RecordDelta};
pub use patch::{apply_patch, parse_json_patch, PatchOperation};
pub use timeseries::{
    EventMetadata, QueryView, RangeAnchor, RangeQuery, TimeSeriesEvent, TimeSeriesLog,
};
pub use value::{RecordValue, TopicValue};
