//! Time series event logs.
//!
//! Every append gets the next sequence number. An edit is a new event with
//! its own sequence number that refers back to the original event; the
//! original stays queryable through [`QueryView::Edits`].

use super::value::TopicValue;
use crate::error::{EngineError, Result};
use crate::types::{Sequence, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// Identity of an event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub sequence: Sequence,
    pub timestamp: Timestamp,
    /// Principal of the session that wrote the event.
    pub author: String,
}

/// One event in a time series.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesEvent {
    pub sequence: Sequence,
    pub timestamp: Timestamp,
    pub author: String,
    pub value: TopicValue,
    /// For edit events, the event this one edits.
    pub original: Option<EventMetadata>,
}

impl TimeSeriesEvent {
    pub fn is_edit(&self) -> bool {
        self.original.is_some()
    }

    pub fn metadata(&self) -> EventMetadata {
        EventMetadata {
            sequence: self.sequence,
            timestamp: self.timestamp,
            author: self.author.clone(),
        }
    }

    /// Sequence of the original event (itself, unless this is an edit).
    pub fn original_sequence(&self) -> Sequence {
        self.original
            .as_ref()
            .map(|o| o.sequence)
            .unwrap_or(self.sequence)
    }
}

/// Which events a query sees.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum QueryView {
    /// Original events, each showing its latest edit.
    #[default]
    Values,
    /// Every event, originals and edits, in sequence order.
    Edits,
}

/// A query bound. Sequence and timestamp bounds are inclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum RangeAnchor {
    #[default]
    Open,
    Sequence(u64),
    Timestamp(Timestamp),
    /// As a start bound: the last N events in the range.
    /// As an end bound: at most N events from the start.
    Count(usize),
}

/// A range query over one time series.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RangeQuery {
    pub view: QueryView,
    pub from: RangeAnchor,
    pub to: RangeAnchor,
    pub limit: Option<usize>,
}

impl RangeQuery {
    pub fn values() -> Self {
        Self::default()
    }

    pub fn edits() -> Self {
        Self {
            view: QueryView::Edits,
            ..Self::default()
        }
    }

    pub fn from_sequence(mut self, sequence: u64) -> Self {
        self.from = RangeAnchor::Sequence(sequence);
        self
    }

    pub fn from_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.from = RangeAnchor::Timestamp(timestamp);
        self
    }

    pub fn from_last(mut self, count: usize) -> Self {
        self.from = RangeAnchor::Count(count);
        self
    }

    pub fn to_sequence(mut self, sequence: u64) -> Self {
        self.to = RangeAnchor::Sequence(sequence);
        self
    }

    pub fn to_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.to = RangeAnchor::Timestamp(timestamp);
        self
    }

    pub fn next(mut self, count: usize) -> Self {
        self.to = RangeAnchor::Count(count);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// The retained events of one time series topic.
#[derive(Clone, Debug)]
pub struct TimeSeriesLog {
    events: VecDeque<TimeSeriesEvent>,
    next_sequence: Sequence,
    retained: usize,
    /// Original sequence -> sequence of its latest edit.
    latest_edit: HashMap<Sequence, Sequence>,
}

impl TimeSeriesLog {
    pub fn new(retained: usize) -> Self {
        Self {
            events: VecDeque::new(),
            next_sequence: Sequence(0),
            retained: retained.max(1),
            latest_edit: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// The most recently written event, append or edit.
    pub fn latest(&self) -> Option<&TimeSeriesEvent> {
        self.events.back()
    }

    pub fn append(
        &mut self,
        value: TopicValue,
        timestamp: Timestamp,
        author: &str,
    ) -> Result<TimeSeriesEvent> {
        if let Some(last) = self.events.back() {
            if timestamp < last.timestamp {
                return Err(EngineError::InvalidOperation(format!(
                    "timestamp {:?} precedes the latest event ({:?})",
                    timestamp, last.timestamp
                )));
            }
        }

        let event = TimeSeriesEvent {
            sequence: self.next_sequence,
            timestamp,
            author: author.to_string(),
            value,
            original: None,
        };
        self.push(event.clone());
        Ok(event)
    }

    /// Edit the event with `sequence`. Editing an edit edits its original.
    pub fn edit(
        &mut self,
        path: &str,
        sequence: Sequence,
        value: TopicValue,
        timestamp: Timestamp,
        author: &str,
    ) -> Result<TimeSeriesEvent> {
        let target = self
            .find(sequence)
            .ok_or_else(|| EngineError::InvalidSequence {
                path: path.to_string(),
                sequence: sequence.0,
            })?;

        let original = match &target.original {
            Some(original) => original.clone(),
            None => target.metadata(),
        };
        if self.find(original.sequence).is_none() {
            return Err(EngineError::InvalidSequence {
                path: path.to_string(),
                sequence: sequence.0,
            });
        }

        let timestamp = self
            .events
            .back()
            .map(|last| last.timestamp.max(timestamp))
            .unwrap_or(timestamp);

        let event = TimeSeriesEvent {
            sequence: self.next_sequence,
            timestamp,
            author: author.to_string(),
            value,
            original: Some(original.clone()),
        };
        self.latest_edit.insert(original.sequence, event.sequence);
        self.push(event.clone());
        Ok(event)
    }

    fn push(&mut self, event: TimeSeriesEvent) {
        self.next_sequence = event.sequence.next();
        self.events.push_back(event);

        while self.events.len() > self.retained {
            if let Some(evicted) = self.events.pop_front() {
                if !evicted.is_edit() {
                    self.latest_edit.remove(&evicted.sequence);
                }
            }
        }
    }

    fn find(&self, sequence: Sequence) -> Option<&TimeSeriesEvent> {
        // Sequences are contiguous within the retained window.
        let first = self.events.front()?.sequence;
        let offset = sequence.0.checked_sub(first.0)? as usize;
        self.events.get(offset).filter(|e| e.sequence == sequence)
    }

    /// Run a range query.
    pub fn query(&self, query: &RangeQuery) -> Vec<TimeSeriesEvent> {
        let candidates: Vec<TimeSeriesEvent> = match query.view {
            QueryView::Edits => self.events.iter().cloned().collect(),
            QueryView::Values => self
                .events
                .iter()
                .filter(|e| !e.is_edit())
                .map(|original| {
                    match self
                        .latest_edit
                        .get(&original.sequence)
                        .and_then(|edit| self.find(*edit))
                    {
                        Some(edit) => edit.clone(),
                        None => original.clone(),
                    }
                })
                .collect(),
        };

        // Bounds apply to the original event's position in the values view.
        let key = |event: &TimeSeriesEvent| -> (Sequence, Timestamp) {
            match (query.view, &event.original) {
                (QueryView::Values, Some(original)) => (original.sequence, original.timestamp),
                _ => (event.sequence, event.timestamp),
            }
        };

        let after_start = |event: &TimeSeriesEvent| match query.from {
            RangeAnchor::Sequence(s) => key(event).0 >= Sequence(s),
            RangeAnchor::Timestamp(t) => key(event).1 >= t,
            RangeAnchor::Open | RangeAnchor::Count(_) => true,
        };
        let before_end = |event: &TimeSeriesEvent| match query.to {
            RangeAnchor::Sequence(s) => key(event).0 <= Sequence(s),
            RangeAnchor::Timestamp(t) => key(event).1 <= t,
            RangeAnchor::Open | RangeAnchor::Count(_) => true,
        };

        let mut selected: Vec<TimeSeriesEvent> = candidates
            .into_iter()
            .filter(|e| after_start(e) && before_end(e))
            .collect();

        if let RangeAnchor::Count(n) = query.from {
            let skip = selected.len().saturating_sub(n);
            selected.drain(..skip);
        }
        if let RangeAnchor::Count(n) = query.to {
            selected.truncate(n);
        }
        if let Some(limit) = query.limit {
            selected.truncate(limit);
        }
        selected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_with(values: &[i64]) -> TimeSeriesLog {
        let mut log = TimeSeriesLog::new(100);
        for (i, v) in values.iter().enumerate() {
            log.append(TopicValue::Int64(*v), Timestamp(1_000 + i as i64 * 10), "control")
                .unwrap();
        }
        log
    }

    #[test]
    fn test_sequences_strictly_increase() {
        let log = log_with(&[1, 2, 3]);
        let seqs: Vec<u64> = log
            .query(&RangeQuery::edits())
            .iter()
            .map(|e| e.sequence.0)
            .collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn test_edit_supersedes_in_values_view() {
        let mut log = log_with(&[1, 2, 3]);
        let edit = log
            .edit("ts", Sequence(1), TopicValue::Int64(20), Timestamp(2_000), "editor")
            .unwrap();
        assert_eq!(edit.sequence, Sequence(3));
        assert_eq!(edit.original.as_ref().unwrap().sequence, Sequence(1));

        let values: Vec<_> = log.query(&RangeQuery::values());
        assert_eq!(values.len(), 3);
        assert_eq!(values[1].value, TopicValue::Int64(20));
        assert_eq!(values[1].original_sequence(), Sequence(1));

        let edits = log.query(&RangeQuery::edits());
        assert_eq!(edits.len(), 4);
        assert_eq!(edits[1].value, TopicValue::Int64(2));
    }

    #[test]
    fn test_edit_of_edit_targets_original() {
        let mut log = log_with(&[1]);
        log.edit("ts", Sequence(0), TopicValue::Int64(2), Timestamp(2_000), "a")
            .unwrap();
        let second = log
            .edit("ts", Sequence(1), TopicValue::Int64(3), Timestamp(2_001), "a")
            .unwrap();
        assert_eq!(second.original.unwrap().sequence, Sequence(0));
        let values = log.query(&RangeQuery::values());
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].value, TopicValue::Int64(3));
    }

    #[test]
    fn test_edit_unknown_sequence() {
        let mut log = log_with(&[1]);
        let err = log
            .edit("ts", Sequence(9), TopicValue::Int64(2), Timestamp(2_000), "a")
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidSequence { sequence: 9, .. }));
    }

    #[test]
    fn test_inclusive_bounds_and_last() {
        let log = log_with(&[10, 11, 12, 13, 14]);
        let window = log.query(&RangeQuery::values().from_sequence(1).to_sequence(3));
        let values: Vec<_> = window.iter().map(|e| e.value.clone()).collect();
        assert_eq!(
            values,
            vec![TopicValue::Int64(11), TopicValue::Int64(12), TopicValue::Int64(13)]
        );

        let last = log.query(&RangeQuery::values().from_last(2));
        assert_eq!(last.len(), 2);
        assert_eq!(last[0].sequence, Sequence(3));

        let by_time = log.query(
            &RangeQuery::values()
                .from_timestamp(Timestamp(1_010))
                .to_timestamp(Timestamp(1_020)),
        );
        assert_eq!(by_time.len(), 2);

        let limited = log.query(&RangeQuery::values().next(4).limit(2));
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn test_retention_evicts_oldest() {
        let mut log = TimeSeriesLog::new(2);
        for v in 0..5 {
            log.append(TopicValue::Int64(v), Timestamp(v), "a").unwrap();
        }
        assert_eq!(log.len(), 2);
        assert_eq!(log.latest().unwrap().sequence, Sequence(4));
        assert!(log
            .edit("ts", Sequence(0), TopicValue::Int64(9), Timestamp(10), "a")
            .is_err());
    }

    #[test]
    fn test_append_rejects_earlier_timestamp() {
        let mut log = log_with(&[1]);
        assert!(log
            .append(TopicValue::Int64(2), Timestamp(0), "a")
            .is_err());
    }
}
