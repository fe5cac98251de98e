//! Conditions attached to updates, evaluated atomically with them.

use super::patch::{parse_pointer, resolve};
use super::value::TopicValue;
use crate::error::{EngineError, Result};
use crate::sessions::SessionLock;
use crate::types::SessionId;
use serde_json::Value;

/// Answers whether a session holds a given lock.
pub trait LockOracle {
    fn holds(&self, session: SessionId, name: &str, sequence: u64) -> bool;
}

/// A precondition on the topic being updated.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum UpdateConstraint {
    #[default]
    Unconstrained,
    /// The topic's current value equals this one.
    ValueIs(TopicValue),
    /// The topic exists but has no value.
    NoValue,
    /// The topic does not exist. Only meaningful for add-and-set.
    NoTopic,
    /// The updating session holds this lock.
    Locked { name: String, sequence: u64 },
    /// The JSON value has these members with these values and lacks others.
    PartialJson {
        with: Vec<(String, Value)>,
        without: Vec<String>,
    },
    /// Every constraint holds.
    And(Vec<UpdateConstraint>),
}

impl UpdateConstraint {
    pub fn locked(lock: &SessionLock) -> Self {
        UpdateConstraint::Locked {
            name: lock.name.clone(),
            sequence: lock.sequence,
        }
    }

    pub fn and(self, other: UpdateConstraint) -> Self {
        match self {
            UpdateConstraint::Unconstrained => other,
            UpdateConstraint::And(mut all) => {
                all.push(other);
                UpdateConstraint::And(all)
            }
            first => UpdateConstraint::And(vec![first, other]),
        }
    }

    /// Require the JSON member at `pointer` to equal `value`.
    pub fn json_with(self, pointer: impl Into<String>, value: Value) -> Self {
        match self {
            UpdateConstraint::PartialJson { mut with, without } => {
                with.push((pointer.into(), value));
                UpdateConstraint::PartialJson { with, without }
            }
            other => other.and(UpdateConstraint::PartialJson {
                with: vec![(pointer.into(), value)],
                without: Vec::new(),
            }),
        }
    }

    /// Require the JSON member at `pointer` to be absent.
    pub fn json_without(self, pointer: impl Into<String>) -> Self {
        match self {
            UpdateConstraint::PartialJson { with, mut without } => {
                without.push(pointer.into());
                UpdateConstraint::PartialJson { with, without }
            }
            other => other.and(UpdateConstraint::PartialJson {
                with: Vec::new(),
                without: vec![pointer.into()],
            }),
        }
    }

    /// Whether the constraint allows the topic to be absent.
    pub fn requires_absent_topic(&self) -> bool {
        match self {
            UpdateConstraint::NoTopic => true,
            UpdateConstraint::And(all) => all.iter().any(Self::requires_absent_topic),
            _ => false,
        }
    }

    /// Evaluate against the topic's state. `target` is `None` when the topic
    /// does not exist, `Some(None)` when it exists without a value.
    pub(crate) fn check(
        &self,
        session: SessionId,
        target: Option<Option<&TopicValue>>,
        locks: &dyn LockOracle,
    ) -> Result<()> {
        let unsatisfied = |reason: &str| Err(EngineError::ConstraintUnsatisfied(reason.to_string()));

        match self {
            UpdateConstraint::Unconstrained => Ok(()),
            UpdateConstraint::ValueIs(expected) => match target {
                Some(Some(current)) if current == expected => Ok(()),
                Some(Some(_)) => unsatisfied("current value does not match"),
                Some(None) => unsatisfied("topic has no value"),
                None => unsatisfied("topic does not exist"),
            },
            UpdateConstraint::NoValue => match target {
                Some(None) => Ok(()),
                Some(Some(_)) => unsatisfied("topic has a value"),
                None => unsatisfied("topic does not exist"),
            },
            UpdateConstraint::NoTopic => match target {
                None => Ok(()),
                Some(_) => unsatisfied("topic exists"),
            },
            UpdateConstraint::Locked { name, sequence } => {
                if locks.holds(session, name, *sequence) {
                    Ok(())
                } else {
                    unsatisfied(&format!("lock {:?} is not held", name))
                }
            }
            UpdateConstraint::PartialJson { with, without } => {
                let json = match target {
                    Some(Some(TopicValue::Json(json))) => json,
                    _ => return unsatisfied("topic has no JSON value"),
                };
                for (pointer, expected) in with {
                    let tokens = parse_pointer(pointer)
                        .map_err(EngineError::ConstraintUnsatisfied)?;
                    if resolve(json, &tokens) != Some(expected) {
                        return unsatisfied(&format!("{} does not match", pointer));
                    }
                }
                for pointer in without {
                    let tokens = parse_pointer(pointer)
                        .map_err(EngineError::ConstraintUnsatisfied)?;
                    if resolve(json, &tokens).is_some() {
                        return unsatisfied(&format!("{} is present", pointer));
                    }
                }
                Ok(())
            }
            UpdateConstraint::And(all) => all
                .iter()
                .try_for_each(|constraint| constraint.check(session, target, locks)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct NoLocks;

    impl LockOracle for NoLocks {
        fn holds(&self, _: SessionId, _: &str, _: u64) -> bool {
            false
        }
    }

    struct HoldsA;

    impl LockOracle for HoldsA {
        fn holds(&self, session: SessionId, name: &str, sequence: u64) -> bool {
            session == SessionId(1) && name == "A" && sequence == 7
        }
    }

    const S: SessionId = SessionId(1);

    #[test]
    fn test_value_is() {
        let v = TopicValue::string("x");
        let c = UpdateConstraint::ValueIs(v.clone());
        assert!(c.check(S, Some(Some(&v)), &NoLocks).is_ok());
        let other = TopicValue::string("y");
        assert!(matches!(
            c.check(S, Some(Some(&other)), &NoLocks),
            Err(EngineError::ConstraintUnsatisfied(_))
        ));
        assert!(c.check(S, None, &NoLocks).is_err());
    }

    #[test]
    fn test_no_value_and_no_topic() {
        assert!(UpdateConstraint::NoValue.check(S, Some(None), &NoLocks).is_ok());
        assert!(UpdateConstraint::NoValue.check(S, None, &NoLocks).is_err());
        assert!(UpdateConstraint::NoTopic.check(S, None, &NoLocks).is_ok());
        assert!(UpdateConstraint::NoTopic.check(S, Some(None), &NoLocks).is_err());
    }

    #[test]
    fn test_locked() {
        let c = UpdateConstraint::Locked {
            name: "A".into(),
            sequence: 7,
        };
        assert!(c.check(S, Some(None), &HoldsA).is_ok());
        assert!(c.check(SessionId(2), Some(None), &HoldsA).is_err());
        assert!(c.check(S, Some(None), &NoLocks).is_err());
    }

    #[test]
    fn test_partial_json() {
        let value = TopicValue::json(json!({"price": 10, "meta": {"open": true}}));
        let c = UpdateConstraint::Unconstrained
            .json_with("/price", json!(10))
            .json_without("/closed");
        assert!(c.check(S, Some(Some(&value)), &NoLocks).is_ok());

        let c = UpdateConstraint::Unconstrained.json_with("/meta/open", json!(false));
        assert!(c.check(S, Some(Some(&value)), &NoLocks).is_err());
    }

    #[test]
    fn test_and_requires_all() {
        let v = TopicValue::Int64(3);
        let c = UpdateConstraint::ValueIs(v.clone()).and(UpdateConstraint::Locked {
            name: "A".into(),
            sequence: 7,
        });
        assert!(c.check(S, Some(Some(&v)), &HoldsA).is_ok());
        assert!(c.check(S, Some(Some(&v)), &NoLocks).is_err());
        assert!(!c.requires_absent_topic());
        assert!(UpdateConstraint::NoTopic
            .and(UpdateConstraint::Unconstrained)
            .requires_absent_topic());
    }
}
