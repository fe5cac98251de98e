//! Topic removal policies.
//!
//! A policy is the value of a topic's `REMOVAL` property:
//!
//! ```text
//! policy    := "when" expr [ "remove" QUOTED ]
//! expr      := term ( "or" term )*
//! term      := factor ( "and" factor )*
//! factor    := "(" expr ")" | condition [ "after" DURATION ]
//! condition := "time" "after" ( MILLIS | QUOTED-RFC-2822-DATE )
//!            | "subscriptions" "<" N "for" DURATION
//!            | "no" "updates" "for" DURATION
//!            | "no" "session" "has" QUOTED-FILTER [ "for" DURATION ]
//!            | "this" "session" "closes"
//! DURATION  := N ( "s" | "m" | "h" | "d" )
//! ```
//!
//! Without a `remove` clause the topic removes itself.

use crate::error::{EngineError, Result};
use crate::selectors::TopicSelector;
use crate::sessions::SessionFilter;
use crate::types::Timestamp;
use std::time::Duration;

#[derive(Clone, Debug)]
enum Condition {
    TimeAfter(Timestamp),
    SubscriptionsBelow { count: usize, period: Duration },
    NoUpdatesFor(Duration),
    NoSessionHas { filter: SessionFilter, period: Duration },
    ThisSessionCloses,
}

#[derive(Clone, Debug)]
struct Clause {
    condition: Condition,
    after: Option<Duration>,
}

#[derive(Clone, Debug)]
enum Expr {
    Clause(usize),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    fn eval(&self, results: &[bool]) -> bool {
        match self {
            Expr::Clause(index) => results[*index],
            Expr::And(l, r) => l.eval(results) && r.eval(results),
            Expr::Or(l, r) => l.eval(results) || r.eval(results),
        }
    }
}

/// Per-topic timing state for the `for D` conditions.
#[derive(Clone, Debug, Default)]
pub(crate) struct PolicyTracker {
    since: Vec<Option<Timestamp>>,
}

/// What a policy is evaluated against.
pub(crate) struct PolicyInputs<'a> {
    pub(crate) now: Timestamp,
    pub(crate) created_at: Timestamp,
    pub(crate) last_updated: Option<Timestamp>,
    pub(crate) owner_closed: bool,
    pub(crate) session_matches: &'a dyn Fn(&SessionFilter) -> bool,
}

/// A compiled removal policy.
#[derive(Clone, Debug)]
pub struct RemovalPolicy {
    expression: String,
    clauses: Vec<Clause>,
    root: Expr,
    remove: Option<TopicSelector>,
}

impl RemovalPolicy {
    pub fn parse(expression: &str) -> Result<Self> {
        let tokens = tokenize(expression)?;
        let mut parser = Parser {
            expression,
            tokens,
            position: 0,
            clauses: Vec::new(),
        };
        parser.keyword("when")?;
        let root = parser.parse_or()?;
        let remove = if parser.peek_keyword("remove") {
            parser.position += 1;
            let selector = parser.quoted()?;
            Some(TopicSelector::compile(&selector).map_err(|e| parser.error(&e.to_string()))?)
        } else {
            None
        };
        if parser.position != parser.tokens.len() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(Self {
            expression: expression.to_string(),
            clauses: parser.clauses,
            root,
            remove,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Topics to remove when the policy fires; `None` means the topic itself.
    pub fn remove_selector(&self) -> Option<&TopicSelector> {
        self.remove.as_ref()
    }

    /// Whether the policy reacts to its creating session closing.
    pub fn on_session_close(&self) -> bool {
        self.clauses
            .iter()
            .any(|c| matches!(c.condition, Condition::ThisSessionCloses))
    }

    pub(crate) fn tracker(&self, created_at: Timestamp) -> PolicyTracker {
        PolicyTracker {
            since: self
                .clauses
                .iter()
                .map(|c| match c.condition {
                    // A new topic has no subscribers.
                    Condition::SubscriptionsBelow { count, .. } if count > 0 => Some(created_at),
                    _ => None,
                })
                .collect(),
        }
    }

    /// Record a change in the topic's subscriber count.
    pub(crate) fn observe_subscribers(&self, tracker: &mut PolicyTracker, subscribers: usize, now: Timestamp) {
        for (clause, since) in self.clauses.iter().zip(tracker.since.iter_mut()) {
            if let Condition::SubscriptionsBelow { count, .. } = clause.condition {
                if subscribers < count {
                    since.get_or_insert(now);
                } else {
                    *since = None;
                }
            }
        }
    }

    pub(crate) fn evaluate(&self, tracker: &mut PolicyTracker, inputs: &PolicyInputs<'_>) -> bool {
        let now = inputs.now;
        let results: Vec<bool> = self
            .clauses
            .iter()
            .zip(tracker.since.iter_mut())
            .map(|(clause, since)| {
                let held = match &clause.condition {
                    Condition::TimeAfter(at) => now >= *at,
                    Condition::SubscriptionsBelow { period, .. } => {
                        since.is_some_and(|s| now.since(s) >= *period)
                    }
                    Condition::NoUpdatesFor(period) => {
                        now.since(inputs.last_updated.unwrap_or(inputs.created_at)) >= *period
                    }
                    Condition::NoSessionHas { filter, period } => {
                        if (inputs.session_matches)(filter) {
                            *since = None;
                            false
                        } else {
                            now.since(*since.get_or_insert(now)) >= *period
                        }
                    }
                    Condition::ThisSessionCloses => inputs.owner_closed,
                };
                let active = clause
                    .after
                    .map(|after| now >= inputs.created_at.plus(after))
                    .unwrap_or(true);
                held && active
            })
            .collect();
        self.root.eval(&results)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Token {
    Word(String),
    Quoted(String),
    Less,
    Open,
    Close,
}

fn invalid(expression: &str, reason: impl Into<String>) -> EngineError {
    EngineError::InvalidRemovalPolicy {
        expression: expression.to_string(),
        reason: reason.into(),
    }
}

fn tokenize(expression: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = expression.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '<' => {
                chars.next();
                tokens.push(Token::Less);
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            '\'' | '"' => {
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some(next) if next == c => break,
                        Some(next) => value.push(next),
                        None => return Err(invalid(expression, "unterminated string")),
                    }
                }
                tokens.push(Token::Quoted(value));
            }
            _ => {
                let mut word = String::new();
                while let Some(&next) = chars.peek() {
                    if next.is_whitespace() || matches!(next, '<' | '(' | ')' | '\'' | '"') {
                        break;
                    }
                    word.push(next);
                    chars.next();
                }
                tokens.push(Token::Word(word));
            }
        }
    }
    Ok(tokens)
}

/// Parse `10s`, `5m`, `2h` or `1d`.
pub(crate) fn parse_duration(text: &str) -> Option<Duration> {
    let split = text.find(|c: char| !c.is_ascii_digit())?;
    let (digits, unit) = text.split_at(split);
    let amount: u64 = digits.parse().ok()?;
    let seconds = match unit.to_ascii_lowercase().as_str() {
        "s" => amount,
        "m" => amount.checked_mul(60)?,
        "h" => amount.checked_mul(3600)?,
        "d" => amount.checked_mul(86_400)?,
        _ => return None,
    };
    Some(Duration::from_secs(seconds))
}

struct Parser<'a> {
    expression: &'a str,
    tokens: Vec<Token>,
    position: usize,
    clauses: Vec<Clause>,
}

impl Parser<'_> {
    fn error(&self, reason: &str) -> EngineError {
        invalid(self.expression, format!("{} at token {}", reason, self.position))
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.tokens.get(self.position), Some(Token::Word(w)) if w.eq_ignore_ascii_case(keyword))
    }

    fn keyword(&mut self, keyword: &str) -> Result<()> {
        if self.peek_keyword(keyword) {
            self.position += 1;
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", keyword)))
        }
    }

    fn word(&mut self) -> Result<String> {
        match self.tokens.get(self.position) {
            Some(Token::Word(w)) => {
                self.position += 1;
                Ok(w.clone())
            }
            _ => Err(self.error("expected a word")),
        }
    }

    fn quoted(&mut self) -> Result<String> {
        match self.tokens.get(self.position) {
            Some(Token::Quoted(q)) => {
                self.position += 1;
                Ok(q.clone())
            }
            _ => Err(self.error("expected a quoted string")),
        }
    }

    fn duration(&mut self) -> Result<Duration> {
        let word = self.word()?;
        parse_duration(&word).ok_or_else(|| self.error(&format!("invalid duration '{}'", word)))
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.peek_keyword("or") {
            self.position += 1;
            left = Expr::Or(Box::new(left), Box::new(self.parse_and()?));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_factor()?;
        while self.peek_keyword("and") {
            self.position += 1;
            left = Expr::And(Box::new(left), Box::new(self.parse_factor()?));
        }
        Ok(left)
    }

    fn parse_factor(&mut self) -> Result<Expr> {
        if self.tokens.get(self.position) == Some(&Token::Open) {
            self.position += 1;
            let inner = self.parse_or()?;
            if self.tokens.get(self.position) != Some(&Token::Close) {
                return Err(self.error("expected ')'"));
            }
            self.position += 1;
            return Ok(inner);
        }
        let condition = self.parse_condition()?;
        let after = if self.peek_keyword("after") {
            self.position += 1;
            Some(self.duration()?)
        } else {
            None
        };
        self.clauses.push(Clause { condition, after });
        Ok(Expr::Clause(self.clauses.len() - 1))
    }

    fn parse_condition(&mut self) -> Result<Condition> {
        let first = self.word()?.to_ascii_lowercase();
        match first.as_str() {
            "time" => {
                self.keyword("after")?;
                let at = match self.tokens.get(self.position).cloned() {
                    Some(Token::Word(millis)) => millis
                        .parse::<i64>()
                        .map_err(|_| self.error("invalid time"))?,
                    Some(Token::Quoted(date)) => chrono::DateTime::parse_from_rfc2822(&date)
                        .map_err(|e| self.error(&format!("invalid date: {}", e)))?
                        .timestamp_millis(),
                    _ => return Err(self.error("expected a time")),
                };
                self.position += 1;
                Ok(Condition::TimeAfter(Timestamp(at)))
            }
            "subscriptions" => {
                if self.tokens.get(self.position) != Some(&Token::Less) {
                    return Err(self.error("expected '<'"));
                }
                self.position += 1;
                let count = self
                    .word()?
                    .parse::<usize>()
                    .map_err(|_| self.error("invalid subscription count"))?;
                self.keyword("for")?;
                Ok(Condition::SubscriptionsBelow {
                    count,
                    period: self.duration()?,
                })
            }
            "no" => {
                if self.peek_keyword("updates") {
                    self.position += 1;
                    self.keyword("for")?;
                    return Ok(Condition::NoUpdatesFor(self.duration()?));
                }
                self.keyword("session")?;
                self.keyword("has")?;
                let filter = SessionFilter::parse(&self.quoted()?)
                    .map_err(|e| self.error(&e.to_string()))?;
                let period = if self.peek_keyword("for") {
                    self.position += 1;
                    self.duration()?
                } else {
                    Duration::ZERO
                };
                Ok(Condition::NoSessionHas { filter, period })
            }
            "this" => {
                self.keyword("session")?;
                self.keyword("closes")?;
                Ok(Condition::ThisSessionCloses)
            }
            other => Err(self.error(&format!("unknown condition '{}'", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs<'a>(now: i64, last: Option<i64>, f: &'a dyn Fn(&SessionFilter) -> bool) -> PolicyInputs<'a> {
        PolicyInputs {
            now: Timestamp(now),
            created_at: Timestamp(0),
            last_updated: last.map(Timestamp),
            owner_closed: false,
            session_matches: f,
        }
    }

    #[test]
    fn test_parse_durations() {
        assert_eq!(parse_duration("10s"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration("10"), None);
        assert_eq!(parse_duration("5y"), None);
    }

    #[test]
    fn test_time_after_millis_and_date() {
        let policy = RemovalPolicy::parse("when time after 1000").unwrap();
        let mut tracker = policy.tracker(Timestamp(0));
        let none = |_: &SessionFilter| false;
        assert!(!policy.evaluate(&mut tracker, &inputs(999, None, &none)));
        assert!(policy.evaluate(&mut tracker, &inputs(1000, None, &none)));

        let dated = RemovalPolicy::parse("when time after 'Thu, 01 Jan 1970 00:00:02 +0000'").unwrap();
        let mut tracker = dated.tracker(Timestamp(0));
        assert!(dated.evaluate(&mut tracker, &inputs(2000, None, &none)));
    }

    #[test]
    fn test_subscriptions_below_tracks_period() {
        let policy = RemovalPolicy::parse("when subscriptions < 1 for 10s").unwrap();
        let mut tracker = policy.tracker(Timestamp(0));
        let none = |_: &SessionFilter| false;
        policy.observe_subscribers(&mut tracker, 1, Timestamp(5_000));
        assert!(!policy.evaluate(&mut tracker, &inputs(20_000, None, &none)));
        policy.observe_subscribers(&mut tracker, 0, Timestamp(20_000));
        assert!(!policy.evaluate(&mut tracker, &inputs(29_999, None, &none)));
        assert!(policy.evaluate(&mut tracker, &inputs(30_000, None, &none)));
    }

    #[test]
    fn test_combined_conditions_and_remove_clause() {
        let policy = RemovalPolicy::parse(
            "when no updates for 1m and (this session closes or time after 5000) remove '?a//'",
        )
        .unwrap();
        assert_eq!(policy.remove_selector().map(|s| s.expression()), Some("?a//"));
        assert!(policy.on_session_close());
        let mut tracker = policy.tracker(Timestamp(0));
        let none = |_: &SessionFilter| false;
        assert!(!policy.evaluate(&mut tracker, &inputs(59_000, None, &none)));
        assert!(policy.evaluate(&mut tracker, &inputs(60_000, None, &none)));
        assert!(!policy.evaluate(&mut tracker, &inputs(60_000, Some(30_000), &none)));
    }

    #[test]
    fn test_no_session_has() {
        let policy = RemovalPolicy::parse("when no session has '$Principal is \"ops\"' for 1s").unwrap();
        let mut tracker = policy.tracker(Timestamp(0));
        let present = |_: &SessionFilter| true;
        let absent = |_: &SessionFilter| false;
        assert!(!policy.evaluate(&mut tracker, &inputs(0, None, &present)));
        assert!(!policy.evaluate(&mut tracker, &inputs(100, None, &absent)));
        assert!(policy.evaluate(&mut tracker, &inputs(1_100, None, &absent)));
    }

    #[test]
    fn test_after_gates_clause() {
        let policy = RemovalPolicy::parse("when no updates for 1s after 1h").unwrap();
        let mut tracker = policy.tracker(Timestamp(0));
        let none = |_: &SessionFilter| false;
        assert!(!policy.evaluate(&mut tracker, &inputs(10_000, None, &none)));
        assert!(policy.evaluate(&mut tracker, &inputs(3_600_000, None, &none)));
    }

    #[test]
    fn test_parse_errors() {
        for bad in [
            "",
            "time after 10",
            "when",
            "when subscriptions 1 for 10s",
            "when no updates for ten",
            "when this session ends",
            "when time after 'not a date'",
            "when no updates for 1s remove",
        ] {
            assert!(
                matches!(RemovalPolicy::parse(bad), Err(EngineError::InvalidRemovalPolicy { .. })),
                "{} should fail",
                bad
            );
        }
    }
}
