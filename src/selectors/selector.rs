//! Selector compilation and matching.

use crate::error::{EngineError, Result};
use crate::types::{is_in_branch, validate_path};
use regex::Regex;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Separator between the members of a selector set.
const SET_SEPARATOR: &str = "////";

/// How a selector treats the paths below the one it names.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Qualifier {
    /// Only the named path.
    Path,
    /// Only paths strictly below it (`/`).
    Descendants,
    /// The path and everything below it (`//`).
    PathAndDescendants,
}

#[derive(Clone, Debug)]
enum Kind {
    Path {
        path: String,
        qualifier: Qualifier,
    },
    SplitPattern {
        segments: Vec<Regex>,
        literal_prefix: String,
        qualifier: Qualifier,
    },
    FullPattern {
        regex: Regex,
        literal_prefix: String,
        qualifier: Qualifier,
    },
    Set(Vec<TopicSelector>),
}

/// A compiled, immutable topic selector.
///
/// Two selectors are equal when their expressions are equal.
#[derive(Clone, Debug)]
pub struct TopicSelector {
    expression: String,
    kind: Kind,
}

impl PartialEq for TopicSelector {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression
    }
}

impl Eq for TopicSelector {}

impl Hash for TopicSelector {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.expression.hash(state);
    }
}

impl fmt::Display for TopicSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

impl std::str::FromStr for TopicSelector {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::compile(s)
    }
}

fn invalid(expression: &str, reason: impl Into<String>) -> EngineError {
    EngineError::InvalidSelector {
        expression: expression.to_string(),
        reason: reason.into(),
    }
}

fn split_qualifier(body: &str) -> (&str, Qualifier) {
    if let Some(stripped) = body.strip_suffix("//") {
        (stripped, Qualifier::PathAndDescendants)
    } else if let Some(stripped) = body.strip_suffix('/') {
        (stripped, Qualifier::Descendants)
    } else {
        (body, Qualifier::Path)
    }
}

fn anchored(expression: &str, pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| invalid(expression, e.to_string()))
}

fn is_literal(pattern: &str) -> bool {
    !pattern.chars().any(|c| "\\.+*?()|[]{}^$".contains(c))
}

/// Longest leading run of segments of `pattern` free of regex syntax.
fn literal_segments_prefix(pattern: &str) -> String {
    let literal: Vec<&str> = pattern
        .split('/')
        .take_while(|segment| !segment.is_empty() && is_literal(segment))
        .collect();
    literal.join("/")
}

/// Literal prefix of a full-path pattern. A segment only counts when a
/// separator follows it, since the regex after it may extend the segment.
fn full_pattern_prefix(pattern: &str) -> String {
    if is_literal(pattern) {
        return pattern.to_string();
    }
    if pattern.contains('|') {
        return String::new();
    }
    let mut segments: Vec<&str> = pattern.split('/').collect();
    segments.pop();
    let literal: Vec<&str> = segments
        .into_iter()
        .take_while(|segment| !segment.is_empty() && is_literal(segment))
        .collect();
    literal.join("/")
}

impl TopicSelector {
    /// Compile a selector expression.
    pub fn compile(expression: &str) -> Result<Self> {
        let kind = if let Some(body) = expression.strip_prefix('#') {
            let members = body
                .split(SET_SEPARATOR)
                .map(|member| {
                    if member.is_empty() {
                        Err(invalid(expression, "empty selector in set"))
                    } else {
                        TopicSelector::compile(member)
                    }
                })
                .collect::<Result<Vec<_>>>()?;
            Kind::Set(members)
        } else if let Some(body) = expression.strip_prefix('?') {
            let (pattern, qualifier) = split_qualifier(body);
            if pattern.is_empty() {
                return Err(invalid(expression, "empty pattern"));
            }
            let segments = pattern
                .split('/')
                .map(|segment| anchored(expression, segment))
                .collect::<Result<Vec<_>>>()?;
            Kind::SplitPattern {
                segments,
                literal_prefix: literal_segments_prefix(pattern),
                qualifier,
            }
        } else if let Some(body) = expression.strip_prefix('*') {
            let (pattern, qualifier) = split_qualifier(body);
            if pattern.is_empty() {
                return Err(invalid(expression, "empty pattern"));
            }
            let literal_prefix = full_pattern_prefix(pattern);
            Kind::FullPattern {
                regex: anchored(expression, pattern)?,
                literal_prefix,
                qualifier,
            }
        } else {
            let body = expression.strip_prefix('>').unwrap_or(expression);
            let (path, qualifier) = split_qualifier(body);
            if !validate_path(path) {
                return Err(invalid(expression, "invalid path"));
            }
            Kind::Path {
                path: path.to_string(),
                qualifier,
            }
        };

        Ok(Self {
            expression: expression.to_string(),
            kind,
        })
    }

    /// Selector for exactly one path.
    pub fn path(path: &str) -> Result<Self> {
        Self::compile(&format!(">{}", path))
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Whether the selector matches `path`.
    pub fn matches(&self, path: &str) -> bool {
        match &self.kind {
            Kind::Path { path: named, qualifier } => match qualifier {
                Qualifier::Path => path == named,
                Qualifier::Descendants => path != named && is_in_branch(path, named),
                Qualifier::PathAndDescendants => is_in_branch(path, named),
            },
            Kind::SplitPattern {
                segments,
                qualifier,
                ..
            } => {
                let parts: Vec<&str> = path.split('/').collect();
                let depth_ok = match qualifier {
                    Qualifier::Path => parts.len() == segments.len(),
                    Qualifier::Descendants => parts.len() > segments.len(),
                    Qualifier::PathAndDescendants => parts.len() >= segments.len(),
                };
                depth_ok
                    && segments
                        .iter()
                        .zip(&parts)
                        .all(|(regex, part)| regex.is_match(part))
            }
            Kind::FullPattern {
                regex, qualifier, ..
            } => {
                let ancestors = || {
                    path.match_indices('/')
                        .map(|(i, _)| &path[..i])
                        .any(|ancestor| regex.is_match(ancestor))
                };
                match qualifier {
                    Qualifier::Path => regex.is_match(path),
                    Qualifier::Descendants => ancestors(),
                    Qualifier::PathAndDescendants => regex.is_match(path) || ancestors(),
                }
            }
            Kind::Set(members) => members.iter().any(|m| m.matches(path)),
        }
    }

    /// The literal path every match starts with (possibly empty).
    pub fn path_prefix(&self) -> String {
        match &self.kind {
            Kind::Path { path, .. } => path.clone(),
            Kind::SplitPattern { literal_prefix, .. } | Kind::FullPattern { literal_prefix, .. } => {
                literal_prefix.clone()
            }
            Kind::Set(members) => {
                let prefixes: Vec<String> = members.iter().map(|m| m.path_prefix()).collect();
                let Some((first, rest)) = prefixes.split_first() else {
                    return String::new();
                };
                let mut common: Vec<&str> = first.split('/').collect();
                for other in rest {
                    let shared = common
                        .iter()
                        .zip(other.split('/'))
                        .take_while(|(a, b)| **a == *b)
                        .count();
                    common.truncate(shared);
                }
                common.join("/")
            }
        }
    }

    /// The single path this selector names, if it is an exact-path selector.
    pub fn exact_path(&self) -> Option<&str> {
        match &self.kind {
            Kind::Path {
                path,
                qualifier: Qualifier::Path,
            } => Some(path),
            _ => None,
        }
    }

    /// Whether the selector can match paths below the ones it names.
    pub fn includes_descendants(&self) -> bool {
        match &self.kind {
            Kind::Path { qualifier, .. }
            | Kind::SplitPattern { qualifier, .. }
            | Kind::FullPattern { qualifier, .. } => *qualifier != Qualifier::Path,
            Kind::Set(members) => members.iter().any(TopicSelector::includes_descendants),
        }
    }
}
