//! Topic views.
//!
//! A view maps every topic its source selector matches to a reference topic
//! at a path built from a template:
//!
//! ```text
//! map ?Accounts/Premium// to Premium-Accounts-Only/<path(2)>
//! ```
//!
//! `<path(N)>` stands for the source path from segment `N` on. Reference
//! topics copy their source's specification and value, come and go with the
//! source, and cannot be added over, updated or removed by sessions.

use crate::error::{EngineError, Result};
use crate::selectors::TopicSelector;
use crate::types::{validate_path, TopicSpecification};
use crate::values::TopicValue;
use parking_lot::RwLock;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// A view as registered: its name and the expression it was created from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicView {
    pub name: String,
    pub specification: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Part {
    Literal(String),
    PathFrom(usize),
}

/// Target path template of a view.
#[derive(Clone, Debug)]
pub(crate) struct PathTemplate {
    parts: Vec<Part>,
}

fn invalid(expression: &str, reason: impl Into<String>) -> EngineError {
    EngineError::InvalidTopicView {
        expression: expression.to_string(),
        reason: reason.into(),
    }
}

impl PathTemplate {
    fn parse(expression: &str, template: &str) -> Result<Self> {
        let directive = Regex::new(r"<([^<>]*)>").map_err(|e| invalid(expression, e.to_string()))?;
        let path_from = Regex::new(r"^path\((\d+)\)$").map_err(|e| invalid(expression, e.to_string()))?;
        let mut parts = Vec::new();
        let mut last = 0;
        for found in directive.captures_iter(template) {
            let (Some(whole), Some(inner)) = (found.get(0), found.get(1)) else {
                continue;
            };
            if whole.start() > last {
                parts.push(Part::Literal(template[last..whole.start()].to_string()));
            }
            let index = path_from
                .captures(inner.as_str())
                .and_then(|c| c.get(1))
                .and_then(|n| n.as_str().parse::<usize>().ok())
                .ok_or_else(|| invalid(expression, format!("unknown directive <{}>", inner.as_str())))?;
            parts.push(Part::PathFrom(index));
            last = whole.end();
        }
        if last < template.len() {
            parts.push(Part::Literal(template[last..].to_string()));
        }
        if parts.iter().any(|p| matches!(p, Part::Literal(l) if l.contains(['<', '>']))) {
            return Err(invalid(expression, "unbalanced directive"));
        }
        Ok(Self { parts })
    }

    /// The reference path for `source`, if the template applies to it.
    pub(crate) fn expand(&self, source: &str) -> Option<String> {
        let segments: Vec<&str> = source.split('/').collect();
        let mut path = String::new();
        for part in &self.parts {
            match part {
                Part::Literal(text) => path.push_str(text),
                Part::PathFrom(index) if *index < segments.len() => {
                    path.push_str(&segments[*index..].join("/"))
                }
                Part::PathFrom(_) => return None,
            }
        }
        validate_path(&path).then_some(path)
    }

    /// The literal text before the first directive, as a path.
    pub(crate) fn literal_prefix(&self) -> String {
        match self.parts.first() {
            Some(Part::Literal(text)) => text.trim_end_matches('/').to_string(),
            _ => String::new(),
        }
    }
}

/// A parsed view.
#[derive(Debug)]
pub(crate) struct ViewDefinition {
    pub(crate) name: String,
    pub(crate) expression: String,
    pub(crate) source: TopicSelector,
    pub(crate) target: PathTemplate,
}

impl ViewDefinition {
    pub(crate) fn parse(name: &str, expression: &str) -> Result<Self> {
        if name.is_empty() {
            return Err(invalid(expression, "view name is empty"));
        }
        let tokens: Vec<&str> = expression.split_whitespace().collect();
        let [map, source, to, target] = tokens.as_slice() else {
            return Err(invalid(expression, "expected 'map <selector> to <path>'"));
        };
        if !map.eq_ignore_ascii_case("map") || !to.eq_ignore_ascii_case("to") {
            return Err(invalid(expression, "expected 'map <selector> to <path>'"));
        }
        let source = TopicSelector::compile(source).map_err(|e| invalid(expression, e.to_string()))?;
        let target = PathTemplate::parse(expression, target)?;
        Ok(Self {
            name: name.to_string(),
            expression: expression.to_string(),
            source,
            target,
        })
    }

    fn describe(&self) -> TopicView {
        TopicView {
            name: self.name.clone(),
            specification: self.expression.clone(),
        }
    }
}

/// The specification of a reference topic mirroring `source`. Its lifetime
/// follows the source, so removal policies are not copied.
pub(crate) fn reference_specification(source: &TopicSpecification) -> TopicSpecification {
    let mut specification = source.clone();
    specification.properties.remove(TopicSpecification::REMOVAL);
    specification
}

/// The value a reference topic takes from its source's value. Time series
/// events are re-appended by value.
pub(crate) fn mirrored(value: TopicValue) -> TopicValue {
    match value {
        TopicValue::Event(event) => event.value,
        other => other,
    }
}

#[derive(Clone, Debug)]
struct Reference {
    view: String,
    source: String,
}

#[derive(Default)]
struct ViewTable {
    views: BTreeMap<String, Arc<ViewDefinition>>,
    /// Reference path to the view and source path it mirrors.
    references: BTreeMap<String, Reference>,
}

impl ViewTable {
    fn take_references(&mut self, view: &str) -> Vec<String> {
        let paths: Vec<String> = self
            .references
            .iter()
            .filter(|(_, r)| r.view == view)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &paths {
            self.references.remove(path);
        }
        paths
    }
}

/// Registered views and the reference topics they maintain.
#[derive(Default)]
pub(crate) struct TopicViews {
    table: RwLock<ViewTable>,
}

impl TopicViews {
    /// Register `view`, replacing a view of the same name. Returns the
    /// reference paths of the replaced view, which the caller removes.
    pub(crate) fn define(&self, view: Arc<ViewDefinition>) -> Vec<String> {
        let mut table = self.table.write();
        let replaced = table.take_references(&view.name);
        debug!(view = %view.name, expression = %view.expression, replaced = replaced.len(), "topic view defined");
        table.views.insert(view.name.clone(), view);
        replaced
    }

    /// Unregister a view, returning its reference paths.
    pub(crate) fn remove(&self, name: &str) -> Option<Vec<String>> {
        let mut table = self.table.write();
        table.views.remove(name)?;
        Some(table.take_references(name))
    }

    pub(crate) fn get(&self, name: &str) -> Option<TopicView> {
        self.table.read().views.get(name).map(|v| v.describe())
    }

    pub(crate) fn list(&self) -> Vec<TopicView> {
        self.table.read().views.values().map(|v| v.describe()).collect()
    }

    /// Views whose source selector matches `path`.
    pub(crate) fn selecting(&self, path: &str) -> Vec<Arc<ViewDefinition>> {
        self.table
            .read()
            .views
            .values()
            .filter(|v| v.source.matches(path))
            .cloned()
            .collect()
    }

    /// The view maintaining the reference topic at `path`.
    pub(crate) fn maintainer(&self, path: &str) -> Option<String> {
        self.table.read().references.get(path).map(|r| r.view.clone())
    }

    pub(crate) fn is_reference(&self, path: &str) -> bool {
        self.table.read().references.contains_key(path)
    }

    /// Record `target` as `view`'s reference for `source`. False if the
    /// view is gone or another reference already owns the path.
    pub(crate) fn claim(&self, target: &str, view: &str, source: &str) -> bool {
        let mut table = self.table.write();
        if !table.views.contains_key(view) || table.references.contains_key(target) {
            return false;
        }
        table.references.insert(
            target.to_string(),
            Reference {
                view: view.to_string(),
                source: source.to_string(),
            },
        );
        true
    }

    pub(crate) fn forget(&self, target: &str) -> bool {
        self.table.write().references.remove(target).is_some()
    }

    /// Reference paths mirroring `source`.
    pub(crate) fn references_of(&self, source: &str) -> Vec<String> {
        self.table
            .read()
            .references
            .iter()
            .filter(|(_, r)| r.source == source)
            .map(|(path, _)| path.clone())
            .collect()
    }
}
