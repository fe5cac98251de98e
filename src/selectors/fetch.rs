//! Range-bounded fetch requests.

use crate::types::{path_depth, TopicSpecification, TopicType, TypeFilter};
use crate::values::TopicValue;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Clone, Debug, PartialEq, Eq)]
enum Lower {
    From(String),
    After(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Upper {
    To(String),
    Before(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Limit {
    First(usize),
    Last(usize),
}

/// Options for a fetch. Bounds compare paths byte-wise.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FetchRequest {
    lower: Option<Lower>,
    upper: Option<Upper>,
    limit: Option<Limit>,
    topic_types: TypeFilter,
    with_values: bool,
    with_properties: bool,
    deep_branches: Option<(usize, usize)>,
}

impl FetchRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start at `path`, inclusive.
    pub fn from(mut self, path: impl Into<String>) -> Self {
        self.lower = Some(Lower::From(path.into()));
        self
    }

    /// Start after `path`, exclusive. Used to resume from a cursor.
    pub fn after(mut self, path: impl Into<String>) -> Self {
        self.lower = Some(Lower::After(path.into()));
        self
    }

    /// End at `path`, inclusive.
    pub fn to(mut self, path: impl Into<String>) -> Self {
        self.upper = Some(Upper::To(path.into()));
        self
    }

    /// End before `path`, exclusive.
    pub fn before(mut self, path: impl Into<String>) -> Self {
        self.upper = Some(Upper::Before(path.into()));
        self
    }

    pub fn first(mut self, count: usize) -> Self {
        self.limit = Some(Limit::First(count));
        self
    }

    pub fn last(mut self, count: usize) -> Self {
        self.limit = Some(Limit::Last(count));
        self
    }

    pub fn topic_types(mut self, filter: TypeFilter) -> Self {
        self.topic_types = filter;
        self
    }

    pub fn with_values(mut self) -> Self {
        self.with_values = true;
        self
    }

    pub fn with_properties(mut self) -> Self {
        self.with_properties = true;
        self
    }

    /// Return at most `limit` topics under each branch rooted at `depth`.
    /// Topics at or above `depth` are unaffected.
    pub fn limit_deep_branches(mut self, depth: usize, limit: usize) -> Self {
        self.deep_branches = Some((depth, limit));
        self
    }

    pub fn wants_values(&self) -> bool {
        self.with_values
    }

    pub fn wants_properties(&self) -> bool {
        self.with_properties
    }

    pub fn accepts_type(&self, topic_type: TopicType) -> bool {
        self.topic_types.accepts(topic_type)
    }

    fn in_range(&self, path: &str) -> bool {
        let above = match &self.lower {
            None => true,
            Some(Lower::From(p)) => path >= p.as_str(),
            Some(Lower::After(p)) => path > p.as_str(),
        };
        let below = match &self.upper {
            None => true,
            Some(Upper::To(p)) => path <= p.as_str(),
            Some(Upper::Before(p)) => path < p.as_str(),
        };
        above && below
    }

    /// Select from `items`, which must already be sorted by path and
    /// filtered by selector and type. Returns the page and whether more
    /// topics exist in the range beyond it.
    pub fn select<T>(&self, items: Vec<T>, path_of: impl Fn(&T) -> &str) -> (Vec<T>, bool) {
        let limited: Vec<T> = match self.deep_branches {
            Some((depth, limit)) => {
                let mut per_branch: HashMap<String, usize> = HashMap::new();
                items
                    .into_iter()
                    .filter(|item| {
                        let path = path_of(item);
                        if path_depth(path) <= depth {
                            return true;
                        }
                        let root: Vec<&str> = path.split('/').take(depth).collect();
                        let count = per_branch.entry(root.join("/")).or_insert(0);
                        *count += 1;
                        *count <= limit
                    })
                    .collect()
            }
            None => items,
        };

        let mut ranged: Vec<T> = limited
            .into_iter()
            .filter(|item| self.in_range(path_of(item)))
            .collect();

        match self.limit {
            Some(Limit::First(n)) => {
                let has_more = ranged.len() > n;
                ranged.truncate(n);
                (ranged, has_more)
            }
            Some(Limit::Last(n)) => {
                let skip = ranged.len().saturating_sub(n);
                let has_more = skip > 0;
                ranged.drain(..skip);
                (ranged, has_more)
            }
            None => (ranged, false),
        }
    }
}

/// One topic in a fetch result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FetchedTopic {
    pub path: String,
    pub topic_type: TopicType,
    /// Present when the request asked for properties.
    pub specification: Option<TopicSpecification>,
    /// Present when the request asked for values and the topic has one.
    pub value: Option<TopicValue>,
}

/// The result of a fetch.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchResult {
    pub topics: Vec<FetchedTopic>,
    /// More topics exist beyond this page.
    pub has_more: bool,
}

impl FetchResult {
    pub fn paths(&self) -> Vec<&str> {
        self.topics.iter().map(|t| t.path.as_str()).collect()
    }

    /// Cursor for the next page.
    pub fn last_path(&self) -> Option<&str> {
        self.topics.last().map(|t| t.path.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(items: &[&str]) -> Vec<String> {
        let mut v: Vec<String> = items.iter().map(|s| s.to_string()).collect();
        v.sort();
        v
    }

    fn run(request: &FetchRequest, items: &[&str]) -> (Vec<String>, bool) {
        request.select(paths(items), |p| p.as_str())
    }

    #[test]
    fn test_first_then_after_pages() {
        let all = ["a", "b", "c", "d", "e"];
        let (page1, more1) = run(&FetchRequest::new().first(2), &all);
        assert_eq!(page1, vec!["a", "b"]);
        assert!(more1);
        let (page2, more2) = run(&FetchRequest::new().after("b").first(2), &all);
        assert_eq!(page2, vec!["c", "d"]);
        assert!(more2);
        let (page3, more3) = run(&FetchRequest::new().after("d").first(2), &all);
        assert_eq!(page3, vec!["e"]);
        assert!(!more3);
    }

    #[test]
    fn test_last_and_bounds() {
        let all = ["a", "b", "c", "d", "e"];
        let (page, more) = run(&FetchRequest::new().to("d").last(2), &all);
        assert_eq!(page, vec!["c", "d"]);
        assert!(more);
        let (page, _) = run(&FetchRequest::new().from("b").before("d"), &all);
        assert_eq!(page, vec!["b", "c"]);
    }

    #[test]
    fn test_bytewise_order() {
        let (page, _) = run(&FetchRequest::new(), &["a/b", "a", "B", "a-b"]);
        assert_eq!(page, vec!["B", "a", "a-b", "a/b"]);
    }

    #[test]
    fn test_limit_deep_branches() {
        let all = [
            "x",
            "x/1",
            "x/1/a",
            "x/1/b",
            "x/1/c",
            "x/2/a",
            "x/2/b",
            "x/2/c/d",
        ];
        let (page, _) = run(&FetchRequest::new().limit_deep_branches(2, 2), &all);
        assert_eq!(page, vec!["x", "x/1", "x/1/a", "x/1/b", "x/2/a", "x/2/b"]);
    }
}
