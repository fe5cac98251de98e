//! Topic selectors and range-bounded fetch requests.
//!
//! Selector grammar:
//!
//! - `a/b` or `>a/b` - exactly `a/b`; `>a/b//` adds descendants,
//!   `>a/b/` selects descendants only
//! - `?FX/.*` - split-path pattern, one anchored regex per segment
//! - `*FX/.*USD` - full-path pattern, one anchored regex over the path
//! - `#sel1////sel2` - selector set, matching what any member matches
//!
//! Fetch results are ordered byte-wise by path so that paging with
//! `first(n)` followed by `after(last_path)` is deterministic.

mod fetch;
mod selector;

pub use fetch::{FetchRequest, FetchedTopic, FetchResult};
pub use selector::{Qualifier, TopicSelector};
