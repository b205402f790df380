//! MongoDB-style queries over JSON documents.
//!
//! A [`Query`] is a filter document plus optional sort, skip and limit.
//! Supported operators: `$eq $ne $gt $gte $lt $lte $in $nin $exists
//! $regex $size $all $elemMatch $not` on fields and `$and $or $nor` at the
//! top level. Field paths use dots (`address.city`).
//!
//! Comparisons only order values of the same JSON kind. A field holding an
//! array matches an operator if any element does (`$ne` and `$nin` require
//! that no element matches).

mod cursor;
mod filter;

pub use cursor::Cursor;

use crate::error::CoreResult;
use filter::{sort_order, Filter};
use serde_json::Value;
use std::cmp::Ordering;
use threaddb_storage::field_at;

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// Smallest first.
    #[default]
    Asc,
    /// Largest first.
    Desc,
}

/// A compiled query.
///
/// # Example
///
/// ```rust
/// use serde_json::json;
/// use threaddb_core::{Query, SortOrder};
///
/// let query = Query::parse(json!({"age": {"$gt": 5}}))
///     .unwrap()
///     .sort("age", SortOrder::Desc)
///     .limit(2);
/// let docs = vec![json!({"age": 3}), json!({"age": 9}), json!({"age": 7}), json!({"age": 6})];
/// let ages: Vec<_> = query.run(docs).into_iter().map(|d| d["age"].clone()).collect();
/// assert_eq!(ages, vec![json!(9), json!(7)]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Query {
    filter: Filter,
    sort: Vec<(String, SortOrder)>,
    skip: usize,
    limit: Option<usize>,
}

impl Query {
    /// A query matching every document.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Compiles a filter document.
    ///
    /// # Errors
    ///
    /// [`crate::CoreError::Query`] for a non-object filter, an unknown
    /// operator, a malformed operand or an invalid regular expression.
    pub fn parse(filter: Value) -> CoreResult<Self> {
        Ok(Self {
            filter: Filter::compile(&filter)?,
            ..Self::default()
        })
    }

    /// Adds a sort key. Earlier keys take precedence.
    #[must_use]
    pub fn sort(mut self, path: impl Into<String>, order: SortOrder) -> Self {
        self.sort.push((path.into(), order));
        self
    }

    /// Skips the first `n` matches.
    #[must_use]
    pub const fn skip(mut self, n: usize) -> Self {
        self.skip = n;
        self
    }

    /// Yields at most `n` matches.
    #[must_use]
    pub const fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// Returns true if `doc` passes the filter. Sort, skip and limit do not
    /// apply.
    #[must_use]
    pub fn matches(&self, doc: &Value) -> bool {
        self.filter.matches(doc)
    }

    /// Filters, sorts and pages `docs`.
    pub fn run<I>(&self, docs: I) -> Vec<Value>
    where
        I: IntoIterator<Item = Value>,
    {
        let matched = docs.into_iter().filter(|doc| self.matches(doc));
        if self.sort.is_empty() {
            return self.page(matched).collect();
        }
        let mut matched: Vec<Value> = matched.collect();
        self.sort_docs(&mut matched);
        self.page(matched.into_iter()).collect()
    }

    fn page<'a, I>(&self, docs: I) -> impl Iterator<Item = I::Item> + 'a
    where
        I: Iterator + 'a,
    {
        docs.skip(self.skip).take(self.limit.unwrap_or(usize::MAX))
    }

    fn sort_docs(&self, docs: &mut [Value]) {
        docs.sort_by(|a, b| {
            self.sort
                .iter()
                .map(|(path, order)| {
                    let ordering = sort_order(field_at(a, path), field_at(b, path));
                    match order {
                        SortOrder::Asc => ordering,
                        SortOrder::Desc => ordering.reverse(),
                    }
                })
                .find(|o| *o != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        });
    }
}
