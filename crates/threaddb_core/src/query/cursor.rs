use super::Query;
use serde_json::Value;
use std::sync::Arc;

/// The result of a find: a snapshot of documents and the query over them.
///
/// Iteration can be restarted; each call to [`Cursor::iter`] begins again
/// at the first match. Unsorted queries are evaluated lazily.
#[derive(Debug, Clone)]
pub struct Cursor {
    docs: Arc<Vec<Value>>,
    query: Query,
}

impl Cursor {
    pub(crate) fn new(docs: Vec<Value>, query: Query) -> Self {
        Self {
            docs: Arc::new(docs),
            query,
        }
    }

    /// Iterates over the matching documents.
    pub fn iter(&self) -> Box<dyn Iterator<Item = Value> + '_> {
        if self.query.sort.is_empty() {
            let matched = self
                .docs
                .iter()
                .filter(|doc| self.query.matches(doc))
                .cloned();
            Box::new(self.query.page(matched))
        } else {
            Box::new(self.query.run(self.docs.iter().cloned()).into_iter())
        }
    }

    /// Collects every match.
    #[must_use]
    pub fn to_vec(&self) -> Vec<Value> {
        self.iter().collect()
    }

    /// The first match.
    #[must_use]
    pub fn first(&self) -> Option<Value> {
        self.iter().next()
    }

    /// Number of matches.
    #[must_use]
    pub fn count(&self) -> usize {
        self.iter().count()
    }
}

impl IntoIterator for Cursor {
    type Item = Value;
    type IntoIter = std::vec::IntoIter<Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.to_vec().into_iter()
    }
}
