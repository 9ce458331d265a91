//! Secondary-index queries and read selectors.

use crate::keyrange::KeyRange;
use jungledb_codec::Value;

/// A query against a named secondary index.
///
/// Resolving a query whose index name is unknown is a fatal error
/// ([`crate::CoreError::UnknownIndex`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    index: String,
    range: KeyRange<Value>,
}

impl Query {
    /// All records whose secondary key equals `value`.
    pub fn eq(index: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            index: index.into(),
            range: KeyRange::only(value.into()),
        }
    }

    /// All records whose secondary key lies in `[lower, upper]`.
    pub fn within(
        index: impl Into<String>,
        lower: impl Into<Value>,
        upper: impl Into<Value>,
    ) -> Self {
        Self {
            index: index.into(),
            range: KeyRange::bound(lower.into(), upper.into(), false, false),
        }
    }

    /// All records whose secondary key lies in the given range with
    /// per-side openness.
    pub fn range(
        index: impl Into<String>,
        lower: impl Into<Value>,
        upper: impl Into<Value>,
        lower_open: bool,
        upper_open: bool,
    ) -> Self {
        Self {
            index: index.into(),
            range: KeyRange::bound(lower.into(), upper.into(), lower_open, upper_open),
        }
    }

    /// The index this query targets.
    #[must_use]
    pub fn index(&self) -> &str {
        &self.index
    }

    /// The secondary-key range of this query.
    #[must_use]
    pub fn key_range(&self) -> &KeyRange<Value> {
        &self.range
    }
}

/// What a primary read method selects: a primary-key range or a
/// secondary-index query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// A range over primary keys.
    Range(KeyRange<String>),
    /// A query against a secondary index.
    Query(Query),
}

impl From<KeyRange<String>> for Selector {
    fn from(range: KeyRange<String>) -> Self {
        Selector::Range(range)
    }
}

impl From<Query> for Selector {
    fn from(query: Query) -> Self {
        Selector::Query(query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eq_is_a_point_range() {
        let query = Query::eq("age", 30);
        assert_eq!(query.index(), "age");
        assert!(query.key_range().includes(&Value::Integer(30)));
        assert!(!query.key_range().includes(&Value::Integer(31)));
    }

    #[test]
    fn within_is_closed() {
        let query = Query::within("age", 18, 65);
        assert!(query.key_range().includes(&Value::Integer(18)));
        assert!(query.key_range().includes(&Value::Integer(65)));
        assert!(!query.key_range().includes(&Value::Integer(17)));
    }

    #[test]
    fn range_mirrors_openness() {
        let query = Query::range("age", 18, 65, true, true);
        assert!(!query.key_range().includes(&Value::Integer(18)));
        assert!(!query.key_range().includes(&Value::Integer(65)));
        assert!(query.key_range().includes(&Value::Integer(40)));
    }
}
