//! In-memory secondary index.

use crate::error::{CoreError, CoreResult};
use crate::index::IndexDescriptor;
use crate::keyrange::{bounds_of, KeyRange};
use crate::tree::BTree;
use jungledb_codec::Value;
use std::collections::BTreeSet;
use std::ops::Bound;

/// An ordered in-memory index from secondary key to primary-key bucket.
///
/// Buckets are ordered sets of primary keys, so ties on a secondary key
/// always come out in primary-key order. A unique index keeps every
/// bucket at size one and fails a [`put`](Self::put) that would grow one.
#[derive(Debug)]
pub struct InMemoryIndex {
    descriptor: IndexDescriptor,
    tree: BTree<Value, BTreeSet<String>>,
}

impl InMemoryIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new(descriptor: IndexDescriptor) -> Self {
        Self {
            descriptor,
            tree: BTree::new(),
        }
    }

    /// The descriptor this index was created from.
    #[must_use]
    pub fn descriptor(&self) -> &IndexDescriptor {
        &self.descriptor
    }

    /// Records `primary` under the secondary keys of `new_value`,
    /// unrecording the keys of `old_value` first.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::UniquenessViolation`] when a unique index
    /// already maps one of the new secondary keys to a different primary
    /// key; the index is left unchanged in that case.
    pub fn put(
        &mut self,
        primary: &str,
        new_value: &Value,
        old_value: Option<&Value>,
    ) -> CoreResult<()> {
        let path = &self.descriptor.key_path;
        let new_keys = path.index_keys(new_value, self.descriptor.multi_entry);

        if self.descriptor.unique {
            for secondary in &new_keys {
                if let Some(bucket) = self.tree.get(secondary) {
                    if let Some(existing) = bucket.iter().find(|pk| pk.as_str() != primary) {
                        return Err(CoreError::uniqueness_violation(
                            &self.descriptor.name,
                            secondary.clone(),
                            existing.clone(),
                        ));
                    }
                }
            }
        }

        if let Some(old) = old_value {
            self.unrecord(primary, old);
        }
        for secondary in new_keys {
            match self.tree.get_mut(&secondary) {
                Some(bucket) => {
                    bucket.insert(primary.to_string());
                }
                None => {
                    let mut bucket = BTreeSet::new();
                    bucket.insert(primary.to_string());
                    self.tree.insert(secondary, bucket);
                }
            }
        }
        Ok(())
    }

    /// Unrecords `primary` under the secondary keys of `old_value`.
    pub fn remove(&mut self, primary: &str, old_value: &Value) {
        self.unrecord(primary, old_value);
    }

    /// Drops every entry.
    pub fn truncate(&mut self) {
        self.tree.clear();
    }

    /// Number of distinct secondary keys.
    #[must_use]
    pub fn secondary_key_count(&self) -> usize {
        self.tree.len()
    }

    /// Primary keys of all records whose secondary key falls in `range`,
    /// visited by secondary key first and primary key second; collection
    /// stops once `limit` distinct primary keys were gathered.
    #[must_use]
    pub fn keys(&self, range: Option<&KeyRange<Value>>, limit: Option<usize>) -> BTreeSet<String> {
        let mut result = BTreeSet::new();
        let (lower, upper) = bounds_of(range);
        for (_, bucket) in self.tree.range_iter(lower, upper, true) {
            for primary in bucket {
                if limit.is_some_and(|limit| result.len() >= limit) {
                    return result;
                }
                result.insert(primary.clone());
            }
        }
        result
    }

    /// Number of records whose secondary key falls in `range`.
    #[must_use]
    pub fn count(&self, range: Option<&KeyRange<Value>>) -> usize {
        self.keys(range, None).len()
    }

    /// Primary keys sharing the least secondary key inside `range`.
    #[must_use]
    pub fn min_keys(&self, range: Option<&KeyRange<Value>>) -> BTreeSet<String> {
        self.edge_keys(range, true)
    }

    /// Primary keys sharing the greatest secondary key inside `range`.
    #[must_use]
    pub fn max_keys(&self, range: Option<&KeyRange<Value>>) -> BTreeSet<String> {
        self.edge_keys(range, false)
    }

    /// Iterates `(secondary, primary)` pairs inside `range` in the given
    /// direction.
    pub fn pairs<'a>(
        &'a self,
        range: Option<&'a KeyRange<Value>>,
        ascending: bool,
    ) -> impl Iterator<Item = (&'a Value, &'a String)> + 'a {
        let (lower, upper) = bounds_of(range);
        self.tree
            .range_iter(lower, upper, ascending)
            .flat_map(move |(secondary, bucket)| {
                let primaries: Vec<&String> = if ascending {
                    bucket.iter().collect()
                } else {
                    bucket.iter().rev().collect()
                };
                primaries.into_iter().map(move |pk| (secondary, pk))
            })
    }

    /// The first pair strictly after `last` in the given direction, inside
    /// `range`. Used by re-seek cursors.
    #[must_use]
    pub fn pair_after(
        &self,
        last: Option<&(Value, String)>,
        range: Option<&KeyRange<Value>>,
        ascending: bool,
    ) -> Option<(Value, String)> {
        let (mut lower, mut upper) = bounds_of(range);
        if let Some((secondary, _)) = last {
            if ascending {
                lower = Bound::Included(secondary);
            } else {
                upper = Bound::Included(secondary);
            }
        }
        for (secondary, bucket) in self.tree.range_iter(lower, upper, ascending) {
            if let Some((last_secondary, last_primary)) = last {
                if secondary == last_secondary {
                    let successor = if ascending {
                        bucket
                            .range::<String, _>((
                                Bound::Excluded(last_primary.clone()),
                                Bound::Unbounded,
                            ))
                            .next()
                    } else {
                        bucket
                            .range::<String, _>((
                                Bound::Unbounded,
                                Bound::Excluded(last_primary.clone()),
                            ))
                            .next_back()
                    };
                    match successor {
                        Some(primary) => return Some((secondary.clone(), primary.clone())),
                        None => continue,
                    }
                }
            }
            let primary = if ascending {
                bucket.iter().next()
            } else {
                bucket.iter().next_back()
            };
            if let Some(primary) = primary {
                return Some((secondary.clone(), primary.clone()));
            }
        }
        None
    }

    fn edge_keys(&self, range: Option<&KeyRange<Value>>, ascending: bool) -> BTreeSet<String> {
        let (lower, upper) = bounds_of(range);
        match self.tree.range_iter(lower, upper, ascending).next() {
            Some((_, bucket)) => bucket.iter().cloned().collect(),
            None => BTreeSet::new(),
        }
    }

    fn unrecord(&mut self, primary: &str, old_value: &Value) {
        let old_keys = self
            .descriptor
            .key_path
            .index_keys(old_value, self.descriptor.multi_entry);
        for secondary in old_keys {
            let emptied = match self.tree.get_mut(&secondary) {
                Some(bucket) => {
                    bucket.remove(primary);
                    bucket.is_empty()
                }
                None => false,
            };
            if emptied {
                self.tree.remove(&secondary);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jungledb_codec::KeyPath;

    fn record(n: i64) -> Value {
        Value::map(vec![("val", Value::Integer(n))])
    }

    fn index() -> InMemoryIndex {
        InMemoryIndex::new(IndexDescriptor::new("val_idx", KeyPath::new("val")))
    }

    #[test]
    fn put_and_keys() {
        let mut idx = index();
        idx.put("a", &record(1), None).unwrap();
        idx.put("b", &record(2), None).unwrap();
        idx.put("c", &record(1), None).unwrap();

        let keys = idx.keys(Some(&KeyRange::only(Value::Integer(1))), None);
        assert_eq!(keys.into_iter().collect::<Vec<_>>(), vec!["a", "c"]);
        assert_eq!(idx.count(None), 3);
    }

    #[test]
    fn put_reindexes_on_value_change() {
        let mut idx = index();
        idx.put("a", &record(1), None).unwrap();
        idx.put("a", &record(2), Some(&record(1))).unwrap();

        assert!(idx.keys(Some(&KeyRange::only(Value::Integer(1))), None).is_empty());
        assert!(idx
            .keys(Some(&KeyRange::only(Value::Integer(2))), None)
            .contains("a"));
    }

    #[test]
    fn non_conforming_record_is_skipped() {
        let mut idx = index();
        idx.put("a", &Value::from("no attributes"), None).unwrap();
        assert_eq!(idx.count(None), 0);
    }

    #[test]
    fn remove_drops_entry() {
        let mut idx = index();
        idx.put("a", &record(1), None).unwrap();
        idx.remove("a", &record(1));
        assert_eq!(idx.count(None), 0);
        assert_eq!(idx.secondary_key_count(), 0);
    }

    #[test]
    fn unique_rejects_second_primary() {
        let mut idx = InMemoryIndex::new(
            IndexDescriptor::new("val_idx", KeyPath::new("val")).unique(),
        );
        idx.put("a", &record(1), None).unwrap();
        let err = idx.put("b", &record(1), None).unwrap_err();
        assert!(matches!(err, CoreError::UniquenessViolation { .. }));
        // The index is unchanged.
        assert_eq!(idx.keys(None, None).into_iter().collect::<Vec<_>>(), vec!["a"]);
    }

    #[test]
    fn unique_allows_same_primary_again() {
        let mut idx = InMemoryIndex::new(
            IndexDescriptor::new("val_idx", KeyPath::new("val")).unique(),
        );
        idx.put("a", &record(1), None).unwrap();
        idx.put("a", &record(1), Some(&record(1))).unwrap();
        assert_eq!(idx.count(None), 1);
    }

    #[test]
    fn multi_entry_indexes_each_element() {
        let mut idx = InMemoryIndex::new(
            IndexDescriptor::new("tags", KeyPath::new("tags")).multi_entry(),
        );
        let record = Value::map(vec![(
            "tags",
            Value::Array(vec![Value::from("x"), Value::from("y")]),
        )]);
        idx.put("a", &record, None).unwrap();

        assert!(idx.keys(Some(&KeyRange::only(Value::from("x"))), None).contains("a"));
        assert!(idx.keys(Some(&KeyRange::only(Value::from("y"))), None).contains("a"));
        assert_eq!(idx.secondary_key_count(), 2);

        idx.remove("a", &record);
        assert_eq!(idx.secondary_key_count(), 0);
    }

    #[test]
    fn min_max_keys_share_edge_secondary() {
        let mut idx = index();
        idx.put("b", &record(1), None).unwrap();
        idx.put("a", &record(1), None).unwrap();
        idx.put("z", &record(9), None).unwrap();

        let min = idx.min_keys(None);
        assert_eq!(min.into_iter().collect::<Vec<_>>(), vec!["a", "b"]);
        let max = idx.max_keys(None);
        assert_eq!(max.into_iter().collect::<Vec<_>>(), vec!["z"]);
    }

    #[test]
    fn pairs_order_secondary_then_primary() {
        let mut idx = index();
        idx.put("b", &record(1), None).unwrap();
        idx.put("a", &record(2), None).unwrap();
        idx.put("c", &record(1), None).unwrap();

        let ascending: Vec<(Value, String)> = idx
            .pairs(None, true)
            .map(|(s, p)| (s.clone(), p.clone()))
            .collect();
        assert_eq!(
            ascending,
            vec![
                (Value::Integer(1), "b".to_string()),
                (Value::Integer(1), "c".to_string()),
                (Value::Integer(2), "a".to_string()),
            ]
        );

        let descending: Vec<String> = idx.pairs(None, false).map(|(_, p)| p.clone()).collect();
        assert_eq!(descending, vec!["a", "c", "b"]);
    }

    #[test]
    fn pair_after_walks_pairs() {
        let mut idx = index();
        idx.put("b", &record(1), None).unwrap();
        idx.put("c", &record(1), None).unwrap();
        idx.put("a", &record(2), None).unwrap();

        let mut last = None;
        let mut seen = Vec::new();
        while let Some(pair) = idx.pair_after(last.as_ref(), None, true) {
            seen.push(pair.1.clone());
            last = Some(pair);
        }
        assert_eq!(seen, vec!["b", "c", "a"]);

        let mut last = None;
        let mut seen = Vec::new();
        while let Some(pair) = idx.pair_after(last.as_ref(), None, false) {
            seen.push(pair.1.clone());
            last = Some(pair);
        }
        assert_eq!(seen, vec!["a", "c", "b"]);
    }

    #[test]
    fn truncate_clears() {
        let mut idx = index();
        idx.put("a", &record(1), None).unwrap();
        idx.truncate();
        assert_eq!(idx.count(None), 0);
    }

    #[test]
    fn keys_respects_limit() {
        let mut idx = index();
        for (pk, v) in [("a", 1), ("b", 1), ("c", 2)] {
            idx.put(pk, &record(v), None).unwrap();
        }
        let keys = idx.keys(None, Some(2));
        assert_eq!(keys.len(), 2);
        assert!(keys.contains("a") && keys.contains("b"));
    }
}
