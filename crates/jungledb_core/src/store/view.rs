//! Layered primary-key views.
//!
//! A reader's effective state is its chain of delta layers over the
//! backend: newest layer first, each shadowing everything below for the
//! keys it modified or removed. Truncation is resolved at construction -
//! a truncating layer becomes the view's floor - so the merge logic never
//! sees a truncate flag.

use crate::backend::{StoreBackend, StoreCursor};
use crate::error::CoreResult;
use crate::keyrange::{bounds_of, range_includes, KeyRange};
use crate::tree::BTree;
use jungledb_codec::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

/// One transaction layer's primary-key contribution.
pub(crate) struct ValueLayer<'a> {
    pub(crate) modified: &'a BTree<String, Value>,
    pub(crate) removed: &'a BTreeSet<String>,
}

impl ValueLayer<'_> {
    fn shadows(&self, key: &str) -> bool {
        self.removed.contains(key) || self.modified.contains_key(key)
    }
}

/// Read-only merge of delta layers over a backend.
pub(crate) struct StoreView<'a> {
    /// Layers newest first.
    pub(crate) layers: Vec<ValueLayer<'a>>,
    /// `None` when a truncating layer cut the chain or the store is
    /// volatile-and-fresh.
    pub(crate) base: Option<Arc<dyn StoreBackend>>,
}

impl<'a> StoreView<'a> {
    fn shadowed_above(&self, rank: usize, key: &str) -> bool {
        self.layers[..rank.min(self.layers.len())]
            .iter()
            .any(|layer| layer.shadows(key))
    }

    /// Reads the record visible under `key`.
    pub(crate) fn get(&self, key: &str) -> CoreResult<Option<Value>> {
        for layer in &self.layers {
            if let Some(value) = layer.modified.get(key) {
                return Ok(Some(value.clone()));
            }
            if layer.removed.contains(key) {
                return Ok(None);
            }
        }
        match &self.base {
            Some(base) => base.get(key),
            None => Ok(None),
        }
    }

    /// All visible primary keys inside `range`, in key order; at most
    /// `limit` of them when given.
    pub(crate) fn keys(
        &self,
        range: Option<&KeyRange<String>>,
        limit: Option<usize>,
    ) -> CoreResult<BTreeSet<String>> {
        let mut result = match &self.base {
            Some(base) => base.keys(range)?,
            None => BTreeSet::new(),
        };
        for layer in self.layers.iter().rev() {
            result.retain(|key| !layer.shadows(key));
            let (lower, upper) = bounds_of(range);
            result.extend(
                layer
                    .modified
                    .range_iter(lower, upper, true)
                    .map(|(key, _)| key.clone()),
            );
        }
        if let Some(limit) = limit {
            if result.len() > limit {
                result = result.into_iter().take(limit).collect();
            }
        }
        Ok(result)
    }

    /// Number of visible records inside `range`.
    pub(crate) fn count(&self, range: Option<&KeyRange<String>>) -> CoreResult<usize> {
        Ok(self.keys(range, None)?.len())
    }

    /// Values of visible records inside `range`, ascending key order.
    pub(crate) fn values(
        &self,
        range: Option<&KeyRange<String>>,
        limit: Option<usize>,
    ) -> CoreResult<Vec<Value>> {
        let mut result = Vec::new();
        self.stream(range, true, &mut |_, value| {
            result.push(value.clone());
            limit.map_or(true, |limit| result.len() < limit)
        })?;
        Ok(result)
    }

    /// The least visible key inside `range`.
    pub(crate) fn min_key(&self, range: Option<&KeyRange<String>>) -> CoreResult<Option<String>> {
        self.edge(range, true).map(|e| e.map(|(key, _)| key))
    }

    /// The greatest visible key inside `range`.
    pub(crate) fn max_key(&self, range: Option<&KeyRange<String>>) -> CoreResult<Option<String>> {
        self.edge(range, false).map(|e| e.map(|(key, _)| key))
    }

    /// The value stored under the least visible key inside `range`.
    pub(crate) fn min_value(&self, range: Option<&KeyRange<String>>) -> CoreResult<Option<Value>> {
        self.edge(range, true).map(|e| e.map(|(_, value)| value))
    }

    /// The value stored under the greatest visible key inside `range`.
    pub(crate) fn max_value(&self, range: Option<&KeyRange<String>>) -> CoreResult<Option<Value>> {
        self.edge(range, false).map(|e| e.map(|(_, value)| value))
    }

    fn edge(
        &self,
        range: Option<&KeyRange<String>>,
        ascending: bool,
    ) -> CoreResult<Option<(String, Value)>> {
        let mut found = None;
        self.stream(range, ascending, &mut |key, value| {
            found = Some((key.to_string(), value.clone()));
            false
        })?;
        Ok(found)
    }

    /// Streams visible `(key, value)` pairs in the given direction;
    /// iteration stops when the callback returns `false`.
    pub(crate) fn stream(
        &self,
        range: Option<&KeyRange<String>>,
        ascending: bool,
        callback: &mut dyn FnMut(&str, &Value) -> bool,
    ) -> CoreResult<()> {
        let mut sources: Vec<RecordSource<'_>> = Vec::with_capacity(self.layers.len() + 1);
        for (rank, layer) in self.layers.iter().enumerate() {
            let (lower, upper) = bounds_of(range);
            sources.push(RecordSource {
                rank,
                peek: None,
                kind: RecordSourceKind::Delta(Box::new(
                    layer.modified.range_iter(lower, upper, ascending),
                )),
            });
        }
        if let Some(base) = &self.base {
            sources.push(RecordSource {
                rank: self.layers.len(),
                peek: None,
                kind: RecordSourceKind::Cursor(base.cursor(range, ascending)?),
            });
        }
        for source in &mut sources {
            source.refill(range)?;
        }

        loop {
            let mut best: Option<usize> = None;
            for (i, source) in sources.iter().enumerate() {
                let Some((key, _)) = &source.peek else { continue };
                match best {
                    None => best = Some(i),
                    Some(j) => {
                        let current = sources[j].peek.as_ref().map(|(k, _)| k);
                        let better = if ascending {
                            Some(key) < current
                        } else {
                            Some(key) > current
                        };
                        if better {
                            best = Some(i);
                        }
                    }
                }
            }
            let Some(winner) = best else { return Ok(()) };
            let rank = sources[winner].rank;
            let (key, value) = sources[winner]
                .peek
                .take()
                .unwrap_or_else(|| unreachable!("winner has a peeked record"));
            sources[winner].refill(range)?;
            if self.shadowed_above(rank, &key) {
                continue;
            }
            if !callback(&key, &value) {
                return Ok(());
            }
        }
    }
}

struct RecordSource<'a> {
    rank: usize,
    peek: Option<(String, Value)>,
    kind: RecordSourceKind<'a>,
}

enum RecordSourceKind<'a> {
    Delta(Box<dyn Iterator<Item = (&'a String, &'a Value)> + 'a>),
    Cursor(Box<dyn StoreCursor>),
}

impl RecordSource<'_> {
    fn refill(&mut self, range: Option<&KeyRange<String>>) -> CoreResult<()> {
        if self.peek.is_some() {
            return Ok(());
        }
        self.peek = match &mut self.kind {
            RecordSourceKind::Delta(iter) => iter.next().map(|(k, v)| (k.clone(), v.clone())),
            RecordSourceKind::Cursor(cursor) => loop {
                match cursor.next()? {
                    Some((key, value)) => {
                        // Adapters must not leak pairs outside the range.
                        if range_includes(range, &key) {
                            break Some((key, value));
                        }
                    }
                    None => break None,
                }
            },
        };
        Ok(())
    }
}
