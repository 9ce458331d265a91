//! Layered index views.
//!
//! A transaction answers index queries by merging the enclosing parent
//! chain's index state with its own deltas: per layer, an
//! [`InMemoryIndex`] over the layer's modified records plus the layer's
//! stale primary keys (removed or overwritten below). Nothing is
//! materialized beyond the query's own result set; streams merge lazily.
//!
//! Truncation is structural: a truncating layer becomes the view's floor
//! at construction time, so the merge itself never sees a truncate flag.

use crate::error::CoreResult;
use crate::index::{IndexCursor, IndexReader, InMemoryIndex};
use crate::keyrange::KeyRange;
use crate::tree::BTree;
use jungledb_codec::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

/// One transaction layer's contribution to an index view.
pub(crate) struct IndexLayer<'a> {
    /// Index over the layer's modified records.
    pub(crate) delta: &'a InMemoryIndex,
    /// Primary keys removed in the layer.
    pub(crate) removed: &'a BTreeSet<String>,
    /// The layer's modified primary tree; a modified key shadows every
    /// older contribution of the same primary key.
    pub(crate) modified: &'a BTree<String, Value>,
}

impl IndexLayer<'_> {
    fn shadows(&self, primary: &str) -> bool {
        self.removed.contains(primary) || self.modified.contains_key(primary)
    }
}

/// A read-only merge of delta layers over a base index.
///
/// Layers are ordered newest first. `base` is `None` when a truncating
/// layer cut the chain or the store has no backend index.
pub(crate) struct IndexView<'a> {
    pub(crate) layers: Vec<IndexLayer<'a>>,
    pub(crate) base: Option<Arc<dyn IndexReader>>,
}

impl<'a> IndexView<'a> {
    /// Whether any layer newer than `rank` shadows `primary`.
    fn shadowed_above(&self, rank: usize, primary: &str) -> bool {
        self.layers[..rank.min(self.layers.len())]
            .iter()
            .any(|layer| layer.shadows(primary))
    }

    /// Primary keys of records whose secondary key falls in `range`.
    pub(crate) fn keys(
        &self,
        range: Option<&KeyRange<Value>>,
        limit: Option<usize>,
    ) -> CoreResult<BTreeSet<String>> {
        if let Some(limit) = limit {
            let mut result = BTreeSet::new();
            self.stream(range, true, &mut |_, primary| {
                result.insert(primary.to_string());
                result.len() < limit
            })?;
            return Ok(result);
        }
        let mut result = match &self.base {
            Some(base) => base.keys(range)?,
            None => BTreeSet::new(),
        };
        for layer in self.layers.iter().rev() {
            result.retain(|primary| !layer.shadows(primary));
            result.extend(layer.delta.keys(range, None));
        }
        Ok(result)
    }

    /// Number of records whose secondary key falls in `range`.
    pub(crate) fn count(&self, range: Option<&KeyRange<Value>>) -> CoreResult<usize> {
        Ok(self.keys(range, None)?.len())
    }

    /// Primary keys sharing the least secondary key inside `range`.
    pub(crate) fn min_keys(&self, range: Option<&KeyRange<Value>>) -> CoreResult<BTreeSet<String>> {
        self.edge_keys(range, true)
    }

    /// Primary keys sharing the greatest secondary key inside `range`.
    pub(crate) fn max_keys(&self, range: Option<&KeyRange<Value>>) -> CoreResult<BTreeSet<String>> {
        self.edge_keys(range, false)
    }

    fn edge_keys(
        &self,
        range: Option<&KeyRange<Value>>,
        ascending: bool,
    ) -> CoreResult<BTreeSet<String>> {
        let mut edge: Option<Value> = None;
        let mut result = BTreeSet::new();
        self.stream(range, ascending, &mut |secondary, primary| {
            match &edge {
                None => {
                    edge = Some(secondary.clone());
                    result.insert(primary.to_string());
                    true
                }
                Some(first) if first == secondary => {
                    result.insert(primary.to_string());
                    true
                }
                Some(_) => false,
            }
        })?;
        Ok(result)
    }

    /// Streams `(secondary, primary)` pairs in the given direction;
    /// iteration stops when the callback returns `false`.
    pub(crate) fn stream(
        &self,
        range: Option<&KeyRange<Value>>,
        ascending: bool,
        callback: &mut dyn FnMut(&Value, &str) -> bool,
    ) -> CoreResult<()> {
        let mut sources: Vec<PairSource<'_>> = Vec::with_capacity(self.layers.len() + 1);
        for (rank, layer) in self.layers.iter().enumerate() {
            sources.push(PairSource::from_delta(
                rank,
                layer.delta.pairs(range, ascending),
            ));
        }
        if let Some(base) = &self.base {
            sources.push(PairSource::from_cursor(
                self.layers.len(),
                base.cursor(range, ascending)?,
            ));
        }
        for source in &mut sources {
            source.refill()?;
        }

        loop {
            let mut best: Option<usize> = None;
            for (i, source) in sources.iter().enumerate() {
                let Some(pair) = &source.peek else { continue };
                match best {
                    None => best = Some(i),
                    Some(j) => {
                        let current = sources[j].peek.as_ref().map(|p| (&p.0, &p.1));
                        let candidate = Some((&pair.0, &pair.1));
                        let better = if ascending {
                            candidate < current
                        } else {
                            candidate > current
                        };
                        if better {
                            best = Some(i);
                        }
                    }
                }
            }
            let Some(winner) = best else { return Ok(()) };
            let rank = sources[winner].rank;
            let (secondary, primary) = sources[winner]
                .peek
                .take()
                .unwrap_or_else(|| unreachable!("winner has a peeked pair"));
            sources[winner].refill()?;
            if self.shadowed_above(rank, &primary) {
                continue;
            }
            if !callback(&secondary, &primary) {
                return Ok(());
            }
        }
    }
}

/// A mergeable source of `(secondary, primary)` pairs with one slot of
/// lookahead.
struct PairSource<'a> {
    rank: usize,
    peek: Option<(Value, String)>,
    kind: PairSourceKind<'a>,
}

enum PairSourceKind<'a> {
    Delta(Box<dyn Iterator<Item = (&'a Value, &'a String)> + 'a>),
    Cursor(Box<dyn IndexCursor>),
}

impl<'a> PairSource<'a> {
    fn from_delta(
        rank: usize,
        iter: impl Iterator<Item = (&'a Value, &'a String)> + 'a,
    ) -> Self {
        Self {
            rank,
            peek: None,
            kind: PairSourceKind::Delta(Box::new(iter)),
        }
    }

    fn from_cursor(rank: usize, cursor: Box<dyn IndexCursor>) -> Self {
        Self {
            rank,
            peek: None,
            kind: PairSourceKind::Cursor(cursor),
        }
    }

    fn refill(&mut self) -> CoreResult<()> {
        if self.peek.is_some() {
            return Ok(());
        }
        self.peek = match &mut self.kind {
            PairSourceKind::Delta(iter) => iter.next().map(|(s, p)| (s.clone(), p.clone())),
            PairSourceKind::Cursor(cursor) => cursor.next()?,
        };
        Ok(())
    }
}
