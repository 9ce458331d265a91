//! User-facing index handles.

use crate::error::CoreResult;
use crate::keyrange::KeyRange;
use crate::store::{Layer, StoreInner, StoreState, TxId};
use jungledb_codec::Value;
use parking_lot::MutexGuard;
use std::collections::BTreeSet;
use std::sync::Arc;

/// A named index scoped to one reader's view.
///
/// Obtained from an object store (the committed view), a transaction or
/// a snapshot; queries answered through the handle reflect that reader's
/// effective state.
pub struct IndexHandle {
    store: Arc<StoreInner>,
    /// `None` reads at the store's committed head.
    base: Option<TxId>,
    name: String,
}

impl IndexHandle {
    pub(crate) fn new(store: Arc<StoreInner>, base: Option<TxId>, name: String) -> Self {
        Self { store, base, name }
    }

    /// The index name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn locked(&self) -> CoreResult<(MutexGuard<'_, StoreState>, Layer)> {
        let state = self.store.state.lock();
        let layer = match self.base {
            None => {
                self.store.ensure_connected(&state)?;
                state.head
            }
            Some(id) => {
                self.store.ensure_readable(&state, id)?;
                Layer::Tx(id)
            }
        };
        Ok((state, layer))
    }

    /// Primary keys of records whose secondary key falls in `range`.
    pub fn keys(
        &self,
        range: Option<&KeyRange<Value>>,
        limit: Option<usize>,
    ) -> CoreResult<BTreeSet<String>> {
        let (state, layer) = self.locked()?;
        self.store
            .index_view(&state, layer, &self.name)?
            .keys(range, limit)
    }

    /// Records whose secondary key falls in `range`, in primary-key
    /// order.
    pub fn values(
        &self,
        range: Option<&KeyRange<Value>>,
        limit: Option<usize>,
    ) -> CoreResult<Vec<Value>> {
        let (state, layer) = self.locked()?;
        let keys = self
            .store
            .index_view(&state, layer, &self.name)?
            .keys(range, limit)?;
        let view = self.store.view(&state, layer);
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = view.get(&key)? {
                values.push(value);
            }
        }
        Ok(values)
    }

    /// Number of records whose secondary key falls in `range`.
    pub fn count(&self, range: Option<&KeyRange<Value>>) -> CoreResult<usize> {
        let (state, layer) = self.locked()?;
        self.store.index_view(&state, layer, &self.name)?.count(range)
    }

    /// Primary keys sharing the least secondary key inside `range`, in
    /// primary-key order.
    pub fn min_keys(&self, range: Option<&KeyRange<Value>>) -> CoreResult<BTreeSet<String>> {
        let (state, layer) = self.locked()?;
        self.store
            .index_view(&state, layer, &self.name)?
            .min_keys(range)
    }

    /// Primary keys sharing the greatest secondary key inside `range`,
    /// in primary-key order.
    pub fn max_keys(&self, range: Option<&KeyRange<Value>>) -> CoreResult<BTreeSet<String>> {
        let (state, layer) = self.locked()?;
        self.store
            .index_view(&state, layer, &self.name)?
            .max_keys(range)
    }

    /// Records sharing the least secondary key inside `range`, in
    /// primary-key order.
    pub fn min_values(&self, range: Option<&KeyRange<Value>>) -> CoreResult<Vec<Value>> {
        let (state, layer) = self.locked()?;
        let keys = self
            .store
            .index_view(&state, layer, &self.name)?
            .min_keys(range)?;
        self.resolve(&state, layer, keys)
    }

    /// Records sharing the greatest secondary key inside `range`, in
    /// primary-key order.
    pub fn max_values(&self, range: Option<&KeyRange<Value>>) -> CoreResult<Vec<Value>> {
        let (state, layer) = self.locked()?;
        let keys = self
            .store
            .index_view(&state, layer, &self.name)?
            .max_keys(range)?;
        self.resolve(&state, layer, keys)
    }

    /// Streams `(secondary key, primary key)` pairs in the given
    /// direction; iteration stops when the callback returns `false`.
    pub fn key_stream(
        &self,
        mut callback: impl FnMut(&Value, &str) -> bool,
        ascending: bool,
        range: Option<&KeyRange<Value>>,
    ) -> CoreResult<()> {
        let (state, layer) = self.locked()?;
        self.store
            .index_view(&state, layer, &self.name)?
            .stream(range, ascending, &mut callback)
    }

    /// Streams records in secondary-key order; iteration stops when the
    /// callback returns `false`.
    pub fn value_stream(
        &self,
        mut callback: impl FnMut(&Value, &str) -> bool,
        ascending: bool,
        range: Option<&KeyRange<Value>>,
    ) -> CoreResult<()> {
        let (state, layer) = self.locked()?;
        let index_view = self.store.index_view(&state, layer, &self.name)?;
        let view = self.store.view(&state, layer);
        let mut failure = None;
        index_view.stream(range, ascending, &mut |_, primary| {
            match view.get(primary) {
                Ok(Some(value)) => callback(&value, primary),
                Ok(None) => true,
                Err(err) => {
                    failure = Some(err);
                    false
                }
            }
        })?;
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn resolve(
        &self,
        state: &StoreState,
        layer: Layer,
        keys: BTreeSet<String>,
    ) -> CoreResult<Vec<Value>> {
        let view = self.store.view(state, layer);
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = view.get(&key)? {
                values.push(value);
            }
        }
        Ok(values)
    }
}

impl std::fmt::Debug for IndexHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexHandle")
            .field("store", &self.store.name)
            .field("name", &self.name)
            .finish()
    }
}
