//! Long-lived read views.

use crate::error::{CoreError, CoreResult};
use crate::index::IndexHandle;
use crate::keyrange::KeyRange;
use crate::query::Selector;
use crate::store::{Layer, StoreInner, TxId};
use crate::transaction::TransactionState;
use jungledb_codec::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

/// A read-only view pinned to a committed state.
///
/// A snapshot taken from an object store holds a reference on the
/// committed chain and must be released - via [`abort`](Self::abort) or
/// by dropping it - to let older versions flush. A snapshot taken from a
/// transaction is detached (materialized) and pins nothing.
pub struct Snapshot {
    store: Arc<StoreInner>,
    id: TxId,
}

impl Snapshot {
    pub(crate) fn new(store: Arc<StoreInner>, id: TxId) -> Self {
        Self { store, id }
    }

    /// Releases the snapshot's reference on the committed chain.
    pub fn abort(&self) -> CoreResult<()> {
        let deps = {
            let mut state = self.store.state.lock();
            let entry = state
                .txns
                .get(&self.id)
                .ok_or_else(|| CoreError::invalid_operation("snapshot no longer exists"))?;
            if entry.state != TransactionState::Open {
                return Err(CoreError::invalid_operation("snapshot already released"));
            }
            self.store
                .close_locked(&mut state, self.id, TransactionState::Aborted)
        };
        for dep in deps {
            dep.try_flush()?;
        }
        Ok(())
    }

    fn read_checked(&self) -> CoreResult<parking_lot::MutexGuard<'_, crate::store::StoreState>> {
        let state = self.store.state.lock();
        let entry = state
            .txns
            .get(&self.id)
            .ok_or_else(|| CoreError::invalid_operation("snapshot no longer exists"))?;
        if entry.state != TransactionState::Open {
            return Err(CoreError::invalid_operation("snapshot was released"));
        }
        Ok(state)
    }

    /// Reads the record visible under `key`.
    pub fn get(&self, key: &str) -> CoreResult<Option<Value>> {
        let state = self.read_checked()?;
        self.store.view(&state, Layer::Tx(self.id)).get(key)
    }

    /// Visible primary keys, optionally filtered by a selector.
    pub fn keys(
        &self,
        selector: Option<&Selector>,
        limit: Option<usize>,
    ) -> CoreResult<BTreeSet<String>> {
        let state = self.read_checked()?;
        self.store
            .select_keys(&state, Layer::Tx(self.id), selector, limit)
    }

    /// Visible records, optionally filtered by a selector.
    pub fn values(
        &self,
        selector: Option<&Selector>,
        limit: Option<usize>,
    ) -> CoreResult<Vec<Value>> {
        let state = self.read_checked()?;
        self.store
            .select_values(&state, Layer::Tx(self.id), selector, limit)
    }

    /// Number of visible records, optionally filtered by a selector.
    pub fn count(&self, selector: Option<&Selector>) -> CoreResult<usize> {
        let state = self.read_checked()?;
        self.store.select_count(&state, Layer::Tx(self.id), selector)
    }

    /// The least visible primary key inside `range`.
    pub fn min_key(&self, range: Option<&KeyRange<String>>) -> CoreResult<Option<String>> {
        let state = self.read_checked()?;
        self.store.view(&state, Layer::Tx(self.id)).min_key(range)
    }

    /// The greatest visible primary key inside `range`.
    pub fn max_key(&self, range: Option<&KeyRange<String>>) -> CoreResult<Option<String>> {
        let state = self.read_checked()?;
        self.store.view(&state, Layer::Tx(self.id)).max_key(range)
    }

    /// Streams visible records; stops when the callback returns `false`.
    pub fn value_stream(
        &self,
        mut callback: impl FnMut(&Value, &str) -> bool,
        ascending: bool,
        range: Option<&KeyRange<String>>,
    ) -> CoreResult<()> {
        let state = self.read_checked()?;
        self.store
            .view(&state, Layer::Tx(self.id))
            .stream(range, ascending, &mut |key, value| callback(value, key))
    }

    /// The handle for a named index, scoped to this snapshot's view.
    pub fn index(&self, name: impl Into<String>) -> CoreResult<IndexHandle> {
        let name = name.into();
        let state = self.read_checked()?;
        if !state.indices.iter().any(|d| d.name == name) {
            return Err(CoreError::unknown_index(name));
        }
        Ok(IndexHandle::new(
            Arc::clone(&self.store),
            Some(self.id),
            name,
        ))
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.store.on_handle_drop(self.id);
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("store", &self.store.name)
            .field("id", &self.id)
            .finish()
    }
}
