//! Transactions.
//!
//! A [`Transaction`] is a snapshot-isolated, optimistic mutation layer
//! over its parent: the store's committed head at creation time, or
//! another open transaction for nested children. Reads overlay the
//! transaction's own buffer on the parent chain; writes never leave the
//! buffer until commit.

pub(crate) mod combined;
mod snapshot;

pub use snapshot::Snapshot;

use crate::error::{CoreError, CoreResult};
use crate::index::IndexHandle;
use crate::keyrange::KeyRange;
use crate::query::Selector;
use crate::store::{EntryKind, Layer, StoreInner, TxId};
use jungledb_codec::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Accepting reads and writes.
    Open,
    /// Suspended while a nested child is open.
    Nested,
    /// Committed; its deltas await the flush into the backend.
    Committed,
    /// Discarded, by request or after a uniqueness violation.
    Aborted,
    /// Lost the optimistic race against a sibling commit.
    Conflicted,
    /// Absorbed by the backend.
    Flushed,
}

/// A snapshot-isolated transaction on an object store.
///
/// Dropping a still-open transaction aborts it.
pub struct Transaction {
    pub(crate) store: Arc<StoreInner>,
    pub(crate) id: TxId,
}

impl Transaction {
    pub(crate) fn new(store: Arc<StoreInner>, id: TxId) -> Self {
        Self { store, id }
    }

    /// The transaction's current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        let state = self.store.state.lock();
        state
            .txns
            .get(&self.id)
            .map(|entry| entry.state)
            .unwrap_or(TransactionState::Aborted)
    }

    /// Reads the record visible under `key`.
    pub fn get(&self, key: &str) -> CoreResult<Option<Value>> {
        let state = self.store.state.lock();
        self.store.ensure_readable(&state, self.id)?;
        self.store.view(&state, Layer::Tx(self.id)).get(key)
    }

    /// Buffers a write.
    ///
    /// A violation of a unique index that is detectable inside this
    /// transaction's own buffer aborts the transaction immediately;
    /// violations against the parent chain surface at commit.
    pub fn put(&self, key: &str, value: Value) -> CoreResult<()> {
        let mut state = self.store.state.lock();
        self.store.put_locked(&mut state, self.id, key, value)
    }

    /// Buffers a removal.
    pub fn remove(&self, key: &str) -> CoreResult<()> {
        let mut state = self.store.state.lock();
        self.store.remove_locked(&mut state, self.id, key)
    }

    /// Buffers a truncation: the transaction's view becomes empty.
    pub fn truncate(&self) -> CoreResult<()> {
        let mut state = self.store.state.lock();
        self.store.truncate_locked(&mut state, self.id)
    }

    /// Commits the transaction.
    ///
    /// Returns `Ok(false)` - and transitions to `Conflicted` - when a
    /// sibling already committed against the same parent. A uniqueness
    /// violation discovered during commit preprocessing aborts the
    /// transaction and surfaces as an error.
    pub fn commit(&self) -> CoreResult<bool> {
        let (committed, deps) = {
            let mut state = self.store.state.lock();
            self.store.commit_locked(&mut state, self.id)?
        };
        for dep in deps {
            dep.try_flush()?;
        }
        Ok(committed)
    }

    /// Discards the transaction's buffered changes.
    pub fn abort(&self) -> CoreResult<()> {
        let deps = {
            let mut state = self.store.state.lock();
            let entry = state
                .txns
                .get(&self.id)
                .ok_or_else(|| CoreError::invalid_operation("transaction no longer exists"))?;
            match entry.state {
                TransactionState::Open | TransactionState::Nested => {
                    self.store
                        .close_locked(&mut state, self.id, TransactionState::Aborted)
                }
                other => {
                    return Err(CoreError::invalid_operation(format!(
                        "cannot abort a {other:?} transaction",
                    )))
                }
            }
        };
        for dep in deps {
            dep.try_flush()?;
        }
        Ok(())
    }

    /// Opens a nested child transaction; this transaction becomes
    /// `Nested` and rejects writes until the child closes.
    pub fn transaction(&self) -> CoreResult<Transaction> {
        let mut state = self.store.state.lock();
        self.store.ensure_writable(&state, self.id)?;
        let id = self.store.create_entry(
            &mut state,
            Layer::Tx(self.id),
            EntryKind::Transaction { nested: true },
        );
        Ok(Transaction::new(Arc::clone(&self.store), id))
    }

    /// Materializes the transaction's current view into a detached
    /// snapshot. The snapshot pins nothing on the committed chain.
    pub fn snapshot(&self) -> CoreResult<Snapshot> {
        let mut state = self.store.state.lock();
        self.store.ensure_readable(&state, self.id)?;
        let mut records = Vec::new();
        self.store
            .view(&state, Layer::Tx(self.id))
            .stream(None, true, &mut |key, value| {
                records.push((key.to_string(), value.clone()));
                true
            })?;
        let id =
            self.store
                .create_entry(&mut state, Layer::Backend, EntryKind::Snapshot {
                    detached: true,
                });
        let entry = state
            .txns
            .get_mut(&id)
            .unwrap_or_else(|| unreachable!("snapshot entry was just created"));
        for (key, value) in records {
            entry.buffer.put(&key, value)?;
        }
        Ok(Snapshot::new(Arc::clone(&self.store), id))
    }

    /// The handle for a named index, scoped to this transaction's view.
    pub fn index(&self, name: impl Into<String>) -> CoreResult<IndexHandle> {
        let name = name.into();
        let state = self.store.state.lock();
        self.store.ensure_readable(&state, self.id)?;
        if !state.indices.iter().any(|d| d.name == name) {
            return Err(CoreError::unknown_index(name));
        }
        Ok(IndexHandle::new(
            Arc::clone(&self.store),
            Some(self.id),
            name,
        ))
    }

    /// Visible primary keys, optionally filtered by a selector.
    pub fn keys(
        &self,
        selector: Option<&Selector>,
        limit: Option<usize>,
    ) -> CoreResult<BTreeSet<String>> {
        let state = self.store.state.lock();
        self.store.ensure_readable(&state, self.id)?;
        self.store
            .select_keys(&state, Layer::Tx(self.id), selector, limit)
    }

    /// Visible records, optionally filtered by a selector.
    pub fn values(
        &self,
        selector: Option<&Selector>,
        limit: Option<usize>,
    ) -> CoreResult<Vec<Value>> {
        let state = self.store.state.lock();
        self.store.ensure_readable(&state, self.id)?;
        self.store
            .select_values(&state, Layer::Tx(self.id), selector, limit)
    }

    /// Number of visible records, optionally filtered by a selector.
    pub fn count(&self, selector: Option<&Selector>) -> CoreResult<usize> {
        let state = self.store.state.lock();
        self.store.ensure_readable(&state, self.id)?;
        self.store.select_count(&state, Layer::Tx(self.id), selector)
    }

    /// The least visible primary key inside `range`.
    pub fn min_key(&self, range: Option<&KeyRange<String>>) -> CoreResult<Option<String>> {
        let state = self.store.state.lock();
        self.store.ensure_readable(&state, self.id)?;
        self.store.view(&state, Layer::Tx(self.id)).min_key(range)
    }

    /// The greatest visible primary key inside `range`.
    pub fn max_key(&self, range: Option<&KeyRange<String>>) -> CoreResult<Option<String>> {
        let state = self.store.state.lock();
        self.store.ensure_readable(&state, self.id)?;
        self.store.view(&state, Layer::Tx(self.id)).max_key(range)
    }

    /// The value under the least visible primary key inside `range`.
    pub fn min_value(&self, range: Option<&KeyRange<String>>) -> CoreResult<Option<Value>> {
        let state = self.store.state.lock();
        self.store.ensure_readable(&state, self.id)?;
        self.store.view(&state, Layer::Tx(self.id)).min_value(range)
    }

    /// The value under the greatest visible primary key inside `range`.
    pub fn max_value(&self, range: Option<&KeyRange<String>>) -> CoreResult<Option<Value>> {
        let state = self.store.state.lock();
        self.store.ensure_readable(&state, self.id)?;
        self.store.view(&state, Layer::Tx(self.id)).max_value(range)
    }

    /// Streams visible primary keys; stops when the callback returns
    /// `false`.
    pub fn key_stream(
        &self,
        mut callback: impl FnMut(&str) -> bool,
        ascending: bool,
        range: Option<&KeyRange<String>>,
    ) -> CoreResult<()> {
        let state = self.store.state.lock();
        self.store.ensure_readable(&state, self.id)?;
        self.store
            .view(&state, Layer::Tx(self.id))
            .stream(range, ascending, &mut |key, _| callback(key))
    }

    /// Streams visible records; stops when the callback returns `false`.
    pub fn value_stream(
        &self,
        mut callback: impl FnMut(&Value, &str) -> bool,
        ascending: bool,
        range: Option<&KeyRange<String>>,
    ) -> CoreResult<()> {
        let state = self.store.state.lock();
        self.store.ensure_readable(&state, self.id)?;
        self.store
            .view(&state, Layer::Tx(self.id))
            .stream(range, ascending, &mut |key, value| callback(value, key))
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.store.on_handle_drop(self.id);
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("store", &self.store.name)
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
