//! Object stores.
//!
//! An [`ObjectStore`] owns a backend and the arena of transaction
//! entries layered on top of it. Committed-but-unflushed transactions
//! form a chain (oldest first); open transactions and snapshots hold
//! counted references to the layer they read from. The chain bottom is
//! flushed into the backend once no reader depends on an older layer,
//! and its dependents are reparented onto the backend.
//!
//! The arena-and-id model replaces parent/child object references: a
//! transaction handle is an id into its store's arena, and reparenting
//! on flush is a single field update.

pub(crate) mod view;

use crate::backend::{DatabaseBackend, FlushBatch, StoreBackend};
use crate::error::{CoreError, CoreResult};
use crate::index::view::{IndexLayer, IndexView};
use crate::index::{IndexDescriptor, IndexHandle, IndexOptions};
use crate::keyrange::KeyRange;
use crate::query::{Query, Selector};
use crate::synchronizer::Synchronizer;
use crate::transaction::combined::CombinedCommit;
use crate::transaction::{Snapshot, Transaction, TransactionState};
use jungledb_codec::{Codec, KeyPath, Value};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use view::{StoreView, ValueLayer};

static NEXT_DB_TAG: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_db_tag() -> u64 {
    NEXT_DB_TAG.fetch_add(1, Ordering::Relaxed)
}

/// Identifier of a transaction entry within its store's arena.
pub(crate) type TxId = u64;

/// The layer a reader is based on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Layer {
    /// The backend itself.
    Backend,
    /// A transaction entry in the arena.
    Tx(TxId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryKind {
    Transaction { nested: bool },
    Snapshot { detached: bool },
}

/// One arena entry: a transaction's (or snapshot's) buffered state.
pub(crate) struct TxEntry {
    pub(crate) parent: Layer,
    pub(crate) kind: EntryKind,
    pub(crate) buffer: crate::backend::InMemoryBackend,
    pub(crate) removed: BTreeSet<String>,
    pub(crate) originals: HashMap<String, Option<Value>>,
    pub(crate) truncated: bool,
    pub(crate) state: TransactionState,
    pub(crate) child: Option<TxId>,
    /// Open transactions and live snapshots parented on this entry.
    pub(crate) refs: usize,
    pub(crate) on_chain: bool,
    pub(crate) dependency: Option<Arc<CombinedCommit>>,
    pub(crate) handle_dropped: bool,
}

impl TxEntry {
    fn holds_parent_ref(&self) -> bool {
        match self.kind {
            EntryKind::Transaction { .. } => {
                matches!(self.state, TransactionState::Open | TransactionState::Nested)
            }
            EntryKind::Snapshot { detached } => {
                !detached && self.state == TransactionState::Open
            }
        }
    }

    fn is_disposable(&self) -> bool {
        match self.state {
            TransactionState::Aborted
            | TransactionState::Conflicted
            | TransactionState::Flushed => true,
            TransactionState::Committed => !self.on_chain,
            TransactionState::Open | TransactionState::Nested => false,
        }
    }
}

/// Mutable store state, guarded by the store's mutex.
pub(crate) struct StoreState {
    pub(crate) backend: Option<Arc<dyn StoreBackend>>,
    pub(crate) db_backend: Option<Arc<dyn DatabaseBackend>>,
    /// Indices live on the connected backend.
    pub(crate) indices: Vec<IndexDescriptor>,
    /// Pre-connect index declarations with their upgrade conditions.
    pub(crate) declared: Vec<(IndexDescriptor, crate::database::UpgradeCondition)>,
    pub(crate) txns: HashMap<TxId, TxEntry>,
    /// Committed, unflushed transactions, oldest first.
    pub(crate) chain: VecDeque<TxId>,
    /// The committed head new transactions are based on.
    pub(crate) head: Layer,
    /// Open transactions and live snapshots based directly on the backend.
    pub(crate) backend_refs: usize,
    pub(crate) next_tx: TxId,
}

/// Store internals shared by the store handle and every transaction,
/// snapshot and index handle derived from it.
pub(crate) struct StoreInner {
    pub(crate) name: String,
    /// Database identity for combined-commit validation; `None` marks a
    /// volatile store, which matches any database.
    pub(crate) db_tag: Option<u64>,
    pub(crate) codec: Option<Arc<dyn Codec>>,
    pub(crate) sync: Synchronizer,
    pub(crate) state: Mutex<StoreState>,
}

/// A user-facing object store.
///
/// Cloning the handle is cheap; all clones address the same store.
#[derive(Clone)]
pub struct ObjectStore {
    pub(crate) inner: Arc<StoreInner>,
}

impl ObjectStore {
    pub(crate) fn with_inner(inner: Arc<StoreInner>) -> Self {
        Self { inner }
    }

    /// Creates a standalone volatile object store, usable without a
    /// database connection.
    #[must_use]
    pub fn volatile(codec: Option<Arc<dyn Codec>>) -> Self {
        let db = crate::backend::MemoryDatabaseBackend::new();
        let backend = db
            .open_store("volatile")
            .unwrap_or_else(|_| unreachable!("memory store creation is infallible"));
        let inner = Arc::new(StoreInner {
            name: "volatile".to_string(),
            db_tag: None,
            codec,
            sync: Synchronizer::new(),
            state: Mutex::new(StoreState {
                backend: Some(backend),
                db_backend: Some(Arc::new(db)),
                indices: Vec::new(),
                declared: Vec::new(),
                txns: HashMap::new(),
                chain: VecDeque::new(),
                head: Layer::Backend,
                backend_refs: 0,
                next_tx: 1,
            }),
        });
        Self { inner }
    }

    /// The store's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The codec persistent backend adapters use for this store's
    /// records. The in-memory backend stores values directly and never
    /// consults it.
    #[must_use]
    pub fn codec(&self) -> Option<Arc<dyn Codec>> {
        self.inner.codec.clone()
    }

    /// Declares a secondary index.
    ///
    /// On a database-attached store this must happen before `connect`;
    /// the index is installed (and backfilled) during the upgrade. On a
    /// volatile store the index is installed immediately, which requires
    /// that no transaction is open.
    pub fn create_index(
        &self,
        name: impl Into<String>,
        key_path: impl Into<KeyPath>,
        options: IndexOptions,
    ) -> CoreResult<()> {
        let name = name.into();
        let descriptor = IndexDescriptor {
            name: name.clone(),
            key_path: key_path.into(),
            multi_entry: options.multi_entry,
            unique: options.unique,
        };
        let mut state = self.inner.state.lock();
        if state.indices.iter().any(|d| d.name == name)
            || state.declared.iter().any(|(d, _)| d.name == name)
        {
            return Err(CoreError::schema(format!("index '{name}' already declared")));
        }
        let Some(backend) = state.backend.clone() else {
            state.declared.push((descriptor, options.upgrade_condition));
            return Ok(());
        };
        if self.inner.db_tag.is_some() {
            return Err(CoreError::schema(
                "cannot create an index while the database is connected",
            ));
        }
        if !state.txns.is_empty() {
            return Err(CoreError::invalid_operation(
                "cannot create an index while transactions are open",
            ));
        }
        backend.ensure_index(&descriptor)?;
        state.indices.push(descriptor);
        Ok(())
    }

    /// Opens a transaction based on the current committed state.
    pub fn transaction(&self) -> CoreResult<Transaction> {
        let mut state = self.inner.state.lock();
        self.inner.ensure_connected(&state)?;
        let head = state.head;
        let id = self
            .inner
            .create_entry(&mut state, head, EntryKind::Transaction { nested: false });
        Ok(Transaction::new(Arc::clone(&self.inner), id))
    }

    /// Pins the current committed state as a long-lived read view.
    pub fn snapshot(&self) -> CoreResult<Snapshot> {
        let mut state = self.inner.state.lock();
        self.inner.ensure_connected(&state)?;
        let head = state.head;
        let id = self
            .inner
            .create_entry(&mut state, head, EntryKind::Snapshot { detached: false });
        Ok(Snapshot::new(Arc::clone(&self.inner), id))
    }

    /// The handle for a named index.
    pub fn index(&self, name: impl Into<String>) -> CoreResult<IndexHandle> {
        let name = name.into();
        let state = self.inner.state.lock();
        if !state.indices.iter().any(|d| d.name == name) {
            return Err(CoreError::unknown_index(name));
        }
        Ok(IndexHandle::new(Arc::clone(&self.inner), None, name))
    }

    /// Reads the record stored under `key`.
    pub fn get(&self, key: &str) -> CoreResult<Option<Value>> {
        let state = self.inner.state.lock();
        self.inner.ensure_connected(&state)?;
        let head = state.head;
        self.inner.view(&state, head).get(key)
    }

    /// Writes a record through an implicit transaction.
    pub fn put(&self, key: &str, value: Value) -> CoreResult<()> {
        self.inner.direct_write(|inner, state, id| {
            inner.put_locked(state, id, key, value.clone())
        })
    }

    /// Removes a record through an implicit transaction.
    pub fn remove(&self, key: &str) -> CoreResult<()> {
        self.inner
            .direct_write(|inner, state, id| inner.remove_locked(state, id, key))
    }

    /// Removes every record through an implicit transaction.
    pub fn truncate(&self) -> CoreResult<()> {
        self.inner
            .direct_write(|inner, state, id| inner.truncate_locked(state, id))
    }

    /// Visible primary keys, optionally filtered by a selector.
    pub fn keys(
        &self,
        selector: Option<&Selector>,
        limit: Option<usize>,
    ) -> CoreResult<BTreeSet<String>> {
        let state = self.inner.state.lock();
        self.inner.ensure_connected(&state)?;
        let head = state.head;
        self.inner.select_keys(&state, head, selector, limit)
    }

    /// Visible records, optionally filtered by a selector.
    pub fn values(
        &self,
        selector: Option<&Selector>,
        limit: Option<usize>,
    ) -> CoreResult<Vec<Value>> {
        let state = self.inner.state.lock();
        self.inner.ensure_connected(&state)?;
        let head = state.head;
        self.inner.select_values(&state, head, selector, limit)
    }

    /// Number of visible records, optionally filtered by a selector.
    pub fn count(&self, selector: Option<&Selector>) -> CoreResult<usize> {
        let state = self.inner.state.lock();
        self.inner.ensure_connected(&state)?;
        let head = state.head;
        self.inner.select_count(&state, head, selector)
    }

    /// The least visible primary key inside `range`.
    pub fn min_key(&self, range: Option<&KeyRange<String>>) -> CoreResult<Option<String>> {
        let state = self.inner.state.lock();
        self.inner.ensure_connected(&state)?;
        let head = state.head;
        self.inner.view(&state, head).min_key(range)
    }

    /// The greatest visible primary key inside `range`.
    pub fn max_key(&self, range: Option<&KeyRange<String>>) -> CoreResult<Option<String>> {
        let state = self.inner.state.lock();
        self.inner.ensure_connected(&state)?;
        let head = state.head;
        self.inner.view(&state, head).max_key(range)
    }

    /// The value under the least visible primary key inside `range`.
    pub fn min_value(&self, range: Option<&KeyRange<String>>) -> CoreResult<Option<Value>> {
        let state = self.inner.state.lock();
        self.inner.ensure_connected(&state)?;
        let head = state.head;
        self.inner.view(&state, head).min_value(range)
    }

    /// The value under the greatest visible primary key inside `range`.
    pub fn max_value(&self, range: Option<&KeyRange<String>>) -> CoreResult<Option<Value>> {
        let state = self.inner.state.lock();
        self.inner.ensure_connected(&state)?;
        let head = state.head;
        self.inner.view(&state, head).max_value(range)
    }

    /// Streams visible primary keys; stops when the callback returns
    /// `false`.
    pub fn key_stream(
        &self,
        mut callback: impl FnMut(&str) -> bool,
        ascending: bool,
        range: Option<&KeyRange<String>>,
    ) -> CoreResult<()> {
        let state = self.inner.state.lock();
        self.inner.ensure_connected(&state)?;
        let head = state.head;
        self.inner
            .view(&state, head)
            .stream(range, ascending, &mut |key, _| callback(key))
    }

    /// Streams visible records; stops when the callback returns `false`.
    pub fn value_stream(
        &self,
        mut callback: impl FnMut(&Value, &str) -> bool,
        ascending: bool,
        range: Option<&KeyRange<String>>,
    ) -> CoreResult<()> {
        let state = self.inner.state.lock();
        self.inner.ensure_connected(&state)?;
        let head = state.head;
        self.inner
            .view(&state, head)
            .stream(range, ascending, &mut |key, value| callback(value, key))
    }
}

impl std::fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ObjectStore")
            .field("name", &self.inner.name)
            .field("connected", &state.backend.is_some())
            .field("open_entries", &state.txns.len())
            .field("chain_depth", &state.chain.len())
            .finish()
    }
}

impl StoreInner {
    pub(crate) fn ensure_connected(&self, state: &StoreState) -> CoreResult<()> {
        if state.backend.is_none() {
            return Err(CoreError::invalid_operation(format!(
                "object store '{}' is not connected",
                self.name
            )));
        }
        Ok(())
    }

    /// Builds the layered primary view for a reader based on `from`.
    pub(crate) fn view<'a>(&self, state: &'a StoreState, from: Layer) -> StoreView<'a> {
        let mut layers = Vec::new();
        let mut current = from;
        loop {
            match current {
                Layer::Backend => {
                    return StoreView {
                        layers,
                        base: state.backend.clone(),
                    }
                }
                Layer::Tx(id) => {
                    let entry = &state.txns[&id];
                    layers.push(ValueLayer {
                        modified: entry.buffer.tree(),
                        removed: &entry.removed,
                    });
                    if entry.truncated {
                        return StoreView { layers, base: None };
                    }
                    current = entry.parent;
                }
            }
        }
    }

    /// Builds the layered index view for a reader based on `from`.
    pub(crate) fn index_view<'a>(
        &self,
        state: &'a StoreState,
        from: Layer,
        name: &str,
    ) -> CoreResult<IndexView<'a>> {
        if !state.indices.iter().any(|d| d.name == name) {
            return Err(CoreError::unknown_index(name));
        }
        let mut layers = Vec::new();
        let mut current = from;
        loop {
            match current {
                Layer::Backend => {
                    let base = state.backend.as_ref().and_then(|b| b.index(name));
                    return Ok(IndexView { layers, base });
                }
                Layer::Tx(id) => {
                    let entry = &state.txns[&id];
                    let delta = entry
                        .buffer
                        .index(name)
                        .ok_or_else(|| CoreError::unknown_index(name))?;
                    layers.push(IndexLayer {
                        delta,
                        removed: &entry.removed,
                        modified: entry.buffer.tree(),
                    });
                    if entry.truncated {
                        return Ok(IndexView { layers, base: None });
                    }
                    current = entry.parent;
                }
            }
        }
    }

    pub(crate) fn select_keys(
        &self,
        state: &StoreState,
        from: Layer,
        selector: Option<&Selector>,
        limit: Option<usize>,
    ) -> CoreResult<BTreeSet<String>> {
        match selector {
            None => self.view(state, from).keys(None, limit),
            Some(Selector::Range(range)) => self.view(state, from).keys(Some(range), limit),
            Some(Selector::Query(query)) => self
                .index_view(state, from, query.index())?
                .keys(Some(query.key_range()), limit),
        }
    }

    pub(crate) fn select_values(
        &self,
        state: &StoreState,
        from: Layer,
        selector: Option<&Selector>,
        limit: Option<usize>,
    ) -> CoreResult<Vec<Value>> {
        match selector {
            None => self.view(state, from).values(None, limit),
            Some(Selector::Range(range)) => self.view(state, from).values(Some(range), limit),
            Some(Selector::Query(query)) => {
                let keys = self.query_keys(state, from, query, limit)?;
                let view = self.view(state, from);
                let mut values = Vec::with_capacity(keys.len());
                for key in keys {
                    if let Some(value) = view.get(&key)? {
                        values.push(value);
                    }
                }
                Ok(values)
            }
        }
    }

    pub(crate) fn select_count(
        &self,
        state: &StoreState,
        from: Layer,
        selector: Option<&Selector>,
    ) -> CoreResult<usize> {
        match selector {
            None => self.view(state, from).count(None),
            Some(Selector::Range(range)) => self.view(state, from).count(Some(range)),
            Some(Selector::Query(query)) => self
                .index_view(state, from, query.index())?
                .count(Some(query.key_range())),
        }
    }

    fn query_keys(
        &self,
        state: &StoreState,
        from: Layer,
        query: &Query,
        limit: Option<usize>,
    ) -> CoreResult<BTreeSet<String>> {
        self.index_view(state, from, query.index())?
            .keys(Some(query.key_range()), limit)
    }

    // Entry lifecycle

    pub(crate) fn create_entry(
        &self,
        state: &mut StoreState,
        parent: Layer,
        kind: EntryKind,
    ) -> TxId {
        let id = state.next_tx;
        state.next_tx += 1;
        let buffer = crate::backend::InMemoryBackend::with_indices(state.indices.iter());
        let detached = matches!(kind, EntryKind::Snapshot { detached: true });
        let entry = TxEntry {
            parent,
            kind,
            buffer,
            removed: BTreeSet::new(),
            originals: HashMap::new(),
            truncated: detached,
            state: TransactionState::Open,
            child: None,
            refs: 0,
            on_chain: false,
            dependency: None,
            handle_dropped: false,
        };
        if !detached {
            self.add_ref(state, parent);
        }
        state.txns.insert(id, entry);
        if let EntryKind::Transaction { nested: true } = kind {
            if let Layer::Tx(pid) = parent {
                let parent_entry = state
                    .txns
                    .get_mut(&pid)
                    .unwrap_or_else(|| unreachable!("nested parent exists"));
                parent_entry.state = TransactionState::Nested;
                parent_entry.child = Some(id);
            }
        }
        id
    }

    fn add_ref(&self, state: &mut StoreState, layer: Layer) {
        match layer {
            Layer::Backend => state.backend_refs += 1,
            Layer::Tx(id) => {
                if let Some(entry) = state.txns.get_mut(&id) {
                    entry.refs += 1;
                }
            }
        }
    }

    fn release_ref(&self, state: &mut StoreState, layer: Layer) {
        match layer {
            Layer::Backend => state.backend_refs = state.backend_refs.saturating_sub(1),
            Layer::Tx(id) => {
                if let Some(entry) = state.txns.get_mut(&id) {
                    entry.refs = entry.refs.saturating_sub(1);
                }
            }
        }
    }

    fn maybe_remove(&self, state: &mut StoreState, id: TxId) {
        let Some(entry) = state.txns.get(&id) else { return };
        if entry.handle_dropped && entry.is_disposable() {
            state.txns.remove(&id);
        }
    }

    // Transaction operations (caller holds the state lock)

    pub(crate) fn ensure_writable(&self, state: &StoreState, id: TxId) -> CoreResult<()> {
        let entry = state
            .txns
            .get(&id)
            .ok_or_else(|| CoreError::invalid_operation("transaction no longer exists"))?;
        if !matches!(entry.kind, EntryKind::Transaction { .. }) {
            return Err(CoreError::invalid_operation("snapshots are read-only"));
        }
        match entry.state {
            TransactionState::Open => Ok(()),
            TransactionState::Nested => Err(CoreError::invalid_operation(
                "transaction has an open nested child",
            )),
            other => Err(CoreError::invalid_operation(format!(
                "transaction is {other:?}, not open",
            ))),
        }
    }

    pub(crate) fn ensure_readable(&self, state: &StoreState, id: TxId) -> CoreResult<()> {
        let entry = state
            .txns
            .get(&id)
            .ok_or_else(|| CoreError::invalid_operation("transaction no longer exists"))?;
        match entry.state {
            TransactionState::Open | TransactionState::Nested | TransactionState::Committed => {
                Ok(())
            }
            other => Err(CoreError::invalid_operation(format!(
                "transaction is {other:?} and can no longer be read",
            ))),
        }
    }

    pub(crate) fn put_locked(
        &self,
        state: &mut StoreState,
        id: TxId,
        key: &str,
        value: Value,
    ) -> CoreResult<()> {
        self.ensure_writable(state, id)?;
        let parent = state.txns[&id].parent;
        let needs_original = !state.txns[&id].originals.contains_key(key);
        let original = if needs_original {
            Some(self.view(state, parent).get(key)?)
        } else {
            None
        };
        let entry = state
            .txns
            .get_mut(&id)
            .unwrap_or_else(|| unreachable!("entry checked above"));
        if let Some(original) = original {
            entry.originals.insert(key.to_string(), original);
        }
        if let Err(err) = entry.buffer.put(key, value) {
            if matches!(err, CoreError::UniquenessViolation { .. }) {
                self.close_locked(state, id, TransactionState::Aborted);
            }
            return Err(err);
        }
        entry.removed.remove(key);
        Ok(())
    }

    pub(crate) fn remove_locked(
        &self,
        state: &mut StoreState,
        id: TxId,
        key: &str,
    ) -> CoreResult<()> {
        self.ensure_writable(state, id)?;
        let parent = state.txns[&id].parent;
        let needs_original = !state.txns[&id].originals.contains_key(key);
        let original = if needs_original {
            Some(self.view(state, parent).get(key)?)
        } else {
            None
        };
        let entry = state
            .txns
            .get_mut(&id)
            .unwrap_or_else(|| unreachable!("entry checked above"));
        if let Some(original) = original {
            entry.originals.insert(key.to_string(), original);
        }
        entry.buffer.remove(key);
        entry.removed.insert(key.to_string());
        Ok(())
    }

    pub(crate) fn truncate_locked(&self, state: &mut StoreState, id: TxId) -> CoreResult<()> {
        self.ensure_writable(state, id)?;
        let entry = state
            .txns
            .get_mut(&id)
            .unwrap_or_else(|| unreachable!("entry checked above"));
        entry.truncated = true;
        entry.buffer.truncate();
        entry.removed.clear();
        entry.originals.clear();
        Ok(())
    }

    /// Full unique-index validation of an entry against its merged view.
    pub(crate) fn check_unique_locked(&self, state: &StoreState, id: TxId) -> CoreResult<()> {
        let entry = &state.txns[&id];
        for descriptor in state.indices.iter().filter(|d| d.unique) {
            let Some(delta) = entry.buffer.index(&descriptor.name) else {
                continue;
            };
            let pairs: Vec<(Value, String)> = delta
                .pairs(None, true)
                .map(|(s, p)| (s.clone(), p.clone()))
                .collect();
            for (secondary, primary) in pairs {
                let holders = self
                    .index_view(state, Layer::Tx(id), &descriptor.name)?
                    .keys(Some(&KeyRange::only(secondary.clone())), None)?;
                if let Some(existing) = holders.iter().find(|pk| pk.as_str() != primary) {
                    return Err(CoreError::uniqueness_violation(
                        &descriptor.name,
                        secondary,
                        existing.clone(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Commits an entry. Returns `Ok(false)` on an optimistic conflict.
    /// The returned coordinators must be notified after the lock drops.
    pub(crate) fn commit_locked(
        &self,
        state: &mut StoreState,
        id: TxId,
    ) -> CoreResult<(bool, Vec<Arc<CombinedCommit>>)> {
        self.ensure_writable(state, id)?;
        let (nested, parent) = {
            let entry = &state.txns[&id];
            (
                matches!(entry.kind, EntryKind::Transaction { nested: true }),
                entry.parent,
            )
        };
        if nested {
            self.commit_nested_locked(state, id)?;
            return Ok((true, Vec::new()));
        }

        if parent != state.head {
            tracing::debug!(
                store = %self.name,
                tx = id,
                touched = state.txns[&id].originals.len(),
                "optimistic conflict on commit"
            );
            let deps = self.close_locked(state, id, TransactionState::Conflicted);
            return Ok((false, deps));
        }

        if let Err(err) = self.check_unique_locked(state, id) {
            self.close_locked(state, id, TransactionState::Aborted);
            return Err(err);
        }

        let entry = state
            .txns
            .get_mut(&id)
            .unwrap_or_else(|| unreachable!("entry checked above"));
        entry.state = TransactionState::Committed;
        entry.on_chain = true;
        self.release_ref(state, parent);
        state.chain.push_back(id);
        state.head = Layer::Tx(id);
        let deps = self.flatten_locked(state)?;
        Ok((true, deps))
    }

    /// Merges a nested child into its parent and closes the child.
    fn commit_nested_locked(&self, state: &mut StoreState, id: TxId) -> CoreResult<()> {
        let pid = match state.txns[&id].parent {
            Layer::Tx(pid) => pid,
            Layer::Backend => unreachable!("nested transactions have a parent transaction"),
        };

        // Cross-check the child's unique deltas against the parent buffer
        // before touching either, so a violation leaves both intact.
        let violation: Option<(String, Value, String)> = {
            let mut found = None;
            'indices: for descriptor in state.indices.iter().filter(|d| d.unique) {
                let child = &state.txns[&id];
                let parent = &state.txns[&pid];
                let (Some(child_delta), Some(parent_delta)) = (
                    child.buffer.index(&descriptor.name),
                    parent.buffer.index(&descriptor.name),
                ) else {
                    continue;
                };
                for (secondary, primary) in child_delta.pairs(None, true) {
                    let holders =
                        parent_delta.keys(Some(&KeyRange::only(secondary.clone())), None);
                    if let Some(existing) = holders.iter().find(|pk| {
                        pk.as_str() != primary.as_str() && !child.removed.contains(pk.as_str())
                    }) {
                        found = Some((descriptor.name.clone(), secondary.clone(), existing.clone()));
                        break 'indices;
                    }
                }
            }
            found
        };
        if let Some((name, secondary, existing)) = violation {
            self.close_locked(state, id, TransactionState::Aborted);
            return Err(CoreError::uniqueness_violation(name, secondary, existing));
        }

        let mut child = state
            .txns
            .remove(&id)
            .unwrap_or_else(|| unreachable!("child entry exists"));
        let parent = state
            .txns
            .get_mut(&pid)
            .unwrap_or_else(|| unreachable!("parent entry exists"));
        if child.truncated {
            parent.truncated = true;
            parent.buffer.truncate();
            parent.removed.clear();
            parent.originals.clear();
        }
        for (key, original) in child.originals.drain() {
            parent.originals.entry(key).or_insert(original);
        }
        for key in &child.removed {
            parent.buffer.remove(key);
            parent.removed.insert(key.clone());
        }
        let writes: Vec<(String, Value)> = child
            .buffer
            .tree()
            .range_iter(std::ops::Bound::Unbounded, std::ops::Bound::Unbounded, true)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, value) in writes {
            parent.buffer.put(&key, value)?;
            parent.removed.remove(&key);
        }
        parent.state = TransactionState::Open;
        parent.child = None;
        parent.refs = parent.refs.saturating_sub(1);

        if !child.handle_dropped {
            let mut closed = child;
            closed.state = TransactionState::Committed;
            closed.on_chain = false;
            closed.buffer.truncate();
            closed.removed.clear();
            closed.originals.clear();
            state.txns.insert(id, closed);
        }
        Ok(())
    }

    /// Closes an entry into a terminal (or conflicted) state, cascading
    /// to an open nested child, and releases its references.
    pub(crate) fn close_locked(
        &self,
        state: &mut StoreState,
        id: TxId,
        final_state: TransactionState,
    ) -> Vec<Arc<CombinedCommit>> {
        let Some(entry) = state.txns.get(&id) else {
            return Vec::new();
        };
        if let Some(child) = entry.child {
            self.close_locked(state, child, TransactionState::Aborted);
        }
        let Some(entry) = state.txns.get_mut(&id) else {
            return Vec::new();
        };
        let parent = entry.parent;
        let held_ref = entry.holds_parent_ref();
        let was_nested_child = matches!(entry.kind, EntryKind::Transaction { nested: true });
        entry.state = final_state;
        entry.child = None;
        entry.buffer.truncate();
        entry.removed.clear();
        entry.originals.clear();
        if held_ref {
            self.release_ref(state, parent);
        }
        if was_nested_child {
            if let Layer::Tx(pid) = parent {
                if let Some(parent_entry) = state.txns.get_mut(&pid) {
                    if parent_entry.state == TransactionState::Nested {
                        parent_entry.state = TransactionState::Open;
                    }
                    parent_entry.child = None;
                }
            }
        }
        self.maybe_remove(state, id);
        self.flatten_locked(state).unwrap_or_default()
    }

    /// Flushes the chain bottom into the backend while nothing pins an
    /// older layer. Stops at entries bound to a combined commit and
    /// returns their coordinators for notification outside the lock.
    pub(crate) fn flatten_locked(
        &self,
        state: &mut StoreState,
    ) -> CoreResult<Vec<Arc<CombinedCommit>>> {
        let mut pending = Vec::new();
        loop {
            let Some(&bottom) = state.chain.front() else { break };
            if state.backend_refs > 0 {
                break;
            }
            if let Some(dependency) = &state.txns[&bottom].dependency {
                pending.push(Arc::clone(dependency));
                break;
            }
            let db_backend = state
                .db_backend
                .clone()
                .ok_or_else(|| CoreError::invalid_operation("store has no database backend"))?;
            let batch = self.build_batch(&state.txns[&bottom]);
            let mut scope = db_backend.begin_write()?;
            scope.stage(&self.name, batch)?;
            scope.commit()?;
            tracing::debug!(store = %self.name, tx = bottom, "flushed transaction into backend");
            self.finish_flush(state, bottom);
        }
        Ok(pending)
    }

    /// Marks a chain bottom flushed and reparents its dependents.
    pub(crate) fn finish_flush(&self, state: &mut StoreState, bottom: TxId) {
        let entry = state
            .txns
            .get_mut(&bottom)
            .unwrap_or_else(|| unreachable!("chain bottom exists"));
        entry.state = TransactionState::Flushed;
        entry.on_chain = false;
        entry.dependency = None;
        entry.buffer.truncate();
        entry.removed.clear();
        entry.originals.clear();
        state.chain.pop_front();
        if state.head == Layer::Tx(bottom) {
            state.head = Layer::Backend;
        }
        let dependents: Vec<TxId> = state
            .txns
            .iter()
            .filter(|(tid, e)| **tid != bottom && e.parent == Layer::Tx(bottom))
            .map(|(tid, _)| *tid)
            .collect();
        for tid in dependents {
            let entry = state
                .txns
                .get_mut(&tid)
                .unwrap_or_else(|| unreachable!("dependent exists"));
            entry.parent = Layer::Backend;
            if entry.holds_parent_ref() {
                state.backend_refs += 1;
            }
        }
        self.maybe_remove(state, bottom);
    }

    pub(crate) fn build_batch(&self, entry: &TxEntry) -> FlushBatch {
        FlushBatch {
            truncated: entry.truncated,
            writes: entry
                .buffer
                .tree()
                .range_iter(std::ops::Bound::Unbounded, std::ops::Bound::Unbounded, true)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            removals: entry.removed.iter().cloned().collect(),
        }
    }

    /// Runs an implicit single-shot transaction under one lock
    /// acquisition, so it can never lose an optimistic race.
    fn direct_write(
        &self,
        operation: impl Fn(&StoreInner, &mut StoreState, TxId) -> CoreResult<()>,
    ) -> CoreResult<()> {
        let deps = self.sync.push(|| -> CoreResult<Vec<Arc<CombinedCommit>>> {
            let mut state = self.state.lock();
            self.ensure_connected(&state)?;
            let head = state.head;
            let id = self.create_entry(&mut state, head, EntryKind::Transaction { nested: false });
            if let Err(err) = operation(self, &mut state, id) {
                // A uniqueness violation already closed the entry.
                if state.txns.contains_key(&id) {
                    self.close_locked(&mut state, id, TransactionState::Aborted);
                }
                self.mark_handle_dropped(&mut state, id);
                return Err(err);
            }
            match self.commit_locked(&mut state, id) {
                Ok((true, deps)) => {
                    self.mark_handle_dropped(&mut state, id);
                    Ok(deps)
                }
                Ok((false, deps)) => {
                    self.mark_handle_dropped(&mut state, id);
                    drop(deps);
                    Err(CoreError::invalid_operation(
                        "implicit transaction lost a commit race",
                    ))
                }
                Err(err) => {
                    self.mark_handle_dropped(&mut state, id);
                    Err(err)
                }
            }
        })?;
        for dep in deps {
            dep.try_flush()?;
        }
        Ok(())
    }

    fn mark_handle_dropped(&self, state: &mut StoreState, id: TxId) {
        if let Some(entry) = state.txns.get_mut(&id) {
            entry.handle_dropped = true;
        }
        self.maybe_remove(state, id);
    }

    /// Handle-drop hook shared by transactions and snapshots.
    pub(crate) fn on_handle_drop(&self, id: TxId) {
        let deps = {
            let mut state = self.state.lock();
            let Some(entry) = state.txns.get_mut(&id) else {
                return;
            };
            entry.handle_dropped = true;
            match entry.state {
                TransactionState::Open | TransactionState::Nested => {
                    self.close_locked(&mut state, id, TransactionState::Aborted)
                }
                _ => {
                    self.maybe_remove(&mut state, id);
                    Vec::new()
                }
            }
        };
        for dep in deps {
            // Flush failures have no caller here; adapters surface them
            // on the next explicit operation.
            let _ = dep.try_flush();
        }
    }
}
