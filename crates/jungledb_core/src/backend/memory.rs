//! In-memory backend.
//!
//! [`InMemoryBackend`] is the plain ordered record store used in two
//! roles: wrapped in a lock as the volatile [`StoreBackend`], and bare as
//! every transaction's delta buffer. [`MemoryDatabaseBackend`] groups
//! named stores with a stored version so connect/close/upgrade flows work
//! against it like against any persistent adapter, minus durability.

use crate::backend::{
    DatabaseBackend, FlushBatch, StoreBackend, StoreCursor, WriteScope,
};
use crate::error::{CoreError, CoreResult};
use crate::index::{IndexCursor, IndexDescriptor, IndexReader, InMemoryIndex};
use crate::keyrange::{bounds_of, KeyRange};
use crate::tree::BTree;
use jungledb_codec::Value;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::Arc;

/// Ordered key/value store with secondary indices.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    tree: BTree<String, Value>,
    indices: HashMap<String, InMemoryIndex>,
}

impl InMemoryBackend {
    /// Creates an empty backend without indices.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty backend carrying the given indices.
    #[must_use]
    pub fn with_indices<'a>(descriptors: impl IntoIterator<Item = &'a IndexDescriptor>) -> Self {
        let mut backend = Self::new();
        for descriptor in descriptors {
            backend
                .indices
                .insert(descriptor.name.clone(), InMemoryIndex::new(descriptor.clone()));
        }
        backend
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    /// Whether the backend holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Reads a record.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.tree.get(key)
    }

    /// Writes a record, updating every index.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::UniquenessViolation`] when the write would
    /// give a unique index two primary keys for one secondary key; the
    /// backend is left unchanged.
    pub fn put(&mut self, key: &str, value: Value) -> CoreResult<()> {
        for index in self.indices.values() {
            if !index.descriptor().unique {
                continue;
            }
            let descriptor = index.descriptor();
            for secondary in descriptor.key_path.index_keys(&value, descriptor.multi_entry) {
                let holders = index.keys(Some(&KeyRange::only(secondary.clone())), None);
                if let Some(existing) = holders.iter().find(|pk| pk.as_str() != key) {
                    return Err(CoreError::uniqueness_violation(
                        &descriptor.name,
                        secondary,
                        existing.clone(),
                    ));
                }
            }
        }
        let old = self.tree.insert_or_replace(key.to_string(), value);
        // Re-read the freshly stored value to feed the indices.
        let new_value = self
            .tree
            .get(key)
            .cloned()
            .unwrap_or_else(|| unreachable!("record was just stored"));
        for index in self.indices.values_mut() {
            index.put(key, &new_value, old.as_ref())?;
        }
        Ok(())
    }

    /// Removes a record, updating every index. Returns the old value.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let old = self.tree.remove(&key.to_string())?;
        for index in self.indices.values_mut() {
            index.remove(key, &old);
        }
        Some(old)
    }

    /// Removes every record and clears every index.
    pub fn truncate(&mut self) {
        self.tree.clear();
        for index in self.indices.values_mut() {
            index.truncate();
        }
    }

    /// Installs an index, backfilling it by scanning every live record.
    /// Returns `false` when an index of that name already exists.
    pub fn create_index(&mut self, descriptor: &IndexDescriptor) -> CoreResult<bool> {
        if self.indices.contains_key(&descriptor.name) {
            return Ok(false);
        }
        let mut index = InMemoryIndex::new(descriptor.clone());
        for (key, value) in self
            .tree
            .range_iter(Bound::Unbounded, Bound::Unbounded, true)
        {
            index.put(key, value, None)?;
        }
        self.indices.insert(descriptor.name.clone(), index);
        Ok(true)
    }

    /// Drops an index. Returns `false` if it did not exist.
    pub fn drop_index(&mut self, name: &str) -> bool {
        self.indices.remove(name).is_some()
    }

    /// The named index, if present.
    #[must_use]
    pub fn index(&self, name: &str) -> Option<&InMemoryIndex> {
        self.indices.get(name)
    }

    /// Names of the maintained indices.
    #[must_use]
    pub fn index_names(&self) -> Vec<String> {
        self.indices.keys().cloned().collect()
    }

    /// The primary tree, for layered views.
    #[must_use]
    pub(crate) fn tree(&self) -> &BTree<String, Value> {
        &self.tree
    }

    /// All primary keys inside `range`.
    #[must_use]
    pub fn keys(&self, range: Option<&KeyRange<String>>) -> BTreeSet<String> {
        let (lower, upper) = bounds_of(range);
        self.tree
            .range_iter(lower, upper, true)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Number of records inside `range`.
    #[must_use]
    pub fn count(&self, range: Option<&KeyRange<String>>) -> usize {
        let (lower, upper) = bounds_of(range);
        self.tree.range_iter(lower, upper, true).count()
    }

    /// Applies a committed transaction's deltas.
    pub fn apply(&mut self, batch: &FlushBatch) -> CoreResult<()> {
        if batch.truncated {
            self.truncate();
        }
        for key in &batch.removals {
            self.remove(key);
        }
        for (key, value) in &batch.writes {
            self.put(key, value.clone())?;
        }
        Ok(())
    }
}

/// Volatile [`StoreBackend`] over a shared [`InMemoryBackend`].
pub(crate) struct MemoryStoreBackend {
    state: Arc<RwLock<InMemoryBackend>>,
}

impl MemoryStoreBackend {
    pub(crate) fn new(state: Arc<RwLock<InMemoryBackend>>) -> Self {
        Self { state }
    }
}

impl StoreBackend for MemoryStoreBackend {
    fn get(&self, key: &str) -> CoreResult<Option<Value>> {
        Ok(self.state.read().get(key).cloned())
    }

    fn keys(&self, range: Option<&KeyRange<String>>) -> CoreResult<BTreeSet<String>> {
        Ok(self.state.read().keys(range))
    }

    fn count(&self, range: Option<&KeyRange<String>>) -> CoreResult<usize> {
        Ok(self.state.read().count(range))
    }

    fn cursor(
        &self,
        range: Option<&KeyRange<String>>,
        ascending: bool,
    ) -> CoreResult<Box<dyn StoreCursor>> {
        Ok(Box::new(MemoryStoreCursor {
            state: Arc::clone(&self.state),
            range: range.cloned(),
            ascending,
            last: None,
        }))
    }

    fn index(&self, name: &str) -> Option<Arc<dyn IndexReader>> {
        if self.state.read().index(name).is_none() {
            return None;
        }
        Some(Arc::new(MemoryIndexReader {
            state: Arc::clone(&self.state),
            name: name.to_string(),
        }))
    }

    fn index_names(&self) -> Vec<String> {
        self.state.read().index_names()
    }

    fn ensure_index(&self, descriptor: &IndexDescriptor) -> CoreResult<bool> {
        self.state.write().create_index(descriptor)
    }

    fn drop_index(&self, name: &str) -> CoreResult<bool> {
        Ok(self.state.write().drop_index(name))
    }

    fn truncate(&self) -> CoreResult<()> {
        self.state.write().truncate();
        Ok(())
    }
}

/// Re-seek cursor: remembers the last key handed out and looks up its
/// successor under a fresh lock on every step.
struct MemoryStoreCursor {
    state: Arc<RwLock<InMemoryBackend>>,
    range: Option<KeyRange<String>>,
    ascending: bool,
    last: Option<String>,
}

impl StoreCursor for MemoryStoreCursor {
    fn next(&mut self) -> CoreResult<Option<(String, Value)>> {
        let state = self.state.read();
        let (mut lower, mut upper) = bounds_of(self.range.as_ref());
        if let Some(last) = &self.last {
            if self.ascending {
                lower = Bound::Excluded(last);
            } else {
                upper = Bound::Excluded(last);
            }
        }
        let next = state
            .tree()
            .range_iter(lower, upper, self.ascending)
            .next()
            .map(|(k, v)| (k.clone(), v.clone()));
        if let Some((key, _)) = &next {
            self.last = Some(key.clone());
        }
        Ok(next)
    }
}

/// Index adapter over the shared in-memory state.
struct MemoryIndexReader {
    state: Arc<RwLock<InMemoryBackend>>,
    name: String,
}

impl MemoryIndexReader {
    fn with_index<T>(&self, f: impl FnOnce(&InMemoryIndex) -> T) -> CoreResult<T> {
        let state = self.state.read();
        let index = state
            .index(&self.name)
            .ok_or_else(|| CoreError::unknown_index(&self.name))?;
        Ok(f(index))
    }
}

impl IndexReader for MemoryIndexReader {
    fn descriptor(&self) -> CoreResult<IndexDescriptor> {
        self.with_index(|index| index.descriptor().clone())
    }

    fn keys(&self, range: Option<&KeyRange<Value>>) -> CoreResult<BTreeSet<String>> {
        self.with_index(|index| index.keys(range, None))
    }

    fn cursor(
        &self,
        range: Option<&KeyRange<Value>>,
        ascending: bool,
    ) -> CoreResult<Box<dyn IndexCursor>> {
        Ok(Box::new(MemoryIndexCursor {
            state: Arc::clone(&self.state),
            name: self.name.clone(),
            range: range.cloned(),
            ascending,
            last: None,
        }))
    }
}

struct MemoryIndexCursor {
    state: Arc<RwLock<InMemoryBackend>>,
    name: String,
    range: Option<KeyRange<Value>>,
    ascending: bool,
    last: Option<(Value, String)>,
}

impl IndexCursor for MemoryIndexCursor {
    fn next(&mut self) -> CoreResult<Option<(Value, String)>> {
        let state = self.state.read();
        let index = state
            .index(&self.name)
            .ok_or_else(|| CoreError::unknown_index(&self.name))?;
        let next = index.pair_after(self.last.as_ref(), self.range.as_ref(), self.ascending);
        if let Some(pair) = &next {
            self.last = Some(pair.clone());
        }
        Ok(next)
    }
}

#[derive(Debug, Default)]
struct MemoryDbState {
    stores: RwLock<HashMap<String, Arc<RwLock<InMemoryBackend>>>>,
    version: RwLock<u32>,
}

/// Volatile [`DatabaseBackend`]: named in-memory stores plus a stored
/// version, with atomic write scopes across them.
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabaseBackend {
    state: Arc<MemoryDbState>,
}

impl MemoryDatabaseBackend {
    /// Creates an empty volatile database backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl DatabaseBackend for MemoryDatabaseBackend {
    fn version(&self) -> CoreResult<u32> {
        Ok(*self.state.version.read())
    }

    fn set_version(&self, version: u32) -> CoreResult<()> {
        *self.state.version.write() = version;
        Ok(())
    }

    fn has_store(&self, name: &str) -> CoreResult<bool> {
        Ok(self.state.stores.read().contains_key(name))
    }

    fn open_store(&self, name: &str) -> CoreResult<Arc<dyn StoreBackend>> {
        let mut stores = self.state.stores.write();
        let state = stores
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(InMemoryBackend::new())));
        Ok(Arc::new(MemoryStoreBackend::new(Arc::clone(state))))
    }

    fn delete_store(&self, name: &str) -> CoreResult<()> {
        self.state.stores.write().remove(name);
        Ok(())
    }

    fn begin_write(&self) -> CoreResult<Box<dyn WriteScope>> {
        Ok(Box::new(MemoryWriteScope {
            state: Arc::clone(&self.state),
            staged: Vec::new(),
        }))
    }

    fn close(&self) -> CoreResult<()> {
        Ok(())
    }

    fn destroy(&self) -> CoreResult<()> {
        self.state.stores.write().clear();
        *self.state.version.write() = 0;
        Ok(())
    }
}

/// Write scope staging batches per store; commit installs them in one
/// pass while holding the store map.
struct MemoryWriteScope {
    state: Arc<MemoryDbState>,
    staged: Vec<(String, FlushBatch)>,
}

impl WriteScope for MemoryWriteScope {
    fn stage(&mut self, store: &str, batch: FlushBatch) -> CoreResult<()> {
        self.staged.push((store.to_string(), batch));
        Ok(())
    }

    fn commit(self: Box<Self>) -> CoreResult<()> {
        let stores = self.state.stores.read();
        for (name, batch) in &self.staged {
            let store = stores
                .get(name)
                .ok_or_else(|| CoreError::backend(format!("store '{name}' vanished"), false))?;
            store.write().apply(batch)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jungledb_codec::KeyPath;

    fn record(n: i64) -> Value {
        Value::map(vec![("val", Value::Integer(n))])
    }

    #[test]
    fn put_get_remove() {
        let mut backend = InMemoryBackend::new();
        backend.put("a", record(1)).unwrap();
        assert_eq!(backend.get("a"), Some(&record(1)));
        assert_eq!(backend.remove("a"), Some(record(1)));
        assert_eq!(backend.get("a"), None);
    }

    #[test]
    fn put_updates_indices() {
        let descriptor = IndexDescriptor::new("val_idx", KeyPath::new("val"));
        let mut backend = InMemoryBackend::with_indices([&descriptor]);
        backend.put("a", record(1)).unwrap();
        backend.put("a", record(2)).unwrap();

        let index = backend.index("val_idx").unwrap();
        assert!(index.keys(Some(&KeyRange::only(Value::Integer(1))), None).is_empty());
        assert!(index
            .keys(Some(&KeyRange::only(Value::Integer(2))), None)
            .contains("a"));
    }

    #[test]
    fn unique_violation_leaves_backend_unchanged() {
        let descriptor = IndexDescriptor::new("val_idx", KeyPath::new("val")).unique();
        let mut backend = InMemoryBackend::with_indices([&descriptor]);
        backend.put("a", record(1)).unwrap();

        let err = backend.put("b", record(1)).unwrap_err();
        assert!(matches!(err, CoreError::UniquenessViolation { .. }));
        assert_eq!(backend.get("b"), None);
        assert_eq!(backend.len(), 1);
    }

    #[test]
    fn create_index_backfills_live_records() {
        let mut backend = InMemoryBackend::new();
        backend.put("a", record(1)).unwrap();
        backend.put("b", record(2)).unwrap();

        let descriptor = IndexDescriptor::new("val_idx", KeyPath::new("val"));
        assert!(backend.create_index(&descriptor).unwrap());
        assert!(!backend.create_index(&descriptor).unwrap());

        let index = backend.index("val_idx").unwrap();
        assert_eq!(index.count(None), 2);
    }

    #[test]
    fn truncate_clears_records_and_indices() {
        let descriptor = IndexDescriptor::new("val_idx", KeyPath::new("val"));
        let mut backend = InMemoryBackend::with_indices([&descriptor]);
        backend.put("a", record(1)).unwrap();
        backend.truncate();

        assert!(backend.is_empty());
        assert_eq!(backend.index("val_idx").unwrap().count(None), 0);
    }

    #[test]
    fn apply_batch() {
        let mut backend = InMemoryBackend::new();
        backend.put("stale", record(0)).unwrap();

        let batch = FlushBatch {
            truncated: false,
            writes: vec![("a".to_string(), record(1))],
            removals: vec!["stale".to_string()],
        };
        backend.apply(&batch).unwrap();
        assert_eq!(backend.get("stale"), None);
        assert_eq!(backend.get("a"), Some(&record(1)));
    }

    #[test]
    fn store_cursor_reseeks() {
        let state = Arc::new(RwLock::new(InMemoryBackend::new()));
        for key in ["b", "a", "c"] {
            state.write().put(key, record(1)).unwrap();
        }
        let backend = MemoryStoreBackend::new(state);
        let mut cursor = backend.cursor(None, true).unwrap();
        let mut seen = Vec::new();
        while let Some((key, _)) = cursor.next().unwrap() {
            seen.push(key);
        }
        assert_eq!(seen, vec!["a", "b", "c"]);

        let range = KeyRange::upper_bound("b".to_string(), true);
        let mut cursor = backend.cursor(Some(&range), false).unwrap();
        assert_eq!(cursor.next().unwrap().map(|(k, _)| k), Some("a".to_string()));
        assert_eq!(cursor.next().unwrap(), None);
    }

    #[test]
    fn database_backend_reopens_same_store() {
        let db = MemoryDatabaseBackend::new();
        let store = db.open_store("accounts").unwrap();
        let mut scope = db.begin_write().unwrap();
        scope
            .stage(
                "accounts",
                FlushBatch {
                    truncated: false,
                    writes: vec![("a".to_string(), record(1))],
                    removals: vec![],
                },
            )
            .unwrap();
        scope.commit().unwrap();

        assert_eq!(store.get("a").unwrap(), Some(record(1)));
        let reopened = db.open_store("accounts").unwrap();
        assert_eq!(reopened.get("a").unwrap(), Some(record(1)));
    }

    #[test]
    fn scope_spans_stores() {
        let db = MemoryDatabaseBackend::new();
        let st1 = db.open_store("st1").unwrap();
        let st2 = db.open_store("st2").unwrap();

        let mut scope = db.begin_write().unwrap();
        for name in ["st1", "st2"] {
            scope
                .stage(
                    name,
                    FlushBatch {
                        truncated: false,
                        writes: vec![("k".to_string(), record(1))],
                        removals: vec![],
                    },
                )
                .unwrap();
        }
        scope.commit().unwrap();
        assert_eq!(st1.get("k").unwrap(), Some(record(1)));
        assert_eq!(st2.get("k").unwrap(), Some(record(1)));
    }

    #[test]
    fn destroy_clears_everything() {
        let db = MemoryDatabaseBackend::new();
        db.open_store("st").unwrap();
        db.set_version(3).unwrap();
        db.destroy().unwrap();
        assert!(!db.has_store("st").unwrap());
        assert_eq!(db.version().unwrap(), 0);
    }
}
