//! Backend contracts.
//!
//! The engine is backend-agnostic: everything a persistent adapter (LSM,
//! memory-mapped B-tree) must provide is defined here and consumed by
//! the object-store layer. Backends are **record stores**: they hold
//! `(primary key, value)` pairs plus the persistent side of every
//! declared index, and they promise all-or-nothing application of write
//! scopes across the stores of one database.

mod memory;

pub use memory::{InMemoryBackend, MemoryDatabaseBackend};

use crate::error::CoreResult;
use crate::index::{IndexDescriptor, IndexReader};
use crate::keyrange::KeyRange;
use jungledb_codec::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

/// The deltas of one committed transaction, ready to be applied.
#[derive(Debug, Clone, Default)]
pub struct FlushBatch {
    /// Whether the store is cleared before the writes are applied.
    pub truncated: bool,
    /// Records written, in primary-key order.
    pub writes: Vec<(String, Value)>,
    /// Primary keys removed.
    pub removals: Vec<String>,
}

impl FlushBatch {
    /// Whether the batch changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.truncated && self.writes.is_empty() && self.removals.is_empty()
    }
}

/// Pull cursor over `(primary key, value)` pairs.
pub trait StoreCursor {
    /// The next pair, or `None` when exhausted.
    fn next(&mut self) -> CoreResult<Option<(String, Value)>>;
}

/// Per-store backend contract.
///
/// All methods take `&self`; implementations serialize access
/// internally. Writes never go through this trait directly - they arrive
/// as [`FlushBatch`]es staged on a [`WriteScope`].
pub trait StoreBackend: Send + Sync {
    /// Reads the record stored under `key`.
    fn get(&self, key: &str) -> CoreResult<Option<Value>>;

    /// All primary keys inside `range`, in key order.
    fn keys(&self, range: Option<&KeyRange<String>>) -> CoreResult<BTreeSet<String>>;

    /// Number of records inside `range`.
    fn count(&self, range: Option<&KeyRange<String>>) -> CoreResult<usize>;

    /// A streaming cursor over records inside `range`.
    fn cursor(
        &self,
        range: Option<&KeyRange<String>>,
        ascending: bool,
    ) -> CoreResult<Box<dyn StoreCursor>>;

    /// The reader for a named index, if the backend has it.
    fn index(&self, name: &str) -> Option<Arc<dyn IndexReader>>;

    /// Names of the indices the backend currently maintains.
    fn index_names(&self) -> Vec<String>;

    /// Installs an index, backfilling it from all live records. Returns
    /// `false` if an index of that name already existed (left untouched).
    fn ensure_index(&self, descriptor: &IndexDescriptor) -> CoreResult<bool>;

    /// Drops an index. Returns `false` if it did not exist.
    fn drop_index(&self, name: &str) -> CoreResult<bool>;

    /// Removes every record and clears every index.
    fn truncate(&self) -> CoreResult<()>;
}

/// An atomic write scope over the stores of one database.
///
/// Batches are staged per store, then installed all-or-nothing by
/// [`commit`](Self::commit). Dropping an uncommitted scope discards the
/// staged batches.
pub trait WriteScope {
    /// Stages a batch for the named store.
    fn stage(&mut self, store: &str, batch: FlushBatch) -> CoreResult<()>;

    /// Installs every staged batch atomically.
    fn commit(self: Box<Self>) -> CoreResult<()>;
}

/// Per-database backend contract.
///
/// A database backend owns named stores, remembers the schema version it
/// was last opened with, and hands out atomic [`WriteScope`]s spanning
/// its stores.
pub trait DatabaseBackend: Send + Sync {
    /// The version the database was last connected with (0 if new).
    fn version(&self) -> CoreResult<u32>;

    /// Records a new version after a successful upgrade.
    fn set_version(&self, version: u32) -> CoreResult<()>;

    /// Whether a store of this name exists.
    fn has_store(&self, name: &str) -> CoreResult<bool>;

    /// Opens a store, creating it if missing.
    fn open_store(&self, name: &str) -> CoreResult<Arc<dyn StoreBackend>>;

    /// Deletes a store and its data.
    fn delete_store(&self, name: &str) -> CoreResult<()>;

    /// Begins an atomic write scope across this database's stores.
    fn begin_write(&self) -> CoreResult<Box<dyn WriteScope>>;

    /// Releases resources; the backend may be reopened later.
    fn close(&self) -> CoreResult<()>;

    /// Deletes all data irrecoverably.
    fn destroy(&self) -> CoreResult<()>;
}
