//! Secondary indices.
//!
//! An index maps secondary keys (extracted from records by a key path) to
//! the primary keys of the records that contain them. Indices exist in
//! three places: inside the backend ([`IndexReader`] adapters), inside
//! every transaction's delta buffer ([`InMemoryIndex`]), and as the merged
//! overlay a transaction exposes to readers ([`view::IndexView`]).

mod handle;
mod memory;
pub(crate) mod view;

pub use handle::IndexHandle;
pub use memory::InMemoryIndex;

use crate::database::UpgradeCondition;
use crate::error::CoreResult;
use crate::keyrange::KeyRange;
use jungledb_codec::{KeyPath, Value};
use std::collections::BTreeSet;

/// Describes a secondary index.
#[derive(Debug, Clone)]
pub struct IndexDescriptor {
    /// Index name, unique within its object store.
    pub name: String,
    /// Path extracting the secondary key from a record.
    pub key_path: KeyPath,
    /// Whether an array secondary key indexes each element separately.
    pub multi_entry: bool,
    /// Whether each secondary key maps to at most one primary key.
    pub unique: bool,
}

impl IndexDescriptor {
    /// Creates a descriptor with `multi_entry` and `unique` off.
    pub fn new(name: impl Into<String>, key_path: impl Into<KeyPath>) -> Self {
        Self {
            name: name.into(),
            key_path: key_path.into(),
            multi_entry: false,
            unique: false,
        }
    }

    /// Enables multi-entry indexing.
    #[must_use]
    pub fn multi_entry(mut self) -> Self {
        self.multi_entry = true;
        self
    }

    /// Enforces uniqueness of secondary keys.
    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// Options accepted by `create_index`.
#[derive(Debug, Clone, Default)]
pub struct IndexOptions {
    /// Whether an array secondary key indexes each element separately.
    pub multi_entry: bool,
    /// Whether each secondary key maps to at most one primary key.
    pub unique: bool,
    /// When the backfill is applied on a version bump.
    pub upgrade_condition: UpgradeCondition,
}

impl IndexOptions {
    /// Enables multi-entry indexing.
    #[must_use]
    pub fn multi_entry(mut self, value: bool) -> Self {
        self.multi_entry = value;
        self
    }

    /// Enforces uniqueness of secondary keys.
    #[must_use]
    pub fn unique(mut self, value: bool) -> Self {
        self.unique = value;
        self
    }

    /// Sets the upgrade condition.
    #[must_use]
    pub fn upgrade_condition(mut self, condition: UpgradeCondition) -> Self {
        self.upgrade_condition = condition;
        self
    }
}

/// Read surface every backend index adapter implements.
///
/// The engine only consumes this contract; persistent backends bring
/// their own implementations. Iteration order is by secondary key first,
/// primary key second.
pub trait IndexReader: Send + Sync {
    /// The descriptor this index was created from.
    fn descriptor(&self) -> CoreResult<IndexDescriptor>;

    /// Primary keys of all records whose secondary key falls in `range`.
    fn keys(&self, range: Option<&KeyRange<Value>>) -> CoreResult<BTreeSet<String>>;

    /// A cursor over `(secondary, primary)` pairs inside `range`.
    fn cursor(
        &self,
        range: Option<&KeyRange<Value>>,
        ascending: bool,
    ) -> CoreResult<Box<dyn IndexCursor>>;
}

/// Pull cursor over `(secondary, primary)` pairs.
pub trait IndexCursor {
    /// The next pair, or `None` when exhausted.
    fn next(&mut self) -> CoreResult<Option<(Value, String)>>;
}
