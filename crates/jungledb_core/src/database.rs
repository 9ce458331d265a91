//! Database facade.
//!
//! A [`Database`] groups object stores over one [`DatabaseBackend`],
//! drives the connect/upgrade/close lifecycle, and offers the combined
//! cross-store commit. Stores and indices are declared before
//! `connect()`; the connect pass evaluates upgrade conditions against
//! the backend's stored version, creates or drops structure, backfills
//! indices, and finally records the new version.

use crate::backend::{DatabaseBackend, MemoryDatabaseBackend, StoreBackend};
use crate::error::{CoreError, CoreResult};
use crate::store::{next_db_tag, ObjectStore, StoreInner, StoreState};
use crate::synchronizer::Synchronizer;
use crate::transaction::Transaction;
use jungledb_codec::Codec;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Controls whether a structural change applies on a version bump.
///
/// Evaluated only when the database version increases:
/// - `Default` applies the change where the structure is missing (new
///   store, new index) or requested (store deletion).
/// - `Always` forces it even when the structure already exists - an
///   existing store is recreated, an existing index rebuilt.
/// - `Never` suppresses it entirely.
/// - `Func` decides from the old and new version; truthy forces, falsy
///   suppresses.
#[derive(Clone, Default)]
pub enum UpgradeCondition {
    /// Apply where the structure is missing, on any version bump.
    #[default]
    Default,
    /// Force the structural change even if the structure exists.
    Always,
    /// Suppress the structural change even if the structure is missing.
    Never,
    /// Decide from `(old_version, new_version)`.
    Func(Arc<dyn Fn(u32, u32) -> bool + Send + Sync>),
}

impl UpgradeCondition {
    /// `Some(true)` forces, `Some(false)` suppresses, `None` is default.
    pub(crate) fn evaluate(&self, old_version: u32, new_version: u32) -> Option<bool> {
        match self {
            UpgradeCondition::Default => None,
            UpgradeCondition::Always => Some(true),
            UpgradeCondition::Never => Some(false),
            UpgradeCondition::Func(f) => Some(f(old_version, new_version)),
        }
    }
}

impl std::fmt::Debug for UpgradeCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpgradeCondition::Default => write!(f, "Default"),
            UpgradeCondition::Always => write!(f, "Always"),
            UpgradeCondition::Never => write!(f, "Never"),
            UpgradeCondition::Func(_) => write!(f, "Func(..)"),
        }
    }
}

/// Options accepted by [`Database::create_object_store`].
#[derive(Clone, Default)]
pub struct ObjectStoreConfig {
    /// `false` keeps the store's data in memory even when the database
    /// backend is persistent; such a store starts empty on every
    /// connect.
    pub volatile: bool,
    /// Codec handed to persistent backend adapters for record
    /// serialization. The in-memory backend ignores it.
    pub codec: Option<Arc<dyn Codec>>,
    /// When store creation applies on a version bump.
    pub upgrade_condition: UpgradeCondition,
}

impl ObjectStoreConfig {
    /// Keeps the store's data in memory regardless of the database
    /// backend.
    #[must_use]
    pub fn volatile(mut self, value: bool) -> Self {
        self.volatile = value;
        self
    }

    /// Sets the codec for persistent backend adapters.
    #[must_use]
    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Sets the upgrade condition for store creation.
    #[must_use]
    pub fn upgrade_condition(mut self, condition: UpgradeCondition) -> Self {
        self.upgrade_condition = condition;
        self
    }
}

impl std::fmt::Debug for ObjectStoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStoreConfig")
            .field("volatile", &self.volatile)
            .field("has_codec", &self.codec.is_some())
            .field("upgrade_condition", &self.upgrade_condition)
            .finish()
    }
}

/// An embedded, transactional key/value database with secondary indices.
pub struct Database {
    backend: Arc<dyn DatabaseBackend>,
    version: u32,
    tag: u64,
    on_upgrade: Option<Box<dyn Fn(u32, u32) + Send + Sync>>,
    connected: bool,
    closed: bool,
    stores: HashMap<String, (ObjectStore, ObjectStoreConfig)>,
    pending_deletes: Vec<(String, UpgradeCondition)>,
}

impl Database {
    /// Creates a volatile database: all stores live in memory.
    #[must_use]
    pub fn volatile(version: u32) -> Self {
        Self::with_backend(Arc::new(MemoryDatabaseBackend::new()), version)
    }

    /// Creates a database over the given backend.
    #[must_use]
    pub fn with_backend(backend: Arc<dyn DatabaseBackend>, version: u32) -> Self {
        Self {
            backend,
            version,
            tag: next_db_tag(),
            on_upgrade: None,
            connected: false,
            closed: false,
            stores: HashMap::new(),
            pending_deletes: Vec::new(),
        }
    }

    /// Installs a callback invoked on a version bump during
    /// [`connect`](Self::connect), after the structural changes applied.
    #[must_use]
    pub fn on_upgrade_needed(mut self, callback: impl Fn(u32, u32) + Send + Sync + 'static) -> Self {
        self.on_upgrade = Some(Box::new(callback));
        self
    }

    /// Declares an object store. Must happen before `connect`.
    ///
    /// The returned handle accepts index declarations immediately but
    /// serves reads and writes only once connected.
    pub fn create_object_store(
        &mut self,
        name: impl Into<String>,
        config: ObjectStoreConfig,
    ) -> CoreResult<ObjectStore> {
        let name = name.into();
        self.ensure_editable()?;
        if self.stores.contains_key(&name) {
            return Err(CoreError::schema(format!(
                "object store '{name}' already declared"
            )));
        }
        let inner = Arc::new(StoreInner {
            name: name.clone(),
            db_tag: Some(self.tag),
            codec: config.codec.clone(),
            sync: Synchronizer::new(),
            state: Mutex::new(StoreState {
                backend: None,
                db_backend: None,
                indices: Vec::new(),
                declared: Vec::new(),
                txns: HashMap::new(),
                chain: VecDeque::new(),
                head: crate::store::Layer::Backend,
                backend_refs: 0,
                next_tx: 1,
            }),
        });
        let store = ObjectStore::with_inner(inner);
        self.stores
            .insert(name, (store.clone(), config));
        Ok(store)
    }

    /// Schedules a store deletion, applied on the next version bump.
    pub fn delete_object_store(
        &mut self,
        name: impl Into<String>,
        condition: UpgradeCondition,
    ) -> CoreResult<()> {
        self.ensure_editable()?;
        self.pending_deletes.push((name.into(), condition));
        Ok(())
    }

    /// The declared store of that name, if any.
    #[must_use]
    pub fn object_store(&self, name: &str) -> Option<ObjectStore> {
        self.stores.get(name).map(|(store, _)| store.clone())
    }

    /// Connects the database: applies the upgrade plan and wires every
    /// declared store to its backend.
    pub fn connect(&mut self) -> CoreResult<()> {
        self.ensure_editable()?;
        if self.version == 0 {
            return Err(CoreError::invalid_operation("database version must be >= 1"));
        }
        let old_version = self.backend.version()?;
        let new_version = self.version;
        if new_version < old_version {
            return Err(CoreError::schema(format!(
                "cannot downgrade database from version {old_version} to {new_version}"
            )));
        }
        let bump = new_version > old_version;
        tracing::debug!(old_version, new_version, "connecting database");

        if !bump && !self.pending_deletes.is_empty() {
            return Err(CoreError::schema(
                "deleting an object store requires a version bump",
            ));
        }
        for (name, condition) in std::mem::take(&mut self.pending_deletes) {
            let exists = self.backend.has_store(&name)?;
            let apply = condition.evaluate(old_version, new_version).unwrap_or(exists);
            if apply {
                tracing::debug!(store = %name, "dropping object store");
                self.backend.delete_store(&name)?;
            }
        }

        let mut names: Vec<String> = self.stores.keys().cloned().collect();
        names.sort();
        for name in names {
            let (store, config) = &self.stores[&name];
            let store = store.clone();
            let config = config.clone();
            self.connect_store(&store, &config, old_version, new_version, bump)?;
        }

        if bump {
            if let Some(callback) = &self.on_upgrade {
                callback(old_version, new_version);
            }
        }
        self.backend.set_version(new_version)?;
        self.connected = true;
        Ok(())
    }

    fn connect_store(
        &self,
        store: &ObjectStore,
        config: &ObjectStoreConfig,
        old_version: u32,
        new_version: u32,
        bump: bool,
    ) -> CoreResult<()> {
        let name = store.name().to_string();
        let mut state = store.inner.state.lock();
        let exists = !config.volatile && self.backend.has_store(&name)?;
        let forced = config.upgrade_condition.evaluate(old_version, new_version);

        if !exists && !config.volatile {
            if !bump {
                return Err(CoreError::schema(format!(
                    "object store '{name}' does not exist and no version bump was requested"
                )));
            }
            if forced == Some(false) {
                // Creation suppressed; the store stays unconnected.
                return Ok(());
            }
        }

        let (backend_store, db_backend): (Arc<dyn StoreBackend>, Arc<dyn DatabaseBackend>) =
            if config.volatile {
                let local = MemoryDatabaseBackend::new();
                (local.open_store(&name)?, Arc::new(local))
            } else {
                (self.backend.open_store(&name)?, Arc::clone(&self.backend))
            };
        if exists && bump && forced == Some(true) {
            tracing::debug!(store = %name, "recreating object store on upgrade");
            backend_store.truncate()?;
        }

        for (descriptor, condition) in std::mem::take(&mut state.declared) {
            let have = backend_store.index(&descriptor.name).is_some();
            let forced = condition.evaluate(old_version, new_version);
            if have {
                if bump && forced == Some(true) {
                    tracing::debug!(store = %name, index = %descriptor.name, "rebuilding index");
                    backend_store.drop_index(&descriptor.name)?;
                    backend_store.ensure_index(&descriptor)?;
                }
                state.indices.push(descriptor);
            } else {
                // A volatile store rebuilds its structure on every
                // connect; only persisted stores demand a bump here.
                if !bump && !config.volatile {
                    return Err(CoreError::schema(format!(
                        "index '{}' on store '{name}' does not exist and no version bump was requested",
                        descriptor.name
                    )));
                }
                if forced == Some(false) {
                    continue;
                }
                tracing::debug!(store = %name, index = %descriptor.name, "backfilling index");
                backend_store.ensure_index(&descriptor)?;
                state.indices.push(descriptor);
            }
        }

        state.backend = Some(backend_store);
        state.db_backend = Some(db_backend);
        Ok(())
    }

    /// Flushes what can be flushed and disconnects every store. The
    /// database cannot be reused afterwards; reopen the backend with a
    /// fresh `Database`.
    pub fn close(&mut self) -> CoreResult<()> {
        if self.closed {
            return Ok(());
        }
        for (store, _) in self.stores.values() {
            let mut state = store.inner.state.lock();
            let _ = store.inner.flatten_locked(&mut state);
            state.backend = None;
            state.db_backend = None;
        }
        self.backend.close()?;
        self.connected = false;
        self.closed = true;
        Ok(())
    }

    /// Closes the database and deletes all of its data.
    pub fn destroy(&mut self) -> CoreResult<()> {
        self.close()?;
        self.backend.destroy()
    }

    /// Atomically commits transactions from distinct object stores of
    /// this (or any single) database.
    ///
    /// See [`Transaction::commit`] for the per-participant semantics;
    /// either every participant commits and its deltas become visible,
    /// or none do.
    pub fn commit_combined(transactions: &[&Transaction]) -> CoreResult<bool> {
        crate::transaction::combined::commit_combined(transactions)
    }

    /// Creates a standalone volatile object store that belongs to no
    /// particular database.
    #[must_use]
    pub fn create_volatile_object_store(codec: Option<Arc<dyn Codec>>) -> ObjectStore {
        ObjectStore::volatile(codec)
    }

    fn ensure_editable(&self) -> CoreResult<()> {
        if self.closed {
            return Err(CoreError::invalid_operation("database is closed"));
        }
        if self.connected {
            return Err(CoreError::schema(
                "structural changes require a disconnected database",
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("version", &self.version)
            .field("connected", &self.connected)
            .field("stores", &self.stores.len())
            .finish()
    }
}
