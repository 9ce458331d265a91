//! # JungleDB Core
//!
//! An embedded, transactional key/value engine with secondary indices,
//! layered optimistic transactions and atomic multi-store commits.
//!
//! The crate provides:
//! - [`Database`] - the IndexedDB-shaped facade: versioned stores,
//!   upgrade conditions, connect/close/destroy
//! - [`ObjectStore`] - reads, implicit writes, transactions, snapshots
//!   and secondary indices over a pluggable backend
//! - [`Transaction`] - snapshot-isolated, optimistic, nestable mutation
//!   layers with conflict detection on commit
//! - [`Database::commit_combined`] - all-or-nothing commit across
//!   several stores of one database
//! - The backend contracts persistent adapters implement
//!   ([`backend::StoreBackend`], [`backend::DatabaseBackend`]), plus the
//!   in-memory implementation used for volatile stores and as every
//!   transaction's delta buffer
//!
//! ## Example
//!
//! ```rust,ignore
//! use jungledb_core::{Database, IndexOptions, ObjectStoreConfig};
//! use jungledb_codec::Value;
//!
//! let mut db = Database::volatile(1);
//! let users = db.create_object_store("users", ObjectStoreConfig::default())?;
//! users.create_index("age", "age", IndexOptions::default())?;
//! db.connect()?;
//!
//! let tx = users.transaction()?;
//! tx.put("alice", Value::map(vec![("age", Value::Integer(30))]))?;
//! assert!(tx.commit()?);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
mod database;
mod error;
mod index;
mod keyrange;
mod query;
mod store;
mod synchronizer;
mod transaction;
mod tree;

pub use database::{Database, ObjectStoreConfig, UpgradeCondition};
pub use error::{CoreError, CoreResult};
pub use index::{IndexCursor, IndexDescriptor, IndexHandle, IndexOptions, IndexReader, InMemoryIndex};
pub use keyrange::KeyRange;
pub use query::{Query, Selector};
pub use store::ObjectStore;
pub use synchronizer::Synchronizer;
pub use transaction::{Snapshot, Transaction, TransactionState};
pub use tree::{BTree, Cursor, RangeIter, SeekBias};

pub use jungledb_codec::{KeyPath, Value};
