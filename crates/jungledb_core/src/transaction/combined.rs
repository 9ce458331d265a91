//! Atomic commit across object stores.
//!
//! A combined commit validates and commits a set of transactions from
//! distinct object stores of one database as a unit, then performs a
//! single cross-store flush: one write scope per database backend, all
//! batches staged, then installed together. Participants that cannot
//! flush yet (a reader pins an older layer in their store) stay on their
//! chains carrying the coordinator as a dependency; whoever releases the
//! last pin re-triggers the flush.

use crate::error::{CoreError, CoreResult};
use crate::store::{EntryKind, Layer, StoreInner, TxId};
use crate::transaction::{Transaction, TransactionState};
use parking_lot::MutexGuard;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Coordinator for one combined commit.
///
/// Exists from the moment the participants commit until the cross-store
/// flush completes.
pub(crate) struct CombinedCommit {
    participants: Vec<(Arc<StoreInner>, TxId)>,
    done: AtomicBool,
}

impl CombinedCommit {
    /// Attempts the cross-store flush. A no-op until every participant
    /// sits at the bottom of its store's chain with no reader pinning an
    /// older layer.
    pub(crate) fn try_flush(self: &Arc<Self>) -> CoreResult<()> {
        if self.done.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut order: Vec<usize> = (0..self.participants.len()).collect();
        order.sort_by_key(|&i| Arc::as_ptr(&self.participants[i].0) as usize);
        let mut guards: Vec<(usize, MutexGuard<'_, crate::store::StoreState>)> = order
            .iter()
            .map(|&i| (i, self.participants[i].0.state.lock()))
            .collect();
        if self.done.load(Ordering::Acquire) {
            return Ok(());
        }

        // Drain plain bottoms below the participants first; coordinators
        // of unrelated combined commits found there get notified after
        // the locks drop.
        let mut wake = Vec::new();
        for (i, guard) in &mut guards {
            let store = &self.participants[*i].0;
            wake.extend(
                store
                    .flatten_locked(guard)?
                    .into_iter()
                    .filter(|dep| !Arc::ptr_eq(dep, self)),
            );
        }

        let ready = guards.iter().all(|(i, guard)| {
            let tx = self.participants[*i].1;
            guard.backend_refs == 0
                && guard.chain.front() == Some(&tx)
                && guard
                    .txns
                    .get(&tx)
                    .is_some_and(|e| e.state == TransactionState::Committed)
        });
        if !ready {
            drop(guards);
            for dep in wake {
                dep.try_flush()?;
            }
            return Ok(());
        }

        // One write scope per database backend covers every store it
        // owns; scopes commit back to back once all batches are staged.
        let mut scopes: Vec<(usize, Box<dyn crate::backend::WriteScope>)> = Vec::new();
        for (i, guard) in &guards {
            let (store, tx) = &self.participants[*i];
            let db_backend = guard
                .db_backend
                .clone()
                .ok_or_else(|| CoreError::invalid_operation("store has no database backend"))?;
            let key = Arc::as_ptr(&db_backend) as *const () as usize;
            let batch = store.build_batch(&guard.txns[tx]);
            match scopes.iter_mut().find(|(k, _)| *k == key) {
                Some((_, scope)) => scope.stage(&store.name, batch)?,
                None => {
                    let mut scope = db_backend.begin_write()?;
                    scope.stage(&store.name, batch)?;
                    scopes.push((key, scope));
                }
            }
        }
        for (_, scope) in scopes {
            scope.commit()?;
        }

        for (i, guard) in &mut guards {
            let (store, tx) = &self.participants[*i];
            store.finish_flush(guard, *tx);
            wake.extend(
                store
                    .flatten_locked(guard)?
                    .into_iter()
                    .filter(|dep| !Arc::ptr_eq(dep, self)),
            );
        }
        self.done.store(true, Ordering::Release);
        tracing::debug!(
            stores = self.participants.len(),
            "combined transaction flushed"
        );
        drop(guards);
        for dep in wake {
            dep.try_flush()?;
        }
        Ok(())
    }
}

/// Atomically commits transactions from distinct object stores of one
/// database.
///
/// Returns `Ok(false)` when any participant lost the optimistic race
/// (that participant becomes `Conflicted`, the rest `Aborted`). A
/// uniqueness violation aborts every participant and surfaces as an
/// error. On success all participants are `Committed` and their deltas
/// become visible together.
pub(crate) fn commit_combined(transactions: &[&Transaction]) -> CoreResult<bool> {
    if transactions.is_empty() {
        return Err(CoreError::invalid_operation(
            "combined commit needs at least one transaction",
        ));
    }
    for (i, a) in transactions.iter().enumerate() {
        for b in &transactions[i + 1..] {
            if Arc::ptr_eq(&a.store, &b.store) {
                return Err(CoreError::invalid_operation(
                    "combined commit cannot take two transactions on one object store",
                ));
            }
        }
    }
    // Volatile stores (no database tag) match any database; everything
    // else must agree on one.
    let mut database: Option<u64> = None;
    for transaction in transactions {
        if let Some(tag) = transaction.store.db_tag {
            match database {
                None => database = Some(tag),
                Some(existing) if existing != tag => {
                    return Err(CoreError::invalid_operation(
                        "combined commit spans multiple databases",
                    ));
                }
                Some(_) => {}
            }
        }
    }

    let mut order: Vec<usize> = (0..transactions.len()).collect();
    order.sort_by_key(|&i| Arc::as_ptr(&transactions[i].store) as usize);
    let mut guards: Vec<(usize, MutexGuard<'_, crate::store::StoreState>)> = order
        .iter()
        .map(|&i| (i, transactions[i].store.state.lock()))
        .collect();

    // Usage preconditions leave the transactions untouched on failure.
    for (i, guard) in &guards {
        let transaction = transactions[*i];
        let entry = guard.txns.get(&transaction.id).ok_or_else(|| {
            CoreError::invalid_operation("combined commit on a transaction that no longer exists")
        })?;
        match entry.kind {
            EntryKind::Transaction { nested: false } => {}
            EntryKind::Transaction { nested: true } => {
                return Err(CoreError::invalid_operation(
                    "combined commit cannot take a nested transaction",
                ));
            }
            EntryKind::Snapshot { .. } => {
                return Err(CoreError::invalid_operation(
                    "combined commit cannot take a snapshot",
                ));
            }
        }
        if entry.state != TransactionState::Open {
            return Err(CoreError::invalid_operation(format!(
                "combined commit on a {:?} transaction",
                entry.state
            )));
        }
    }

    // Optimistic conflicts: the losing participant ends Conflicted, the
    // rest are aborted, and nothing is applied.
    let conflicted: Vec<usize> = guards
        .iter()
        .filter(|(i, guard)| guard.txns[&transactions[*i].id].parent != guard.head)
        .map(|(i, _)| *i)
        .collect();
    if !conflicted.is_empty() {
        let mut wake = Vec::new();
        for (i, guard) in &mut guards {
            let transaction = transactions[*i];
            let final_state = if conflicted.contains(i) {
                TransactionState::Conflicted
            } else {
                TransactionState::Aborted
            };
            wake.extend(
                transaction
                    .store
                    .close_locked(guard, transaction.id, final_state),
            );
        }
        drop(guards);
        for dep in wake {
            dep.try_flush()?;
        }
        return Ok(false);
    }

    // Uniqueness preprocessing across every participant; the first
    // violation aborts them all.
    let mut violation = None;
    for (i, guard) in &guards {
        let transaction = transactions[*i];
        if let Err(err) = transaction
            .store
            .check_unique_locked(guard, transaction.id)
        {
            violation = Some(err);
            break;
        }
    }
    if let Some(err) = violation {
        let mut wake = Vec::new();
        for (i, guard) in &mut guards {
            let transaction = transactions[*i];
            wake.extend(transaction.store.close_locked(
                guard,
                transaction.id,
                TransactionState::Aborted,
            ));
        }
        drop(guards);
        for dep in wake {
            dep.try_flush()?;
        }
        return Err(err);
    }

    // Commit every participant against its store; the shared coordinator
    // keeps them from flushing independently.
    let combined = Arc::new(CombinedCommit {
        participants: transactions
            .iter()
            .map(|t| (Arc::clone(&t.store), t.id))
            .collect(),
        done: AtomicBool::new(false),
    });
    for (i, guard) in &mut guards {
        let transaction = transactions[*i];
        let parent = guard.txns[&transaction.id].parent;
        let entry = guard
            .txns
            .get_mut(&transaction.id)
            .unwrap_or_else(|| unreachable!("participant entry exists"));
        entry.state = TransactionState::Committed;
        entry.on_chain = true;
        entry.dependency = Some(Arc::clone(&combined));
        match parent {
            Layer::Backend => guard.backend_refs = guard.backend_refs.saturating_sub(1),
            Layer::Tx(pid) => {
                if let Some(parent_entry) = guard.txns.get_mut(&pid) {
                    parent_entry.refs = parent_entry.refs.saturating_sub(1);
                }
            }
        }
        guard.chain.push_back(transaction.id);
        guard.head = Layer::Tx(transaction.id);
    }
    drop(guards);

    combined.try_flush()?;
    Ok(true)
}
