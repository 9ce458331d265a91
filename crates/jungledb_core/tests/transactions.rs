//! Transaction isolation, conflicts, nesting and snapshots.

use jungledb_core::{
    CoreError, Database, KeyRange, ObjectStore, TransactionState, Value,
};

fn store() -> ObjectStore {
    Database::create_volatile_object_store(None)
}

fn filled_store() -> ObjectStore {
    let store = store();
    for i in 0..10 {
        store
            .put(&format!("key{i}"), Value::from(format!("value{i}")))
            .unwrap();
    }
    store
}

#[test]
fn read_your_writes() {
    let store = store();
    let tx = store.transaction().unwrap();

    tx.put("k", Value::from("v")).unwrap();
    assert_eq!(tx.get("k").unwrap(), Some(Value::from("v")));

    tx.remove("k").unwrap();
    assert_eq!(tx.get("k").unwrap(), None);
}

#[test]
fn snapshot_isolation_and_conflict() {
    let store = filled_store();

    let tx1 = store.transaction().unwrap();
    let tx2 = store.transaction().unwrap();

    tx1.remove("key0").unwrap();
    tx1.put("test", Value::from("success")).unwrap();
    assert!(tx1.commit().unwrap());

    // tx2 still sees its creation-time snapshot.
    assert_eq!(tx2.get("key0").unwrap(), Some(Value::from("value0")));
    assert_eq!(tx2.get("test").unwrap(), None);

    assert!(!tx2.commit().unwrap());
    assert_eq!(tx2.state(), TransactionState::Conflicted);

    // The committed transaction's deltas are visible on the store.
    assert_eq!(store.get("key0").unwrap(), None);
    assert_eq!(store.get("test").unwrap(), Some(Value::from("success")));
}

#[test]
fn writes_after_sibling_creation_stay_invisible() {
    let store = filled_store();
    let tx2 = store.transaction().unwrap();

    // A whole committed sibling happens while tx2 is open.
    let tx1 = store.transaction().unwrap();
    tx1.put("key3", Value::from("rewritten")).unwrap();
    assert!(tx1.commit().unwrap());

    assert_eq!(tx2.get("key3").unwrap(), Some(Value::from("value3")));
    assert_eq!(
        tx2.keys(None, None).unwrap().len(),
        10,
        "sibling writes must not leak into an open snapshot"
    );
}

#[test]
fn at_most_one_commit_per_parent() {
    let store = filled_store();
    let txs: Vec<_> = (0..3).map(|_| store.transaction().unwrap()).collect();
    for (i, tx) in txs.iter().enumerate() {
        tx.put(&format!("sibling{i}"), Value::Integer(i as i64))
            .unwrap();
    }

    assert!(txs[1].commit().unwrap());
    assert!(!txs[0].commit().unwrap());
    assert!(!txs[2].commit().unwrap());

    assert_eq!(txs[1].state(), TransactionState::Flushed);
    assert_eq!(txs[0].state(), TransactionState::Conflicted);
    assert_eq!(txs[2].state(), TransactionState::Conflicted);

    assert!(store.get("sibling1").unwrap().is_some());
    assert!(store.get("sibling0").unwrap().is_none());
    assert!(store.get("sibling2").unwrap().is_none());
}

#[test]
fn ordered_range_scans() {
    let store = store();
    for i in 0..4 {
        store
            .put(
                &format!("test{i}"),
                Value::map(vec![("v", Value::Integer(i))]),
            )
            .unwrap();
    }

    let upper = KeyRange::upper_bound("test1".to_string(), false);
    let values = store.values(Some(&upper.clone().into()), None).unwrap();
    let v: Vec<i64> = values
        .iter()
        .map(|r| r.attribute("v").and_then(Value::as_integer).unwrap())
        .collect();
    assert_eq!(v, vec![0, 1]);

    let lower = KeyRange::lower_bound("test2".to_string(), false);
    let keys = store.keys(Some(&lower.into()), None).unwrap();
    assert_eq!(keys.into_iter().collect::<Vec<_>>(), vec!["test2", "test3"]);
}

#[test]
fn abort_discards_buffered_changes() {
    let store = filled_store();
    let tx = store.transaction().unwrap();
    tx.put("key0", Value::from("changed")).unwrap();
    tx.remove("key1").unwrap();
    tx.abort().unwrap();

    assert_eq!(tx.state(), TransactionState::Aborted);
    assert_eq!(store.get("key0").unwrap(), Some(Value::from("value0")));
    assert!(store.get("key1").unwrap().is_some());

    assert!(matches!(
        tx.commit(),
        Err(CoreError::InvalidOperation { .. })
    ));
}

#[test]
fn dropping_an_open_transaction_aborts_it() {
    let store = filled_store();
    {
        let tx = store.transaction().unwrap();
        tx.put("key0", Value::from("changed")).unwrap();
    }
    assert_eq!(store.get("key0").unwrap(), Some(Value::from("value0")));

    // The dropped sibling no longer blocks later commits.
    let tx = store.transaction().unwrap();
    tx.put("after", Value::from("drop")).unwrap();
    assert!(tx.commit().unwrap());
    assert!(store.get("after").unwrap().is_some());
}

#[test]
fn nested_child_sees_parent_and_merges_on_commit() {
    let store = store();
    let parent = store.transaction().unwrap();
    parent.put("a", Value::Integer(1)).unwrap();

    let child = parent.transaction().unwrap();
    assert_eq!(parent.state(), TransactionState::Nested);
    assert!(matches!(
        parent.put("blocked", Value::Integer(0)),
        Err(CoreError::InvalidOperation { .. })
    ));

    assert_eq!(child.get("a").unwrap(), Some(Value::Integer(1)));
    child.put("b", Value::Integer(2)).unwrap();
    child.remove("a").unwrap();
    assert!(child.commit().unwrap());

    // Parent is writable again and carries the merged deltas.
    assert_eq!(parent.state(), TransactionState::Open);
    assert_eq!(parent.get("a").unwrap(), None);
    assert_eq!(parent.get("b").unwrap(), Some(Value::Integer(2)));

    assert!(parent.commit().unwrap());
    assert_eq!(store.get("a").unwrap(), None);
    assert_eq!(store.get("b").unwrap(), Some(Value::Integer(2)));
}

#[test]
fn nested_child_abort_restores_parent() {
    let store = store();
    let parent = store.transaction().unwrap();
    parent.put("a", Value::Integer(1)).unwrap();

    let child = parent.transaction().unwrap();
    child.put("b", Value::Integer(2)).unwrap();
    child.abort().unwrap();

    assert_eq!(parent.state(), TransactionState::Open);
    assert_eq!(parent.get("b").unwrap(), None);
    assert_eq!(parent.get("a").unwrap(), Some(Value::Integer(1)));
    parent.put("c", Value::Integer(3)).unwrap();
    assert!(parent.commit().unwrap());
}

#[test]
fn nested_merge_equals_flat_application() {
    let flat = store();
    let layered = store();
    for s in [&flat, &layered] {
        s.put("x", Value::Integer(0)).unwrap();
        s.put("y", Value::Integer(0)).unwrap();
    }

    // Flat: one transaction applies both rounds of changes.
    let tx = flat.transaction().unwrap();
    tx.put("x", Value::Integer(1)).unwrap();
    tx.remove("y").unwrap();
    tx.put("z", Value::Integer(2)).unwrap();
    assert!(tx.commit().unwrap());

    // Layered: the parent does round one, a child does round two.
    let parent = layered.transaction().unwrap();
    parent.put("x", Value::Integer(1)).unwrap();
    let child = parent.transaction().unwrap();
    child.remove("y").unwrap();
    child.put("z", Value::Integer(2)).unwrap();
    assert!(child.commit().unwrap());
    assert!(parent.commit().unwrap());

    assert_eq!(flat.keys(None, None).unwrap(), layered.keys(None, None).unwrap());
    for key in ["x", "y", "z"] {
        assert_eq!(flat.get(key).unwrap(), layered.get(key).unwrap());
    }
}

#[test]
fn truncate_inside_a_transaction() {
    let store = filled_store();
    let tx = store.transaction().unwrap();
    tx.truncate().unwrap();

    assert_eq!(tx.get("key0").unwrap(), None);
    assert_eq!(tx.count(None).unwrap(), 0);
    tx.put("fresh", Value::Integer(1)).unwrap();
    assert_eq!(tx.count(None).unwrap(), 1);

    // The store keeps its contents until the commit lands.
    assert_eq!(store.count(None).unwrap(), 10);
    assert!(tx.commit().unwrap());
    assert_eq!(store.count(None).unwrap(), 1);
    assert_eq!(store.get("fresh").unwrap(), Some(Value::Integer(1)));
}

#[test]
fn store_snapshot_pins_committed_state() {
    let store = filled_store();
    let snapshot = store.snapshot().unwrap();

    store.put("key0", Value::from("changed")).unwrap();
    store.remove("key1").unwrap();

    assert_eq!(snapshot.get("key0").unwrap(), Some(Value::from("value0")));
    assert!(snapshot.get("key1").unwrap().is_some());
    assert_eq!(snapshot.count(None).unwrap(), 10);

    snapshot.abort().unwrap();
    assert!(matches!(
        snapshot.get("key0"),
        Err(CoreError::InvalidOperation { .. })
    ));
    assert_eq!(store.get("key0").unwrap(), Some(Value::from("changed")));
}

#[test]
fn transaction_snapshot_is_detached() {
    let store = filled_store();
    let tx = store.transaction().unwrap();
    tx.put("extra", Value::Integer(42)).unwrap();

    let snapshot = tx.snapshot().unwrap();
    tx.abort().unwrap();

    // The materialized view survives the transaction it came from.
    assert_eq!(snapshot.get("extra").unwrap(), Some(Value::Integer(42)));
    assert_eq!(snapshot.count(None).unwrap(), 11);
    assert_eq!(store.get("extra").unwrap(), None);
}

#[test]
fn min_max_and_streams() {
    let store = store();
    for key in ["banana", "apple", "cherry"] {
        store.put(key, Value::from(key)).unwrap();
    }

    assert_eq!(store.min_key(None).unwrap(), Some("apple".to_string()));
    assert_eq!(store.max_key(None).unwrap(), Some("cherry".to_string()));
    assert_eq!(store.min_value(None).unwrap(), Some(Value::from("apple")));
    assert_eq!(store.max_value(None).unwrap(), Some(Value::from("cherry")));

    let range = KeyRange::upper_bound("banana".to_string(), true);
    assert_eq!(store.max_key(Some(&range)).unwrap(), Some("apple".to_string()));

    let mut visited = Vec::new();
    store
        .key_stream(
            |key| {
                visited.push(key.to_string());
                true
            },
            false,
            None,
        )
        .unwrap();
    assert_eq!(visited, vec!["cherry", "banana", "apple"]);

    let mut first = None;
    store
        .value_stream(
            |value, key| {
                first = Some((key.to_string(), value.clone()));
                false
            },
            true,
            None,
        )
        .unwrap();
    assert_eq!(first, Some(("apple".to_string(), Value::from("apple"))));
}

#[test]
fn limits_cap_result_sizes() {
    let store = filled_store();
    assert_eq!(store.keys(None, Some(3)).unwrap().len(), 3);
    assert_eq!(store.values(None, Some(4)).unwrap().len(), 4);

    let tx = store.transaction().unwrap();
    tx.put("key99", Value::from("late")).unwrap();
    assert_eq!(tx.keys(None, Some(11)).unwrap().len(), 11);
}

#[test]
fn transaction_reads_merge_with_parent_scans() {
    let store = filled_store();
    let tx = store.transaction().unwrap();
    tx.remove("key5").unwrap();
    tx.put("key25", Value::from("inserted")).unwrap();

    let keys = tx.keys(None, None).unwrap();
    assert_eq!(keys.len(), 10);
    assert!(!keys.contains("key5"));
    assert!(keys.contains("key25"));

    // Merged iteration respects key order across layers.
    let mut ordered = Vec::new();
    tx.key_stream(
        |key| {
            ordered.push(key.to_string());
            true
        },
        true,
        None,
    )
    .unwrap();
    let mut expected: Vec<String> = keys.iter().cloned().collect();
    expected.sort();
    assert_eq!(ordered, expected);
}

#[test]
fn chained_transactions_stack_on_unflushed_parents() {
    let store = store();
    let pinned = store.snapshot().unwrap();

    // Each commit stacks on the previous one; the snapshot keeps the
    // whole chain unflushed.
    for i in 0..3 {
        let tx = store.transaction().unwrap();
        tx.put(&format!("k{i}"), Value::Integer(i)).unwrap();
        assert!(tx.commit().unwrap(), "commit {i} should succeed");
    }

    assert_eq!(store.count(None).unwrap(), 3);
    assert_eq!(pinned.count(None).unwrap(), 0);

    pinned.abort().unwrap();
    assert_eq!(store.count(None).unwrap(), 3);
    for i in 0..3 {
        assert!(store.get(&format!("k{i}")).unwrap().is_some());
    }
}
