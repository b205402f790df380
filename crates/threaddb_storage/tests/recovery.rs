//! Recovery tests: replaying logs written by one engine in another.

use proptest::prelude::*;
use serde_json::json;
use std::collections::BTreeMap;
use threaddb_storage::{
    Engine, FileBackend, InMemoryBackend, StorageError, TableDef, TxMode,
};

fn write(engine: &Engine, key: &str, n: i64) {
    engine
        .transaction(TxMode::ReadWrite, &["kv"], |txn| {
            txn.put("kv", json!({"k": key, "n": n}))?;
            Ok::<_, StorageError>(())
        })
        .unwrap();
}

#[test]
fn file_engine_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db").join("commit.log");

    {
        let engine = Engine::open_path(&path).unwrap();
        engine.create_table(TableDef::keyed("kv", "k")).unwrap();
        write(&engine, "a", 1);
        write(&engine, "b", 2);
        engine.close().unwrap();
    }

    let engine = Engine::open_path(&path).unwrap();
    let rows = engine
        .transaction(TxMode::ReadOnly, &["kv"], |txn| txn.all("kv"))
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1].1["n"], 2);
}

#[test]
fn torn_write_loses_only_the_last_commit() {
    let backend = InMemoryBackend::new();
    {
        let engine = Engine::open(Box::new(backend.clone())).unwrap();
        engine.create_table(TableDef::keyed("kv", "k")).unwrap();
        write(&engine, "a", 1);
        write(&engine, "b", 2);
    }

    let mut bytes = backend.data();
    bytes.truncate(bytes.len() - 2);
    let engine = Engine::open(Box::new(InMemoryBackend::with_data(bytes))).unwrap();
    let keys = engine
        .transaction(TxMode::ReadOnly, &["kv"], |txn| txn.keys("kv"))
        .unwrap();
    assert_eq!(keys, vec!["a".to_string()]);
}

#[test]
fn file_lock_is_released_on_drop() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("commit.log");
    let first = FileBackend::open(&path).unwrap();
    drop(first);
    assert!(FileBackend::open(&path).is_ok());
}

#[derive(Debug, Clone)]
enum Op {
    Put(u8, i64),
    Delete(u8),
    Clear,
    Compact,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (0u8..8, any::<i64>()).prop_map(|(k, n)| Op::Put(k, n)),
        3 => (0u8..8).prop_map(Op::Delete),
        1 => Just(Op::Clear),
        1 => Just(Op::Compact),
    ]
}

proptest! {
    #[test]
    fn replay_matches_live_state(ops in prop::collection::vec(op(), 1..40)) {
        let backend = InMemoryBackend::new();
        let engine = Engine::open(Box::new(backend.clone())).unwrap();
        engine.create_table(TableDef::keyed("kv", "k")).unwrap();
        let mut model: BTreeMap<String, i64> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Put(k, n) => {
                    let key = format!("key-{k}");
                    write(&engine, &key, n);
                    model.insert(key, n);
                }
                Op::Delete(k) => {
                    let key = format!("key-{k}");
                    engine
                        .transaction(TxMode::ReadWrite, &["kv"], |txn| txn.delete("kv", &key))
                        .unwrap();
                    model.remove(&key);
                }
                Op::Clear => {
                    engine
                        .transaction(TxMode::ReadWrite, &["kv"], |txn| txn.clear("kv"))
                        .unwrap();
                    model.clear();
                }
                Op::Compact => engine.compact().unwrap(),
            }
        }
        drop(engine);

        let reopened = Engine::open(Box::new(backend)).unwrap();
        let rows = reopened
            .transaction(TxMode::ReadOnly, &["kv"], |txn| txn.all("kv"))
            .unwrap();
        let replayed: BTreeMap<String, i64> = rows
            .into_iter()
            .map(|(k, v)| (k, v["n"].as_i64().unwrap()))
            .collect();
        prop_assert_eq!(replayed, model);
    }
}
