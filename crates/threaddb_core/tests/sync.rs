//! Integration tests for pushing, pulling and stashing against an
//! in-process thread store.

use futures::FutureExt;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use threaddb_core::{
    ChangeKey, ChangeType, CollectionConfig, CoreError, Credentials, Database, DatabaseConfig,
    Identity, Query, RemoteConfig, SignCallback,
};
use threaddb_sync_protocol::ProtocolError;
use threaddb_testkit::{init_tracing, TestRemote, TEST_HOST};

fn open_notes(remote: &TestRemote) -> Database {
    let db = remote.database(DatabaseConfig::new("notes"));
    db.collection_config(CollectionConfig::new("notes")).unwrap();
    db.open(1).unwrap();
    db
}

fn key(id: &str) -> ChangeKey {
    ChangeKey {
        collection: "notes".into(),
        id: id.into(),
    }
}

#[tokio::test]
async fn push_sends_every_change_in_order() {
    init_tracing();
    let remote = TestRemote::new();
    let db = open_notes(&remote);
    let thread = db.remote().initialize(None).await.unwrap();
    assert!(remote.store.has_db(&thread));
    assert_eq!(db.remote().id(), Some(thread.clone()));

    let notes = db.collection("notes").unwrap();
    notes.insert(vec![json!({"_id": "a", "text": "hi"})]).unwrap();
    notes.save(vec![json!({"_id": "a", "text": "hello"})]).unwrap();
    notes.insert(vec![json!({"_id": "b", "text": "bye"})]).unwrap();
    notes.delete(["b"]).unwrap();
    assert_eq!(db.remote().pending_changes(None).unwrap().len(), 4);

    let pushed = db.remote().push(&[]).await.unwrap();
    assert_eq!(pushed, 4);
    assert_eq!(remote.store.commit_count(), 4);
    assert_eq!(
        remote.store.documents(&thread, "notes"),
        vec![json!({"_id": "a", "text": "hello"})]
    );
    assert!(db.remote().pending_changes(None).unwrap().is_empty());

    // Nothing left to send.
    assert_eq!(db.remote().push(&["notes"]).await.unwrap(), 0);
}

#[tokio::test]
async fn documents_pushed_by_one_instance_are_pulled_by_another() {
    let remote = TestRemote::new();
    let writer = open_notes(&remote);
    let thread = writer.remote().initialize(None).await.unwrap();
    let docs: Vec<_> = (0..5)
        .map(|i| json!({"_id": format!("n{i}"), "text": format!("note {i}")}))
        .collect();
    writer.collection("notes").unwrap().insert(docs.clone()).unwrap();
    writer.remote().push(&["notes"]).await.unwrap();

    let reader = open_notes(&remote);
    reader.remote().initialize(Some(thread)).await.unwrap();
    let touched = reader.remote().pull(&["notes"]).await.unwrap();
    assert_eq!(touched.len(), 5);

    let pulled = reader.collection("notes").unwrap().find(Query::all()).unwrap().to_vec();
    assert_eq!(pulled, docs);
    assert!(reader.remote().pending_changes(None).unwrap().is_empty());
}

#[tokio::test]
async fn push_requires_initialization() {
    let remote = TestRemote::new();
    let db = open_notes(&remote);
    let err = db.remote().push(&[]).await.unwrap_err();
    assert!(matches!(err, CoreError::ThreadId { .. }));
}

#[tokio::test]
async fn push_of_unknown_collection_fails() {
    let remote = TestRemote::new();
    let db = open_notes(&remote);
    db.remote().initialize(None).await.unwrap();
    let err = db.remote().push(&["missing"]).await.unwrap_err();
    assert!(matches!(err, CoreError::CollectionNotFound { .. }));
}

#[tokio::test]
async fn failed_push_discards_and_keeps_the_rest_queued() {
    let remote = TestRemote::new();
    let db = open_notes(&remote);
    let thread = db.remote().initialize(None).await.unwrap();
    let notes = db.collection("notes").unwrap();
    notes.insert(vec![json!({"_id": "a"})]).unwrap();
    notes.insert(vec![json!({"_id": "b"})]).unwrap();
    notes.insert(vec![json!({"_id": "c"})]).unwrap();

    remote.store.fail_commit_after(1);
    let err = db.remote().push(&[]).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(remote.store.discard_count(), 1);
    assert_eq!(remote.store.documents(&thread, "notes").len(), 1);
    let left: Vec<String> = db
        .remote()
        .pending_changes(None)
        .unwrap()
        .into_iter()
        .map(|c| c.key)
        .collect();
    assert_eq!(left, vec!["b", "c"]);

    assert_eq!(db.remote().push(&[]).await.unwrap(), 2);
    assert_eq!(remote.store.documents(&thread, "notes").len(), 3);
}

#[tokio::test]
async fn failing_discard_still_reports_the_push_error() {
    let remote = TestRemote::new();
    let db = open_notes(&remote);
    db.remote().initialize(None).await.unwrap();
    db.collection("notes")
        .unwrap()
        .insert(vec![json!({"_id": "a"})])
        .unwrap();

    remote.store.fail_commit_after(0);
    remote.store.set_fail_discard(true);
    let err = db.remote().push(&[]).await.unwrap_err();
    assert!(matches!(
        err,
        CoreError::Remote(ProtocolError::Transport { ref message, .. }) if message.contains("commit")
    ));
    assert_eq!(db.remote().pending_changes(None).unwrap().len(), 1);
}

#[tokio::test]
async fn pull_replaces_local_state_with_remote_state() {
    let remote = TestRemote::new();
    let db = open_notes(&remote);
    let thread = db.remote().initialize(None).await.unwrap();
    let notes = db.collection("notes").unwrap();
    notes
        .insert(vec![
            json!({"_id": "a", "text": "one"}),
            json!({"_id": "b", "text": "two"}),
            json!({"_id": "d", "text": "same"}),
        ])
        .unwrap();
    db.remote().push(&[]).await.unwrap();

    // Another peer edits the thread.
    remote
        .store
        .put_document(&thread, "notes", json!({"_id": "a", "text": "remote"}))
        .unwrap();
    remote.store.remove_document(&thread, "notes", "b").unwrap();
    remote
        .store
        .put_document(&thread, "notes", json!({"_id": "c", "text": "new"}))
        .unwrap();

    let touched = db.remote().pull(&[]).await.unwrap();
    let expected: BTreeSet<ChangeKey> = [key("a"), key("b"), key("c")].into_iter().collect();
    assert_eq!(touched, expected);

    assert_eq!(notes.find_by_id("a").unwrap().unwrap()["text"], "remote");
    assert!(notes.find_by_id("b").unwrap().is_none());
    assert_eq!(notes.find_by_id("c").unwrap().unwrap()["text"], "new");
    assert_eq!(notes.count(Query::all()).unwrap(), 3);
    assert!(db.remote().pending_changes(None).unwrap().is_empty());
}

#[tokio::test]
async fn pull_refuses_to_overwrite_local_changes() {
    let remote = TestRemote::new();
    let db = open_notes(&remote);
    db.remote().initialize(None).await.unwrap();
    db.collection("notes")
        .unwrap()
        .insert(vec![json!({"_id": "a"})])
        .unwrap();

    let err = db.remote().pull(&[]).await.unwrap_err();
    assert!(matches!(err, CoreError::LocalChanges { pending: 1 }));
    assert!(db.collection("notes").unwrap().has(["a"]).unwrap());
}

#[tokio::test]
async fn stash_round_trip_restores_the_change_log() {
    let remote = TestRemote::new();
    let db = open_notes(&remote);
    let notes = db.collection("notes").unwrap();
    notes.insert(vec![json!({"_id": "b", "n": 1})]).unwrap();
    notes.insert(vec![json!({"_id": "a", "n": 1})]).unwrap();
    notes.save(vec![json!({"_id": "b", "n": 2})]).unwrap();
    notes.save(vec![json!({"_id": "a", "n": 2})]).unwrap();
    let before = db.remote().pending_changes(None).unwrap();
    let order: Vec<(String, ChangeType)> =
        before.iter().map(|c| (c.key.clone(), c.kind)).collect();
    assert_eq!(
        order,
        vec![
            ("b".to_string(), ChangeType::Add),
            ("a".to_string(), ChangeType::Add),
            ("b".to_string(), ChangeType::Put),
            ("a".to_string(), ChangeType::Put),
        ]
    );

    assert_eq!(db.remote().create_stash().unwrap(), 4);
    assert!(db.remote().pending_changes(None).unwrap().is_empty());
    assert_eq!(db.remote().stash_len().unwrap(), 4);
    assert_eq!(db.remote().create_stash().unwrap(), 0);

    assert_eq!(db.remote().apply_stash(&[]).unwrap(), 4);
    assert_eq!(db.remote().pending_changes(None).unwrap(), before);
    assert_eq!(db.remote().stash_len().unwrap(), 0);
}

#[tokio::test]
async fn stash_replays_local_edits_over_a_pull() {
    let remote = TestRemote::new();
    let db = open_notes(&remote);
    let thread = db.remote().initialize(None).await.unwrap();
    let notes = db.collection("notes").unwrap();
    notes
        .insert(vec![json!({"_id": "a", "text": "hi", "n": 1})])
        .unwrap();
    db.remote().push(&[]).await.unwrap();

    notes
        .save(vec![json!({"_id": "a", "text": "local", "n": 1})])
        .unwrap();
    remote
        .store
        .put_document(&thread, "notes", json!({"_id": "a", "text": "hi", "n": 2}))
        .unwrap();

    db.remote().create_stash().unwrap();
    let touched = db.remote().pull(&[]).await.unwrap();
    assert!(touched.contains(&key("a")));
    assert_eq!(notes.find_by_id("a").unwrap().unwrap()["n"], 2);

    assert_eq!(db.remote().apply_stash(&["notes"]).unwrap(), 1);
    assert_eq!(
        notes.find_by_id("a").unwrap(),
        Some(json!({"_id": "a", "text": "local", "n": 2}))
    );
    let pending = db.remote().pending_changes(None).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].kind, ChangeType::Put);

    db.remote().push(&[]).await.unwrap();
    assert_eq!(
        remote.store.documents(&thread, "notes"),
        vec![json!({"_id": "a", "text": "local", "n": 2})]
    );
}

#[tokio::test]
async fn clear_stash_drops_stashed_changes() {
    let remote = TestRemote::new();
    let db = open_notes(&remote);
    db.collection("notes")
        .unwrap()
        .insert(vec![json!({"_id": "a"})])
        .unwrap();
    db.remote().create_stash().unwrap();
    db.remote().clear_stash().unwrap();
    assert_eq!(db.remote().stash_len().unwrap(), 0);
    assert_eq!(db.remote().apply_stash(&[]).unwrap(), 0);
    assert!(db.remote().pending_changes(None).unwrap().is_empty());
}

#[tokio::test]
async fn authorize_with_identity_unlocks_the_remote() {
    let remote = TestRemote::with_auth();
    let db = open_notes(&remote);

    let err = db.remote().initialize(None).await.unwrap_err();
    assert!(matches!(err, CoreError::Remote(ProtocolError::Unauthorized(_))));

    let token = db
        .remote()
        .authorize(Credentials::identity(remote.identity.clone()))
        .await
        .unwrap();
    assert_eq!(db.remote().config().token, Some(token));
    db.remote().initialize(None).await.unwrap();
}

#[tokio::test]
async fn authorize_with_public_key_uses_the_callback() {
    let remote = TestRemote::with_auth();
    let db = open_notes(&remote);
    let identity = remote.identity.clone();
    let sign: SignCallback = Arc::new(move |challenge: Vec<u8>| {
        let identity = identity.clone();
        async move { Ok::<_, ProtocolError>(identity.sign(&challenge)) }.boxed()
    });

    let missing = Credentials::PublicKey {
        key: remote.identity.public_key(),
        sign: None,
    };
    assert!(matches!(
        db.remote().authorize(missing).await,
        Err(CoreError::NoCallback)
    ));

    let credentials = Credentials::PublicKey {
        key: remote.identity.public_key(),
        sign: Some(sign),
    };
    db.remote().authorize(credentials).await.unwrap();
    db.remote().initialize(None).await.unwrap();
}

#[tokio::test]
async fn remote_operations_need_a_host() {
    let db = Database::new(DatabaseConfig::new("offline"));
    db.open(1).unwrap();
    let err = db
        .remote()
        .authorize(Credentials::identity(threaddb_core::HmacIdentity::random()))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::NoRemote));
    assert!(matches!(
        db.remote().initialize(None).await,
        Err(CoreError::NoRemote)
    ));
}

#[tokio::test]
async fn initialize_joins_an_existing_thread() {
    let remote = TestRemote::new();
    let first = open_notes(&remote);
    let thread = first.remote().initialize(None).await.unwrap();

    let second = remote.database(DatabaseConfig::new("notes"));
    second
        .collection_config(CollectionConfig::new("notes"))
        .unwrap();
    second
        .collection_config(CollectionConfig::new("tags"))
        .unwrap();
    second.open(1).unwrap();
    let joined = second.remote().initialize(Some(thread.clone())).await.unwrap();
    assert_eq!(joined, thread);

    // The new collection was registered alongside the existing one.
    remote
        .store
        .put_document(&thread, "tags", json!({"_id": "t"}))
        .unwrap();
}

#[tokio::test]
async fn remote_settings_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = DatabaseConfig::new("notes").path(dir.path().join("commit.log"));
    let remote = TestRemote::new();

    let thread = {
        let db = remote.database(config.clone());
        db.collection_config(CollectionConfig::new("notes")).unwrap();
        db.open(1).unwrap();
        let thread = db.remote().initialize(None).await.unwrap();
        db.remote()
            .set(RemoteConfig::default().metadata("x-client", "tests"))
            .unwrap();
        db.close().unwrap();
        thread
    };

    let db = Database::with_connector(config, remote.connector());
    db.open(1).unwrap();
    let restored = db.remote().config();
    assert_eq!(restored.id, Some(thread));
    assert_eq!(restored.service_host.as_deref(), Some(TEST_HOST));
    assert_eq!(restored.metadata.get("x-client").map(String::as_str), Some("tests"));

    // Reinitializing reuses the stored thread.
    assert_eq!(db.remote().initialize(None).await.unwrap(), restored.id.unwrap());
}
