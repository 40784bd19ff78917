//! Multi-transaction scenarios: deadlock victims, abort rollback, and
//! lock interaction through the public API.

use std::sync::Arc;
use std::time::Duration;

use doclite::{doc, Config, Database, DbError, SessionContext, Value};
use tempfile::tempdir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn explicit_ctx(db: &Database, lsid: [u8; 16], txn_number: i64) -> SessionContext {
    let key = db.sessions().get_or_create_session(&lsid);
    let txn_id = db
        .sessions()
        .start_transaction(&key, txn_number, None, None)
        .unwrap();
    SessionContext {
        session_key: Some(key),
        txn_number: Some(txn_number),
        txn_id: Some(txn_id),
        autocommit: false,
    }
}

#[tokio::test]
async fn test_deadlock_victim_is_newly_blocked_txn() {
    init_tracing();
    let dir = tempdir().unwrap();
    let db = Arc::new(Database::open(dir.path().join("test.db"), Config::default()).unwrap());
    let none = SessionContext::none();

    // Both collections must exist before the transactions start so the
    // inserts only contend on collection locks.
    db.create_collection("x", &none).await.unwrap();
    db.create_collection("y", &none).await.unwrap();

    let ctx1 = explicit_ctx(&db, [1u8; 16], 1);
    let ctx2 = explicit_ctx(&db, [2u8; 16], 1);

    // T1 takes col:x exclusive, T2 takes col:y exclusive.
    db.insert_one("x", doc! { "_id": 1 }, &ctx1).await.unwrap();
    db.insert_one("y", doc! { "_id": 1 }, &ctx2).await.unwrap();

    // T1 blocks requesting col:y.
    let db_clone = Arc::clone(&db);
    let ctx1_clone = ctx1.clone();
    let blocked = tokio::spawn(async move {
        db_clone.insert_one("y", doc! { "_id": 2 }, &ctx1_clone).await
    });
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }

    // T2's request for col:x closes the cycle; T2 is the victim.
    let err = db
        .insert_one("x", doc! { "_id": 2 }, &ctx2)
        .await
        .unwrap_err();
    match &err {
        DbError::TransactionAborted(msg) => assert!(msg.contains("deadlock detected")),
        other => panic!("expected deadlock abort, got {other:?}"),
    }
    assert_eq!(err.code(), 263);

    // The command driver aborts T2; T1 then proceeds and commits.
    db.sessions()
        .abort_transaction(ctx2.session_key.as_deref().unwrap(), 1)
        .unwrap();
    blocked.await.unwrap().unwrap();
    db.sessions()
        .commit_transaction(ctx1.session_key.as_deref().unwrap(), 1)
        .unwrap();

    // T1's writes stuck, T2's were rolled back.
    assert_eq!(db.count("x", &none).await.unwrap(), 1);
    let y_docs = db.find("y", None, None, &none).await.unwrap().documents;
    let ids: Vec<&Value> = y_docs.iter().filter_map(|d| d.get("_id")).collect();
    assert_eq!(ids, vec![&Value::Int32(2)]);
    db.close().unwrap();
}

#[tokio::test]
async fn test_abort_restores_pre_image_and_indexes() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path().join("test.db"), Config::default()).unwrap();
    let none = SessionContext::none();

    db.insert_one("c", doc! { "_id": 1, "v": 1 }, &none).await.unwrap();
    db.create_index("c", vec![("v".to_string(), 1)], false, None, &none)
        .await
        .unwrap();

    let ctx = explicit_ctx(&db, [3u8; 16], 1);
    assert!(db
        .replace_one("c", &Value::Int32(1), doc! { "_id": 1, "v": 2 }, &ctx)
        .await
        .unwrap());

    // Inside the transaction the new value is visible.
    let mid = db.find_by_id("c", &Value::Int32(1), &ctx).await.unwrap().unwrap();
    assert_eq!(mid.get("v"), Some(&Value::Int32(2)));

    db.sessions()
        .abort_transaction(ctx.session_key.as_deref().unwrap(), 1)
        .unwrap();

    // The pre-image is back and every index entry points at it.
    let restored = db
        .find_by_id("c", &Value::Int32(1), &none)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(restored.get("v"), Some(&Value::Int32(1)));
    let via_index = db
        .find_by_index_hint("c", "v_1", &doc! { "v": 1 }, &none)
        .await
        .unwrap();
    assert_eq!(via_index.len(), 1);
    assert!(db
        .find_by_index_hint("c", "v_1", &doc! { "v": 2 }, &none)
        .await
        .unwrap()
        .is_empty());
    db.close().unwrap();
}

#[tokio::test]
async fn test_abort_reverts_insert_and_delete_in_reverse_order() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path().join("test.db"), Config::default()).unwrap();
    let none = SessionContext::none();

    db.insert_one("c", doc! { "_id": 1, "tag": "keep" }, &none)
        .await
        .unwrap();

    let ctx = explicit_ctx(&db, [4u8; 16], 1);
    db.insert_one("c", doc! { "_id": 2 }, &ctx).await.unwrap();
    assert!(db.delete_one("c", &Value::Int32(1), &ctx).await.unwrap());

    db.sessions()
        .abort_transaction(ctx.session_key.as_deref().unwrap(), 1)
        .unwrap();

    assert!(db
        .find_by_id("c", &Value::Int32(1), &none)
        .await
        .unwrap()
        .is_some());
    assert!(db
        .find_by_id("c", &Value::Int32(2), &none)
        .await
        .unwrap()
        .is_none());
    assert_eq!(db.count("c", &none).await.unwrap(), 1);
    db.close().unwrap();
}

#[tokio::test]
async fn test_conflicting_writers_serialize_on_collection_lock() {
    let dir = tempdir().unwrap();
    let mut config = Config::default();
    config.lock_timeout_ms = 200;
    let db = Arc::new(Database::open(dir.path().join("test.db"), config).unwrap());
    let none = SessionContext::none();
    db.create_collection("c", &none).await.unwrap();

    let ctx1 = explicit_ctx(&db, [5u8; 16], 1);
    db.insert_one("c", doc! { "_id": 1 }, &ctx1).await.unwrap();

    // A second writer cannot get the collection lock while T1 holds it.
    let ctx2 = explicit_ctx(&db, [6u8; 16], 1);
    let err = db
        .insert_one("c", doc! { "_id": 2 }, &ctx2)
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::OperationFailed(_)));
    assert_eq!(err.code(), 96);

    db.sessions()
        .commit_transaction(ctx1.session_key.as_deref().unwrap(), 1)
        .unwrap();

    // After T1 commits the lock is free again.
    db.insert_one("c", doc! { "_id": 2 }, &ctx2).await.unwrap();
    db.sessions()
        .commit_transaction(ctx2.session_key.as_deref().unwrap(), 1)
        .unwrap();
    assert_eq!(db.count("c", &none).await.unwrap(), 2);
    db.close().unwrap();
}

#[tokio::test]
async fn test_committed_data_is_durable_across_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.db");
    {
        let db = Database::open(&path, Config::default()).unwrap();
        let ctx = explicit_ctx(&db, [7u8; 16], 1);
        db.insert_one("c", doc! { "_id": 1, "v": "committed" }, &ctx)
            .await
            .unwrap();
        db.sessions()
            .commit_transaction(ctx.session_key.as_deref().unwrap(), 1)
            .unwrap();
        // No close: commit alone must have flushed.
    }
    let db = Database::open(&path, Config::default()).unwrap();
    let none = SessionContext::none();
    let doc = db
        .find_by_id("c", &Value::Int32(1), &none)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc.get("v"), Some(&Value::String("committed".into())));
    db.close().unwrap();
}

#[tokio::test]
async fn test_errors_inside_explicit_txn_do_not_auto_abort() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path().join("test.db"), Config::default()).unwrap();
    let none = SessionContext::none();
    db.insert_one("c", doc! { "_id": 1 }, &none).await.unwrap();

    let ctx = explicit_ctx(&db, [8u8; 16], 1);
    db.insert_one("c", doc! { "_id": 2 }, &ctx).await.unwrap();
    // Duplicate key fails the command but leaves the transaction active.
    let err = db.insert_one("c", doc! { "_id": 1 }, &ctx).await.unwrap_err();
    assert!(matches!(err, DbError::DuplicateKey(_)));

    db.sessions()
        .commit_transaction(ctx.session_key.as_deref().unwrap(), 1)
        .unwrap();
    assert_eq!(db.count("c", &none).await.unwrap(), 2);
    db.close().unwrap();
}

#[tokio::test]
async fn test_lock_wait_resolves_without_timeout() {
    let dir = tempdir().unwrap();
    let db = Arc::new(Database::open(dir.path().join("test.db"), Config::default()).unwrap());
    let none = SessionContext::none();
    db.create_collection("c", &none).await.unwrap();

    let ctx1 = explicit_ctx(&db, [9u8; 16], 1);
    db.insert_one("c", doc! { "_id": 1 }, &ctx1).await.unwrap();

    // An autocommit writer parks behind T1 and completes once T1
    // commits, well before its 30s budget.
    let db_clone = Arc::clone(&db);
    let waiter = tokio::spawn(async move {
        let none = SessionContext::none();
        db_clone.insert_one("c", doc! { "_id": 2 }, &none).await
    });
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }

    db.sessions()
        .commit_transaction(ctx1.session_key.as_deref().unwrap(), 1)
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("waiter should resolve after commit")
        .unwrap()
        .unwrap();
    assert_eq!(db.count("c", &none).await.unwrap(), 2);
    db.close().unwrap();
}
