//! Cursor batching and session lifecycle scenarios through the public
//! API, plus the wire error shapes.

use doclite::{doc, Config, Database, SessionContext, Value};
use tempfile::tempdir;

#[tokio::test]
async fn test_cursor_batching_over_find() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path().join("test.db"), Config::default()).unwrap();
    let ctx = SessionContext::none();

    for i in 0..150i32 {
        db.insert_one("c", doc! { "_id": i }, &ctx).await.unwrap();
    }

    let first = db.find("c", None, Some(101), &ctx).await.unwrap();
    assert_eq!(first.documents.len(), 101);
    assert_ne!(first.cursor_id, 0);

    let second = db.get_more(first.cursor_id, None).unwrap();
    assert_eq!(second.documents.len(), 49);
    assert_eq!(second.cursor_id, 0);

    let err = db.get_more(first.cursor_id, None).unwrap_err();
    assert_eq!(err.code(), 43);
    assert_eq!(err.code_name(), "CursorNotFound");
    db.close().unwrap();
}

#[tokio::test]
async fn test_find_returns_documents_in_id_order() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path().join("test.db"), Config::default()).unwrap();
    let ctx = SessionContext::none();

    for i in [5i32, 1, 9, 3, 7] {
        db.insert_one("c", doc! { "_id": i }, &ctx).await.unwrap();
    }
    let batch = db.find("c", None, None, &ctx).await.unwrap();
    let ids: Vec<i32> = batch
        .documents
        .iter()
        .filter_map(|d| match d.get("_id") {
            Some(Value::Int32(v)) => Some(*v),
            _ => None,
        })
        .collect();
    assert_eq!(ids, vec![1, 3, 5, 7, 9]);
    db.close().unwrap();
}

#[tokio::test]
async fn test_kill_cursors_semantics() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path().join("test.db"), Config::default()).unwrap();
    let ctx = SessionContext::none();

    for i in 0..50i32 {
        db.insert_one("c", doc! { "_id": i }, &ctx).await.unwrap();
    }
    let batch = db.find("c", None, Some(10), &ctx).await.unwrap();
    assert_ne!(batch.cursor_id, 0);

    let result = db.kill_cursors(&[batch.cursor_id, 424_242]);
    assert_eq!(result.killed, vec![batch.cursor_id]);
    assert_eq!(result.not_found, vec![424_242]);
    assert!(result.alive.is_empty());
    assert!(result.unknown.is_empty());

    // Killing twice reports notFound the second time.
    let again = db.kill_cursors(&[batch.cursor_id]);
    assert_eq!(again.not_found, vec![batch.cursor_id]);
    db.close().unwrap();
}

#[tokio::test]
async fn test_session_ttl_sweep_aborts_transaction() {
    let dir = tempdir().unwrap();
    let mut config = Config::default();
    config.session_ttl_secs = 0; // everything is instantly idle
    let db = Database::open(dir.path().join("test.db"), config).unwrap();

    let lsid = [9u8; 16];
    let command = doc! {
        "insert": "c",
        "lsid": doc! { "id": lsid.to_vec() },
        "txnNumber": 5i64,
        "startTransaction": true,
        "autocommit": false,
    };
    let ctx = db.extract_session_context(&command).unwrap();
    let txn_id = ctx.txn_id.unwrap();
    db.insert_one("c", doc! { "_id": 1 }, &ctx).await.unwrap();

    let removed = db.sessions().sweep_idle_sessions();
    assert_eq!(removed, 1);
    assert_eq!(db.sessions().session_count(), 0);
    assert_eq!(
        db.transactions().transaction_state(txn_id),
        Some(doclite::core::transaction::TransactionState::Aborted)
    );
    // The swept transaction's write is rolled back.
    let none = SessionContext::none();
    assert_eq!(db.count("c", &none).await.unwrap(), 0);

    // The same lsid starts over with a fresh session and any txnNumber.
    let command = doc! {
        "lsid": doc! { "id": lsid.to_vec() },
        "txnNumber": 1i64,
        "startTransaction": true,
        "autocommit": false,
    };
    let ctx = db.extract_session_context(&command).unwrap();
    assert!(ctx.in_transaction());
    db.close().unwrap();
}

#[tokio::test]
async fn test_session_transaction_via_context_round_trip() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path().join("test.db"), Config::default()).unwrap();
    let lsid = [11u8; 16];

    let start = doc! {
        "lsid": doc! { "id": lsid.to_vec() },
        "txnNumber": 1i64,
        "startTransaction": true,
        "autocommit": false,
    };
    let ctx = db.extract_session_context(&start).unwrap();
    db.insert_one("c", doc! { "_id": 1 }, &ctx).await.unwrap();

    // A follow-up command attaches to the same transaction.
    let follow = doc! {
        "lsid": doc! { "id": lsid.to_vec() },
        "txnNumber": 1i64,
        "autocommit": false,
    };
    let ctx2 = db.extract_session_context(&follow).unwrap();
    assert_eq!(ctx2.txn_id, ctx.txn_id);
    db.insert_one("c", doc! { "_id": 2 }, &ctx2).await.unwrap();

    let key = ctx.session_key.as_deref().unwrap();
    db.sessions().commit_transaction(key, 1).unwrap();
    // Repeated commit of the same number is idempotent.
    db.sessions().commit_transaction(key, 1).unwrap();

    let none = SessionContext::none();
    assert_eq!(db.count("c", &none).await.unwrap(), 2);
    db.close().unwrap();
}

#[tokio::test]
async fn test_wire_error_shapes() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path().join("test.db"), Config::default()).unwrap();
    let ctx = SessionContext::none();

    let err = db.get_more(0, None).unwrap_err();
    let response = err.error_response();
    assert_eq!(response.get("ok"), Some(&Value::Double(0.0)));
    assert_eq!(response.get("code"), Some(&Value::Int32(43)));

    let err = db.list_indexes("missing").unwrap_err();
    assert_eq!(err.code(), 26);
    assert_eq!(err.code_name(), "NamespaceNotFound");

    let err = db.create_collection("bad$name", &ctx).await.unwrap_err();
    assert_eq!(err.code(), 73);

    let err = db
        .sessions()
        .commit_transaction("no-such-session", 1)
        .unwrap_err();
    assert_eq!(err.code(), 206);
    db.close().unwrap();
}
