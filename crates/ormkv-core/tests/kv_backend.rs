//! Integration tests for the sled key-value backend.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use ormkv_core::proto::{Filter, Query, Row, TableRef, Value};
use ormkv_core::{Error, KvBackend, KvConfig, StorageBackend};

fn row(pairs: &[(&str, Value)]) -> Row {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn users() -> TableRef {
    TableRef::new("users").with_unique("email")
}

async fn connected() -> Arc<KvBackend> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let backend = Arc::new(KvBackend::new("default", KvConfig::temporary()));
    backend.connect().await.unwrap();
    backend
}

#[tokio::test]
async fn test_unique_claims_ignore_case() {
    let backend = connected().await;
    backend
        .insert(&users(), row(&[("email", "a@x.com".into())]))
        .await
        .unwrap();

    let err = backend
        .insert(&users(), row(&[("email", "A@X.COM".into())]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::UniquenessViolation { ref column, .. } if column == "email"
    ));
    assert_eq!(backend.count(&Query::new(users())).await.unwrap(), 1);
}

#[tokio::test]
async fn test_unique_claim_moves_with_update() {
    let backend = connected().await;
    let first = backend
        .insert(&users(), row(&[("email", "a@x.com".into())]))
        .await
        .unwrap();
    backend
        .update(&users(), &first["id"], row(&[("email", "b@x.com".into())]))
        .await
        .unwrap();

    // The old value is free again; the new one is taken.
    backend
        .insert(&users(), row(&[("email", "A@x.com".into())]))
        .await
        .unwrap();
    assert!(matches!(
        backend
            .insert(&users(), row(&[("email", "B@X.com".into())]))
            .await,
        Err(Error::UniquenessViolation { .. })
    ));

    // Deleting releases the claim.
    assert!(backend.delete(&users(), &first["id"]).await.unwrap());
    backend
        .insert(&users(), row(&[("email", "b@x.com".into())]))
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_inserts_get_distinct_ids() {
    let backend = connected().await;
    let table = TableRef::new("events");

    let tasks = (0..8).map(|worker| {
        let backend = backend.clone();
        let table = table.clone();
        tokio::spawn(async move {
            let mut ids = Vec::new();
            for i in 0..25 {
                let stored = backend
                    .insert(&table, row(&[("seq", Value::Int(worker * 100 + i))]))
                    .await
                    .unwrap();
                ids.push(stored["id"].clone());
            }
            ids
        })
    });

    let mut seen = HashSet::new();
    for ids in join_all(tasks).await {
        for id in ids.unwrap() {
            let id = id.as_i64().unwrap();
            assert!(seen.insert(id), "duplicate id {id}");
        }
    }
    assert_eq!(seen.len(), 200);
    assert_eq!(backend.count(&Query::new(table)).await.unwrap(), 200);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_unique_claims_admit_one_writer() {
    let backend = connected().await;
    let attempts = (0..6).map(|i| {
        let backend = backend.clone();
        let email = if i % 2 == 0 { "race@x.com" } else { "RACE@x.com" };
        tokio::spawn(async move { backend.insert(&users(), row(&[("email", email.into())])).await })
    });

    let results: Vec<_> = join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, Error::UniquenessViolation { .. })));
}

#[tokio::test]
async fn test_bulk_insert_is_atomic() {
    let backend = connected().await;
    let batch = vec![
        row(&[("email", "one@x.com".into())]),
        row(&[("email", "two@x.com".into())]),
        row(&[("email", "ONE@x.com".into())]),
    ];
    assert!(matches!(
        backend.bulk_insert(&users(), batch).await,
        Err(Error::UniquenessViolation { .. })
    ));
    assert_eq!(backend.count(&Query::new(users())).await.unwrap(), 0);

    let stored = backend
        .bulk_insert(
            &users(),
            vec![
                row(&[("email", "one@x.com".into())]),
                row(&[("email", "two@x.com".into())]),
            ],
        )
        .await
        .unwrap();
    assert_eq!(stored.len(), 2);
    assert_ne!(stored[0]["id"], stored[1]["id"]);
}

#[tokio::test]
async fn test_transaction_commit_and_rollback() {
    let backend = connected().await;

    let mut tx = backend.begin_transaction().await.unwrap();
    let id = tx.set(&users(), row(&[("email", "t@x.com".into())])).await.unwrap();
    tx.set(&users(), row(&[("email", "u@x.com".into())])).await.unwrap();
    assert_eq!(tx.pending(), 2);
    assert_eq!(backend.count(&Query::new(users())).await.unwrap(), 0);
    assert_eq!(tx.commit().await.unwrap(), 2);
    assert_eq!(backend.count(&Query::new(users())).await.unwrap(), 2);

    let mut tx = backend.begin_transaction().await.unwrap();
    tx.delete(&users(), id).unwrap();
    tx.rollback().await.unwrap();
    assert_eq!(backend.count(&Query::new(users())).await.unwrap(), 2);

    let mut tx = backend.begin_transaction().await.unwrap();
    tx.set(&users(), row(&[("email", "v@x.com".into())])).await.unwrap();
    tx.set(&users(), row(&[("email", "T@X.COM".into())])).await.unwrap();
    assert!(matches!(
        tx.commit().await,
        Err(Error::UniquenessViolation { .. })
    ));
    let query = Query::new(users()).with_filter(Filter::eq("email", "v@x.com"));
    assert_eq!(backend.count(&query).await.unwrap(), 0);
}

#[tokio::test]
async fn test_operations_require_connection() {
    let backend = connected().await;
    backend.disconnect().await.unwrap();
    assert!(!backend.is_connected());
    assert!(matches!(
        backend.count(&Query::new(users())).await,
        Err(Error::NotConnected(_))
    ));
    assert!(matches!(
        backend.begin_transaction().await,
        Err(Error::NotConnected(_))
    ));
    // Disconnecting twice is harmless.
    backend.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_rows_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let table = TableRef::new("notes");

    let backend = KvBackend::new("default", KvConfig::new(dir.path().join("db")));
    backend.connect().await.unwrap();
    backend
        .insert(&table, row(&[("text", "kept".into())]))
        .await
        .unwrap();
    backend.flush().await.unwrap();
    backend.disconnect().await.unwrap();

    let reopened = KvBackend::new("default", KvConfig::new(dir.path().join("db")));
    reopened.connect().await.unwrap();
    let rows = reopened.execute(&Query::new(table.clone())).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["text"], Value::Text("kept".into()));

    // The counter resumes past the stored key.
    let next = reopened
        .insert(&table, row(&[("text", "new".into())]))
        .await
        .unwrap();
    assert_eq!(next["id"], Value::Int(2));
}

#[tokio::test]
async fn test_text_primary_key_collides_ignoring_case() {
    let backend = connected().await;
    let tags = TableRef::new("tags").with_primary_key("slug", false);
    backend
        .insert(&tags, row(&[("slug", "ABC".into()), ("label", "first".into())]))
        .await
        .unwrap();

    let err = backend
        .insert(&tags, row(&[("slug", "abc".into()), ("label", "second".into())]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::UniquenessViolation { ref column, .. } if column == "slug"
    ));
    assert_eq!(backend.count(&Query::new(tags.clone())).await.unwrap(), 1);

    // Deleting the row frees its key for any spelling.
    assert!(backend.delete(&tags, &Value::Text("ABC".into())).await.unwrap());
    backend
        .insert(&tags, row(&[("slug", "abc".into())]))
        .await
        .unwrap();
}
