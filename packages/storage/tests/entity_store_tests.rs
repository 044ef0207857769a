// ABOUTME: Integration tests for the entity store against real SQLite databases
// ABOUTME: Covers migrated pools, file-backed persistence and concurrent inserts

use kubedock_storage::{Container, EntityStore, StorageError, DEFAULT_NETWORK, RESERVED_ID_PREFIX};
use pretty_assertions::assert_eq;
use sqlx::SqlitePool;
use std::collections::BTreeSet;

#[sqlx::test]
async fn test_with_pool_seeds_bridge(pool: SqlitePool) {
    let store = EntityStore::with_pool(pool).await.unwrap();
    let bridge = store.get_network_by_name(DEFAULT_NETWORK).await.unwrap();
    assert!(bridge.is_default());
    assert!(!bridge.id.starts_with(RESERVED_ID_PREFIX));
}

#[sqlx::test]
async fn test_not_found_is_distinct_from_database_errors(pool: SqlitePool) {
    let store = EntityStore::with_pool(pool.clone()).await.unwrap();

    let err = store.get_container("missing").await.unwrap_err();
    assert!(matches!(err, StorageError::NotFound { entity: "container", .. }));

    sqlx::query("DROP TABLE network_memberships")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("DROP TABLE containers")
        .execute(&pool)
        .await
        .unwrap();
    let err = store.get_container("missing").await.unwrap_err();
    assert!(matches!(err, StorageError::Database(_)));
    assert!(!err.is_not_found());
}

#[tokio::test]
async fn test_file_backed_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("kubedock.db").display());

    let id = {
        let store = EntityStore::open(&url).await.unwrap();
        let mut container = Container::new("redis:7");
        container.exposed_ports = BTreeSet::from([6379]);
        let created = store.create_container(container).await.unwrap();
        store.close().await;
        created.id
    };

    let store = EntityStore::open(&url).await.unwrap();
    let container = store.get_container(&id).await.unwrap();
    assert_eq!(container.image, "redis:7");
    assert_eq!(container.exposed_ports, BTreeSet::from([6379]));

    // Reopening must not seed a second bridge network.
    let bridges: Vec<_> = store
        .list_networks()
        .await
        .unwrap()
        .into_iter()
        .filter(|n| n.name == DEFAULT_NETWORK)
        .collect();
    assert_eq!(bridges.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creates_get_distinct_ids() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("load.db").display());
    let store = EntityStore::open(&url).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..50 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let mut container = Container::new("busybox");
            container.name = format!("worker-{}", i);
            store.create_container(container).await
        }));
    }

    let mut ids = BTreeSet::new();
    for handle in handles {
        let created = handle.await.unwrap().unwrap();
        assert!(!created.id.starts_with(RESERVED_ID_PREFIX));
        ids.insert(created.id);
    }
    assert_eq!(ids.len(), 50);
    assert_eq!(store.list_containers().await.unwrap().len(), 50);
}
