//! End-to-end sync behavior: serialization, idempotence, ordering, pruning,
//! retry and offline fallback
//!
//! Run with: cargo test --test sync_tests

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::Connection;

use mirror_sync::error::{Result, SyncError};
use mirror_sync::storage::queries::{find_ids_by_filter, upsert_record};
use mirror_sync::storage::{get_sync_status, Storage};
use mirror_sync::sync::{
    JsonDirRemote, LocalMirror, MemoryRemote, ReconciliationEngine, RemoteSource, SqliteMirror,
    SyncCoordinator, SyncService,
};
use mirror_sync::types::*;

fn config() -> SyncConfig {
    SyncConfig {
        quiescence_ms: 10,
        retry: RetryConfig::fast(),
        ..Default::default()
    }
}

fn item(id: ItemId, parent: Option<ItemId>) -> RemoteItem {
    RemoteItem::new(id, parent).with_field("name", format!("item-{}", id))
}

fn local_ids(storage: &Storage, resource: &str) -> Vec<ItemId> {
    storage
        .with_connection(|conn| {
            find_ids_by_filter(conn, resource, &IdFilter { include_inactive: true })
        })
        .unwrap()
}

/// Remote wrapper that records how many fetches overlap
struct OverlapTracker {
    inner: MemoryRemote,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl OverlapTracker {
    fn new(inner: MemoryRemote) -> Self {
        Self {
            inner,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    async fn tracked<T>(&self, fut: impl std::future::Future<Output = T>) -> T {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        let out = fut.await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        out
    }
}

#[async_trait]
impl RemoteSource for OverlapTracker {
    async fn fetch_page(&self, resource: &str, page: u32, page_size: u32) -> Result<Vec<RemoteItem>> {
        self.tracked(self.inner.fetch_page(resource, page, page_size)).await
    }

    async fn fetch_all(&self, resource: &str) -> Result<Vec<RemoteItem>> {
        self.tracked(self.inner.fetch_all(resource)).await
    }
}

/// Mirror wrapper that records upsert order
struct RecordingMirror {
    inner: SqliteMirror,
    upserts: Mutex<Vec<ItemId>>,
}

impl LocalMirror<RemoteItem> for RecordingMirror {
    fn resource(&self) -> &str {
        self.inner.resource()
    }

    fn list_local_ids(&self, conn: &Connection, filter: &IdFilter) -> Result<Vec<ItemId>> {
        self.inner.list_local_ids(conn, filter)
    }

    fn upsert(&self, conn: &Connection, item: &RemoteItem) -> Result<UpsertOutcome> {
        self.upserts.lock().push(item.id);
        self.inner.upsert(conn, item)
    }

    fn delete_ids(&self, conn: &Connection, ids: &[ItemId]) -> Result<usize> {
        self.inner.delete_ids(conn, ids)
    }

    fn snapshot(&self, conn: &Connection, params: &QueryParams) -> Result<Vec<LocalRecord>> {
        self.inner.snapshot(conn, params)
    }
}

#[tokio::test]
async fn test_concurrent_syncs_of_one_key_never_overlap() {
    let memory = MemoryRemote::new();
    memory.set_collection("tags", vec![item(1, None), item(2, None), item(3, None)]);
    let remote = Arc::new(OverlapTracker::new(memory));

    let storage = Storage::open_in_memory().unwrap();
    let service = Arc::new(SyncService::new(
        storage,
        Arc::new(SyncCoordinator::from_config(&config())),
        remote.clone(),
        config(),
    ));

    let first = {
        let service = service.clone();
        tokio::spawn(async move { service.synchronize("tags", &QueryParams::default()).await })
    };
    let second = {
        let service = service.clone();
        tokio::spawn(async move { service.synchronize("tags", &QueryParams::default()).await })
    };
    let (first, second) = (first.await.unwrap(), second.await.unwrap());

    assert!(first.success && second.success);
    assert_eq!(remote.max_in_flight.load(Ordering::SeqCst), 1);

    // Exactly one of them inserted; the other saw the committed rows
    let messages = [first.message.as_str(), second.message.as_str()];
    assert!(messages.iter().any(|m| m.contains("3 inserted")));
    assert!(messages.iter().any(|m| m.contains("0 inserted, 0 updated, 0 deleted")));
}

#[tokio::test]
async fn test_different_keys_sync_concurrently() {
    let memory = MemoryRemote::new();
    memory.set_collection("tags", vec![item(1, None)]);
    memory.set_collection("attributes", vec![item(1, None)]);
    let remote = Arc::new(OverlapTracker::new(memory));

    let service = Arc::new(SyncService::new(
        Storage::open_in_memory().unwrap(),
        Arc::new(SyncCoordinator::from_config(&config())),
        remote.clone(),
        config(),
    ));

    let params = QueryParams::default();
    let (tags, attributes) = tokio::join!(
        service.synchronize("tags", &params),
        service.synchronize("attributes", &params)
    );

    assert!(tags.success && attributes.success);
    assert_eq!(remote.max_in_flight.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_second_reconcile_is_a_no_op() {
    let storage = Storage::open_in_memory().unwrap();
    let remote = MemoryRemote::new();
    remote.set_collection(
        "categories",
        vec![item(1, None), item(2, Some(1)), item(3, Some(2)), item(4, None)],
    );
    let engine = ReconciliationEngine::new(storage.clone(), config());
    let spec = ResourceSpec::hierarchical("categories");
    let mirror = SqliteMirror::new("categories");

    engine
        .reconcile(&spec, &remote, &mirror, &QueryParams::default())
        .await
        .unwrap();
    let second = engine
        .reconcile(&spec, &remote, &mirror, &QueryParams::default())
        .await
        .unwrap();

    assert_eq!(second.inserted, 0);
    assert_eq!(second.updated, 0);
    assert_eq!(second.deleted, 0);
    assert_eq!(local_ids(&storage, "categories"), vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn test_parent_upserted_before_child() {
    let storage = Storage::open_in_memory().unwrap();
    let remote = MemoryRemote::new();
    remote.set_collection("categories", vec![item(2, Some(1)), item(1, None)]);
    let mirror = RecordingMirror {
        inner: SqliteMirror::new("categories"),
        upserts: Mutex::new(Vec::new()),
    };

    ReconciliationEngine::new(storage.clone(), config())
        .reconcile(
            &ResourceSpec::hierarchical("categories"),
            &remote,
            &mirror,
            &QueryParams::default(),
        )
        .await
        .unwrap();

    assert_eq!(*mirror.upserts.lock(), vec![1, 2]);
    assert_eq!(local_ids(&storage, "categories"), vec![1, 2]);
}

#[tokio::test]
async fn test_orphans_are_pruned() {
    let storage = Storage::open_in_memory().unwrap();
    storage
        .run_in_transaction(|conn| {
            for id in 1..=3 {
                upsert_record(conn, "attributes", &item(id, None))?;
            }
            Ok(())
        })
        .unwrap();

    let remote = MemoryRemote::new();
    remote.set_collection("attributes", vec![item(1, None), item(3, None)]);

    let outcome = ReconciliationEngine::new(storage.clone(), config())
        .reconcile(
            &ResourceSpec::flat("attributes"),
            &remote,
            &SqliteMirror::new("attributes"),
            &QueryParams::default(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.deleted, 1);
    assert_eq!(local_ids(&storage, "attributes"), vec![1, 3]);
}

#[tokio::test]
async fn test_transient_failures_are_retried_until_success() {
    let storage = Storage::open_in_memory().unwrap().with_retry_config(RetryConfig {
        max_attempts: 5,
        base_delay_ms: 10,
        jitter_ms: 0,
        cap_delay_ms: 1000,
    });
    let calls = AtomicU32::new(0);
    let started = tokio::time::Instant::now();

    let value = storage
        .with_retry(5, || {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(SyncError::TransientStore("database is locked".into()))
            } else {
                Ok("committed")
            }
        })
        .await
        .unwrap();

    assert_eq!(value, "committed");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    // 10ms then 20ms of backoff
    assert!(started.elapsed() >= Duration::from_millis(30));
}

#[tokio::test]
async fn test_fatal_failure_is_not_retried() {
    let storage = Storage::open_in_memory().unwrap();
    let calls = AtomicU32::new(0);

    let result: Result<()> = storage
        .with_retry(5, || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SyncError::NotFound {
                resource: "tags".into(),
                ids: vec![9],
            })
        })
        .await;

    assert!(matches!(result, Err(SyncError::NotFound { ref ids, .. }) if ids == &vec![9]));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_sync_survives_write_lock_held_elsewhere() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mirror.db").to_string_lossy().to_string();
    let mut storage_config = StorageConfig::new(path);
    storage_config.busy_timeout_ms = 0;

    let holder = Storage::open(storage_config.clone()).unwrap();
    let retry = RetryConfig {
        max_attempts: 50,
        base_delay_ms: 10,
        jitter_ms: 5,
        cap_delay_ms: 20,
    };
    let storage = Storage::open(storage_config)
        .unwrap()
        .with_retry_config(retry.clone());

    let remote = Arc::new(MemoryRemote::new());
    remote.set_collection("attributes", vec![item(1, None), item(2, None)]);
    let service = SyncService::new(
        storage.clone(),
        Arc::new(SyncCoordinator::from_config(&config())),
        remote,
        SyncConfig { retry, ..config() },
    );

    let (locked_tx, locked_rx) = std::sync::mpsc::channel();
    let handle = std::thread::spawn(move || {
        let conn = holder.connection();
        conn.execute_batch("BEGIN IMMEDIATE").unwrap();
        locked_tx.send(()).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        conn.execute_batch("COMMIT").unwrap();
    });
    locked_rx.recv().unwrap();

    let response = service
        .synchronize("attributes", &QueryParams::default())
        .await;
    handle.join().unwrap();

    assert!(response.success, "{:?}", response.error);
    assert_eq!(local_ids(&storage, "attributes"), vec![1, 2]);
}

#[tokio::test]
async fn test_service_gives_up_after_configured_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mirror.db").to_string_lossy().to_string();
    let mut storage_config = StorageConfig::new(path);
    storage_config.busy_timeout_ms = 0;

    let holder = Storage::open(storage_config.clone()).unwrap();
    let storage = Storage::open(storage_config).unwrap();

    let remote = Arc::new(MemoryRemote::new());
    remote.set_collection("attributes", vec![item(1, None)]);
    let service = SyncService::new(
        storage.clone(),
        Arc::new(SyncCoordinator::from_config(&config())),
        remote,
        SyncConfig {
            retry: RetryConfig {
                max_attempts: 2,
                base_delay_ms: 1,
                jitter_ms: 0,
                cap_delay_ms: 5,
            },
            ..config()
        },
    );

    let (locked_tx, locked_rx) = std::sync::mpsc::channel();
    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
    let handle = std::thread::spawn(move || {
        let conn = holder.connection();
        conn.execute_batch("BEGIN IMMEDIATE").unwrap();
        locked_tx.send(()).unwrap();
        let _ = release_rx.recv_timeout(Duration::from_secs(10));
        conn.execute_batch("COMMIT").unwrap();
    });
    locked_rx.recv().unwrap();

    // The default policy would wait at least 500ms before its second attempt
    let started = std::time::Instant::now();
    let response = service
        .synchronize("attributes", &QueryParams::default())
        .await;
    let elapsed = started.elapsed();
    release_tx.send(()).unwrap();
    handle.join().unwrap();

    assert!(!response.success);
    assert!(elapsed < Duration::from_millis(400), "took {:?}", elapsed);
    assert!(local_ids(&storage, "attributes").is_empty());
}

#[tokio::test]
async fn test_unreachable_remote_serves_cached_mirror() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("categories.json"),
        r#"[
            {"id": 1, "parent": 0, "name": "Clothing"},
            {"id": 2, "parent": 1, "name": "Shirts"},
            {"id": 3, "parent": 1, "name": "Trousers"}
        ]"#,
    )
    .unwrap();

    let storage = Storage::open_in_memory().unwrap();
    let coordinator = Arc::new(SyncCoordinator::from_config(&config()));

    let online = SyncService::new(
        storage.clone(),
        coordinator.clone(),
        Arc::new(JsonDirRemote::new(dir.path())),
        config(),
    );
    let first = online.synchronize("categories", &QueryParams::default()).await;
    assert!(first.success && !first.degraded);
    assert_eq!(first.count, 3);

    let offline = SyncService::new(
        storage.clone(),
        coordinator,
        Arc::new(JsonDirRemote::new(dir.path().join("unmounted-share"))),
        config(),
    );
    let response = offline.synchronize("categories", &QueryParams::default()).await;

    assert!(response.success);
    assert!(response.degraded);
    assert_eq!(response.deleted, 0);
    assert_eq!(response.rows, first.rows);
    assert_eq!(local_ids(&storage, "categories"), vec![1, 2, 3]);

    let status = storage
        .with_connection(|conn| get_sync_status(conn, "categories"))
        .unwrap()
        .unwrap();
    assert!(status.degraded);
    assert_eq!(status.run_count, 2);
}

#[tokio::test]
async fn test_malformed_remote_payload_fails_without_fallback() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("tags.json"), "{ not json").unwrap();

    let storage = Storage::open_in_memory().unwrap();
    storage
        .run_in_transaction(|conn| upsert_record(conn, "tags", &item(1, None)).map(|_| ()))
        .unwrap();

    let service = SyncService::new(
        storage.clone(),
        Arc::new(SyncCoordinator::from_config(&config())),
        Arc::new(JsonDirRemote::new(dir.path())),
        config(),
    );
    let response = service.synchronize("tags", &QueryParams::default()).await;

    assert!(!response.success);
    assert!(!response.degraded);
    assert!(response.error.is_some());
    assert_eq!(local_ids(&storage, "tags"), vec![1]);
}
