use super::*;
use serde_json::json;
use tempfile::{TempDir, tempdir};
use uuid::Uuid;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::migrate::executor::CopyExecutor;
use crate::migrate::model::{ConflictPolicy, ContainerRef, CopyRequest, FileRecord};
use crate::migrate::planner::BatchPolicy;
use crate::migrate::throttle::Throttler;
use crate::storage::JobState;
use crate::token_provider::TokenCache;

const LEASE: Duration = Duration::from_secs(60);

struct Harness {
    worker: Worker,
    store: StateStore,
    _spool: TempDir,
}

async fn harness(tenant_url: &str, max_deliveries: i64) -> Harness {
    harness_with(tenant_url, max_deliveries, LEASE, 100).await
}

async fn harness_with(
    tenant_url: &str,
    max_deliveries: i64,
    visibility: Duration,
    max_batch_size: usize,
) -> Harness {
    let store = StateStore::in_memory().await.unwrap();
    let connector = SiteConnector::new(
        Arc::new(TokenCache::with_static_token("test-token")),
        Throttler::default(),
    );
    let engine = MigrationEngine::new(
        BatchPolicy {
            max_batch_size,
            large_file_threshold: None,
        },
        CopyExecutor::new(3),
    );
    let spool = tempdir().unwrap();
    let worker = Worker::new(
        store.clone(),
        connector.clone(),
        engine,
        TransferClient::new(),
        Arc::new(BulkCopier::new(connector, Duration::from_millis(1), 1)),
        WorkerSettings {
            tenant_url: tenant_url.to_string(),
            spool_dir: spool.path().to_path_buf(),
            page_size: 100,
            visibility,
            max_deliveries,
            poll_interval: Duration::from_millis(1),
        },
    );
    Harness {
        worker,
        store,
        _spool: spool,
    }
}

/// Source list with `files` at its root and an existing destination folder.
async fn mount_library(server: &MockServer, files: &[&str]) {
    Mock::given(method("GET"))
        .and(path("/sites/Files/_api/folders"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/sites/Files/_api/folders"))
        .respond_with(ResponseTemplate::new(201))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sites/Files/_api/lists"))
        .and(query_param("path", "/sites/Files/Shared Documents"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "shared",
            "title": "Documents",
            "server_relative_url": "/sites/Files/Shared Documents"
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sites/Files/_api/lists"))
        .and(query_param("path", "/sites/Files/Docs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "docs",
            "title": "Docs",
            "server_relative_url": "/sites/Files/Docs"
        })))
        .mount(server)
        .await;
    let items: Vec<serde_json::Value> = files
        .iter()
        .map(|name| {
            json!({
                "server_relative_url": format!("/sites/Files/Shared Documents/{name}"),
                "dir": "/sites/Files/Shared Documents",
                "modified": "2024-05-01T08:30:00Z",
                "size": 5
            })
        })
        .collect();
    Mock::given(method("GET"))
        .and(path("/sites/Files/_api/lists/shared/items"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "items": items })))
        .mount(server)
        .await;
}

async fn expect_upload(server: &MockServer, name: &str) {
    Mock::given(method("PUT"))
        .and(path("/sites/Files/_api/files/content"))
        .and(query_param("path", format!("/sites/Files/Docs/FlowCopy/{name}")))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(server)
        .await;
}

fn record(site: &str, name: &str) -> FileRecord {
    FileRecord {
        site_url: site.to_string(),
        web_url: site.to_string(),
        server_relative_path: format!("/sites/Files/Shared Documents/{name}"),
        container: ContainerRef {
            title: "Documents".into(),
            server_relative_url: "/sites/Files/Shared Documents".into(),
        },
        subfolder: String::new(),
        author: String::new(),
        last_modified: None,
        size_bytes: 5,
        drive_id: None,
        item_id: None,
    }
}

fn batch_body(job_id: Uuid, site: &str, names: &[&str]) -> String {
    QueueMessage::CopyBatch(CopyBatch {
        request_id: Some(job_id),
        request: request(site),
        items: names.iter().map(|name| record(site, name)).collect(),
    })
    .to_json()
    .unwrap()
}

fn request(site: &str) -> CopyRequest {
    CopyRequest {
        source_site: site.to_string(),
        source_path: "/Shared Documents".into(),
        dest_site: site.to_string(),
        dest_path: "/Docs/FlowCopy".into(),
        conflict_policy: ConflictPolicy::Fail,
        delete_after_copy: false,
    }
}

async fn enqueue_start(store: &StateStore, site: &str) -> Uuid {
    let job_id = Uuid::new_v4();
    store.create_job(job_id).await.unwrap();
    let body = QueueMessage::StartCopy(AsyncStartCopy {
        start: request(site),
        request_id: job_id,
    })
    .to_json()
    .unwrap();
    store.send_message(&body).await.unwrap();
    job_id
}

async fn state(store: &StateStore, job_id: Uuid) -> JobState {
    store.get_job(job_id).await.unwrap().unwrap().state()
}

#[tokio::test]
async fn empty_queue_reports_idle() {
    let h = harness("https://tenant.example", 5).await;
    assert!(!h.worker.run_once().await.unwrap());
}

#[tokio::test]
async fn unreadable_message_is_dropped() {
    let h = harness("https://tenant.example", 5).await;
    h.store.send_message("{\"hello\":1}").await.unwrap();

    assert!(h.worker.run_once().await.unwrap());
    assert_eq!(h.store.queue_depth().await.unwrap(), 0);
}

#[tokio::test]
async fn request_outside_tenant_fails_the_job() {
    let h = harness("https://tenant.example", 5).await;
    let job_id = enqueue_start(&h.store, "https://other.example/sites/Files").await;

    assert!(h.worker.run_once().await.unwrap());

    match state(&h.store, job_id).await {
        JobState::Failed(reason) => assert!(reason.contains("outside"), "{reason}"),
        other => panic!("unexpected state {other:?}"),
    }
    assert_eq!(h.store.queue_depth().await.unwrap(), 0);
}

#[tokio::test]
async fn over_delivered_message_is_dead_lettered() {
    let h = harness("https://tenant.example", 2).await;
    let job_id = enqueue_start(&h.store, "https://tenant.example/sites/Files").await;
    for _ in 0..2 {
        h.store.receive_message(Duration::ZERO).await.unwrap().unwrap();
    }

    assert!(h.worker.run_once().await.unwrap());

    assert_eq!(
        state(&h.store, job_id).await,
        JobState::Failed("queue message was not processed after 3 deliveries".into())
    );
    assert_eq!(h.store.queue_depth().await.unwrap(), 0);
}

#[tokio::test]
async fn start_then_batch_completes_the_job() {
    let server = MockServer::start().await;
    let site = format!("{}/sites/Files", server.uri());
    mount_library(&server, &["Plan.xlsx"]).await;
    Mock::given(method("GET"))
        .and(path("/sites/Files/_api/files/content"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"plans".to_vec()))
        .mount(&server)
        .await;
    expect_upload(&server, "Plan.xlsx").await;

    let h = harness(&server.uri(), 5).await;
    let job_id = enqueue_start(&h.store, &site).await;

    assert!(h.worker.run_once().await.unwrap());
    let job = h.store.get_job(job_id).await.unwrap().unwrap();
    assert!(job.planned);
    assert_eq!(job.state(), JobState::Running);
    assert_eq!(h.store.queue_depth().await.unwrap(), 1);

    assert!(h.worker.run_once().await.unwrap());
    assert_eq!(state(&h.store, job_id).await, JobState::Succeeded);
    assert!(!h.worker.run_once().await.unwrap());
}

#[tokio::test]
async fn batch_with_unreachable_files_fails_the_job() {
    let server = MockServer::start().await;
    let site = format!("{}/sites/Files", server.uri());
    Mock::given(method("GET"))
        .and(path("/sites/Files/_api/files/content"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let h = harness(&server.uri(), 5).await;
    let job_id = Uuid::new_v4();
    h.store.create_job(job_id).await.unwrap();
    h.store
        .enqueue_batch(job_id, "copy:0", &batch_body(job_id, &site, &["Gone.txt"]))
        .await
        .unwrap();
    h.store.mark_planned(job_id).await.unwrap();

    assert!(h.worker.run_once().await.unwrap());

    let job = h.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.abandoned_files, 1);
    assert_eq!(
        job.state(),
        JobState::Failed("1 file(s) could not be copied".into())
    );
}

#[tokio::test]
async fn redelivered_start_is_not_planned_twice() {
    let h = harness("https://tenant.example", 5).await;
    let job_id = enqueue_start(&h.store, "https://tenant.example/sites/Files").await;
    h.store.mark_planned(job_id).await.unwrap();

    assert!(h.worker.run_once().await.unwrap());

    assert_eq!(state(&h.store, job_id).await, JobState::Succeeded);
    assert_eq!(h.store.queue_depth().await.unwrap(), 0);
}

#[tokio::test]
async fn replanning_after_partial_start_waits_for_every_batch() {
    let server = MockServer::start().await;
    let site = format!("{}/sites/Files", server.uri());
    mount_library(&server, &["A.txt", "B.txt"]).await;
    Mock::given(method("GET"))
        .and(path("/sites/Files/_api/files/content"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello".to_vec()))
        .mount(&server)
        .await;
    expect_upload(&server, "A.txt").await;
    expect_upload(&server, "B.txt").await;

    let h = harness_with(&server.uri(), 5, LEASE, 1).await;
    let job_id = enqueue_start(&h.store, &site).await;
    // An earlier delivery queued the first batch, then died before planning finished.
    h.store
        .enqueue_batch(job_id, "copy:0", &batch_body(job_id, &site, &["A.txt"]))
        .await
        .unwrap();

    assert!(h.worker.run_once().await.unwrap());
    let job = h.store.get_job(job_id).await.unwrap().unwrap();
    assert!(job.planned);
    assert_eq!(job.outstanding_batches, 2);
    assert_eq!(h.store.queue_depth().await.unwrap(), 2);

    assert!(h.worker.run_once().await.unwrap());
    assert_eq!(state(&h.store, job_id).await, JobState::Running);

    assert!(h.worker.run_once().await.unwrap());
    assert_eq!(state(&h.store, job_id).await, JobState::Succeeded);
    assert!(!h.worker.run_once().await.unwrap());
}

#[tokio::test]
async fn long_batch_keeps_its_lease() {
    let server = MockServer::start().await;
    let site = format!("{}/sites/Files", server.uri());
    mount_library(&server, &[]).await;
    Mock::given(method("GET"))
        .and(path("/sites/Files/_api/files/content"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(b"slow!".to_vec())
                .set_delay(Duration::from_millis(600)),
        )
        .expect(1)
        .mount(&server)
        .await;
    expect_upload(&server, "Slow.bin").await;

    let h = harness_with(&server.uri(), 5, Duration::from_millis(100), 100).await;
    let job_id = Uuid::new_v4();
    h.store.create_job(job_id).await.unwrap();
    h.store
        .enqueue_batch(job_id, "copy:0", &batch_body(job_id, &site, &["Slow.bin"]))
        .await
        .unwrap();
    h.store.mark_planned(job_id).await.unwrap();

    let worker = h.worker.clone();
    let first = tokio::spawn(async move { worker.run_once().await });
    tokio::time::sleep(Duration::from_millis(250)).await;

    assert!(!h.worker.run_once().await.unwrap());
    assert!(first.await.unwrap().unwrap());
    assert_eq!(state(&h.store, job_id).await, JobState::Succeeded);
    assert_eq!(h.store.queue_depth().await.unwrap(), 0);
}
