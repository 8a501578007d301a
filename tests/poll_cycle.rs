//! Integration tests for full polling cycles against a mock upstream.
//!
//! Each test starts its own wiremock server and gets its own cache
//! directory under the system temp dir, removed at the end.

use feedwarden::content::{CachePolicy, HttpTransport, ResourceCache, RetryPolicy, RetryingDownloader};
use feedwarden::feed::{FeedFetcher, FetchErrorKind, HttpJsonSource, HttpMethod};
use feedwarden::storage::{Database, WatermarkStore};
use feedwarden::{Engine, Subscription, SubscriptionKey};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn cache_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("feedwarden_poll_test_{name}_{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn test_engine(dir: &Path, watermarks: Arc<WatermarkStore>) -> Engine {
    let client = reqwest::Client::new();
    let transport = HttpTransport::new(client, Duration::from_secs(5), 1024 * 1024);
    let downloader = RetryingDownloader::new(
        Arc::new(transport),
        RetryPolicy {
            max_retries: 1,
            backoff_base: Duration::from_millis(10),
        },
    );
    let cache = ResourceCache::new(CachePolicy::new(dir), downloader, CancellationToken::new());
    Engine::new(watermarks, cache, FeedFetcher::new(Duration::from_secs(5)))
}

/// A room-message style subscription: POST, `{status, content: {message: [..]}}`.
fn room(server: &MockServer, name: &str) -> Subscription {
    let source = HttpJsonSource::new(reqwest::Client::new(), format!("{}/{name}", server.uri()))
        .method(HttpMethod::Post)
        .body(r#"{"limit":100}"#)
        .items_at("/content/message")
        .time_field("msgTime")
        .resource_fields(["bodys/url"])
        .status_check("/status", 200);
    Subscription::new("room", SubscriptionKey::scoped(name, "group-1"), Arc::new(source))
}

fn messages(times: &[i64]) -> Value {
    let message: Vec<Value> = times
        .iter()
        .map(|t| json!({ "msgTime": t, "text": format!("at {t}") }))
        .collect();
    json!({ "status": 200, "message": "ok", "content": { "message": message } })
}

async fn serve(server: &MockServer, name: &str, body: Value) {
    Mock::given(method("POST"))
        .and(path(format!("/{name}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

// ============================================================================
// Watermark Behavior
// ============================================================================

#[tokio::test]
async fn test_first_poll_delivers_no_backlog() {
    let server = MockServer::start().await;
    let dir = cache_dir("backlog");
    let engine = test_engine(&dir, Arc::new(WatermarkStore::in_memory()));
    let sub = room(&server, "room-a");
    serve(&server, "room-a", messages(&[1_000, 3_000, 2_000])).await;

    let items = engine.poll_at(&sub, 5_000).await.unwrap();

    assert!(items.is_empty());
    assert_eq!(engine.watermarks().get(&sub.key), Some(5_000));
    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_new_items_arrive_once_in_order() {
    let server = MockServer::start().await;
    let dir = cache_dir("once");
    let engine = test_engine(&dir, Arc::new(WatermarkStore::in_memory()));
    let sub = room(&server, "room-a");

    Mock::given(method("POST"))
        .and(path("/room-a"))
        .respond_with(ResponseTemplate::new(200).set_body_json(messages(&[900])))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    // Out of upstream order on purpose.
    serve(&server, "room-a", messages(&[1_200, 900, 1_500, 1_100])).await;

    assert!(engine.poll_at(&sub, 1_000).await.unwrap().is_empty());

    let second: Vec<i64> = engine
        .poll_at(&sub, 2_000)
        .await
        .unwrap()
        .iter()
        .map(|i| i.timestamp_ms)
        .collect();
    assert_eq!(second, vec![1_100, 1_200, 1_500]);

    // Same upstream batch again: nothing is replayed.
    assert!(engine.poll_at(&sub, 3_000).await.unwrap().is_empty());
    assert_eq!(engine.watermarks().get(&sub.key), Some(1_500));
    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_auth_envelope_leaves_state_untouched() {
    let server = MockServer::start().await;
    let dir = cache_dir("auth");
    let engine = test_engine(&dir, Arc::new(WatermarkStore::in_memory()));
    let sub = room(&server, "room-a");
    serve(
        &server,
        "room-a",
        json!({ "status": 401, "message": "非法授权", "content": null }),
    )
    .await;

    let err = engine.poll_at(&sub, 1_000).await.unwrap_err();

    assert_eq!(err.kind(), FetchErrorKind::Auth);
    assert_eq!(engine.watermarks().get(&sub.key), None);
    std::fs::remove_dir_all(&dir).ok();
}

// ============================================================================
// Cycles Across Subscriptions
// ============================================================================

#[tokio::test]
async fn test_cycle_merges_subscriptions_by_time() {
    let server = MockServer::start().await;
    let dir = cache_dir("merge");
    let engine = test_engine(&dir, Arc::new(WatermarkStore::in_memory()));
    let a = room(&server, "room-a");
    let b = room(&server, "room-b");
    serve(&server, "room-a", messages(&[10, 30])).await;
    serve(&server, "room-b", messages(&[40, 20])).await;
    engine.watermarks().advance(&a.key, 5);
    engine.watermarks().advance(&b.key, 5);

    let report = engine.run_cycle(&[a.clone(), b.clone()]).await;

    assert!(report.failures.is_empty());
    assert_eq!(report.batch.timestamps(), vec![10, 20, 30, 40]);
    let owners: Vec<&SubscriptionKey> = report.batch.items.iter().map(|i| &i.source_key).collect();
    assert_eq!(owners, vec![&a.key, &b.key, &a.key, &b.key]);
    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_transient_failure_is_isolated() {
    let server = MockServer::start().await;
    let dir = cache_dir("isolated");
    let engine = test_engine(&dir, Arc::new(WatermarkStore::in_memory()));
    let a = room(&server, "room-a");
    let b = room(&server, "room-b");
    Mock::given(method("POST"))
        .and(path("/room-a"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    serve(&server, "room-b", messages(&[20, 40])).await;
    engine.watermarks().advance(&a.key, 5);
    engine.watermarks().advance(&b.key, 5);

    let report = engine.run_cycle(&[a.clone(), b.clone()]).await;

    assert_eq!(report.polled, 2);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].key, a.key);
    assert_eq!(report.failures[0].kind(), FetchErrorKind::Transient);
    assert_eq!(report.batch.timestamps(), vec![20, 40]);
    assert_eq!(engine.watermarks().get(&a.key), Some(5));
    assert_eq!(engine.watermarks().get(&b.key), Some(40));
    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_malformed_batch_is_dropped() {
    let server = MockServer::start().await;
    let dir = cache_dir("malformed");
    let engine = test_engine(&dir, Arc::new(WatermarkStore::in_memory()));
    let a = room(&server, "room-a");
    Mock::given(method("POST"))
        .and(path("/room-a"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
        .mount(&server)
        .await;
    engine.watermarks().advance(&a.key, 5);

    let report = engine.run_cycle(std::slice::from_ref(&a)).await;

    assert_eq!(report.failures[0].kind(), FetchErrorKind::Malformed);
    assert!(report.batch.is_empty());
    assert_eq!(engine.watermarks().get(&a.key), Some(5));
    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_cycle_attaches_cached_resources() {
    let server = MockServer::start().await;
    let dir = cache_dir("resources");
    let engine = test_engine(&dir, Arc::new(WatermarkStore::in_memory()));
    let a = room(&server, "room-a");
    let image_url = format!("{}/img/1.png", server.uri());
    serve(
        &server,
        "room-a",
        json!({
            "status": 200,
            "content": { "message": [
                { "msgTime": 50, "bodys": { "url": image_url } },
                { "msgTime": 60, "bodys": { "url": image_url } },
            ]}
        }),
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/img/1.png"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0x89, b'P', b'N', b'G']))
        .expect(1)
        .mount(&server)
        .await;
    engine.watermarks().advance(&a.key, 10);

    let report = engine.run_cycle(std::slice::from_ref(&a)).await;

    assert_eq!(report.unresolved_resources, 0);
    assert_eq!(report.batch.len(), 2);
    for item in &report.batch.items {
        let handle = item.resources[0].local.as_ref().unwrap();
        assert_eq!(handle.size, 4);
        assert!(handle.path.exists());
    }
    std::fs::remove_dir_all(&dir).ok();
}

// ============================================================================
// Restart
// ============================================================================

#[tokio::test]
async fn test_resume_continues_from_persisted_watermark() {
    let server = MockServer::start().await;
    let dir = cache_dir("resume");
    let db = Database::open(":memory:").await.unwrap();
    let sub = room(&server, "room-a");
    serve(&server, "room-a", messages(&[1_100, 1_300])).await;

    {
        let store = Arc::new(WatermarkStore::resume(db.clone()).await.unwrap());
        let engine = test_engine(&dir, store.clone());
        engine.watermarks().advance(&sub.key, 1_000);
        let items = engine.poll_at(&sub, 2_000).await.unwrap();
        assert_eq!(items.len(), 2);
        store.flush().await;
    }

    // A fresh process resumes at 1_300 instead of bootstrapping to "now".
    let store = Arc::new(WatermarkStore::resume(db).await.unwrap());
    let engine = test_engine(&dir, store);
    assert_eq!(engine.watermarks().get(&sub.key), Some(1_300));
    assert!(engine.poll_at(&sub, 9_000).await.unwrap().is_empty());
    assert_eq!(engine.watermarks().get(&sub.key), Some(1_300));
    std::fs::remove_dir_all(&dir).ok();
}
