use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::{Duration, SecondsFormat, Utc};
use ingestor::errors::Result;
use ingestor::memory::MemoryMetricStore;
use ingestor::model::{Metric, MetricRecord, MetricValue};
use ingestor::rest::create_router;
use ingestor::store::{MetricStore, Page};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tower::ServiceExt;

/// Wraps the memory store and counts every read reaching it.
#[derive(Default)]
struct CountingStore {
    inner: MemoryMetricStore,
    reads: AtomicUsize,
}

impl CountingStore {
    fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn read(&self) {
        self.reads.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl MetricStore for CountingStore {
    async fn insert(&self, metric: &Metric) -> Result<()> {
        self.inner.insert(metric).await
    }

    async fn query_by_device(&self, device_id: &str, page: Page) -> Result<Vec<MetricRecord>> {
        self.read();
        self.inner.query_by_device(device_id, page).await
    }

    async fn query_by_device_for_owner(
        &self,
        device_id: &str,
        owner_id: i64,
        page: Page,
    ) -> Result<Vec<MetricRecord>> {
        self.read();
        self.inner
            .query_by_device_for_owner(device_id, owner_id, page)
            .await
    }

    async fn query_by_owner(&self, owner_id: i64, page: Page) -> Result<Vec<MetricRecord>> {
        self.read();
        self.inner.query_by_owner(owner_id, page).await
    }

    async fn query_by_type(&self, metric_type: &str, page: Page) -> Result<Vec<MetricRecord>> {
        self.read();
        self.inner.query_by_type(metric_type, page).await
    }

    async fn query_by_type_for_owner(
        &self,
        metric_type: &str,
        owner_id: i64,
        page: Page,
    ) -> Result<Vec<MetricRecord>> {
        self.read();
        self.inner
            .query_by_type_for_owner(metric_type, owner_id, page)
            .await
    }

    async fn latest(&self, device_id: &str) -> Result<Option<MetricRecord>> {
        self.read();
        self.inner.latest(device_id).await
    }
}

fn metric(device_id: &str, owner_id: i64, metric_type: &str, minutes_ago: i64) -> Metric {
    Metric {
        device_id: device_id.to_string(),
        owner_id: Some(owner_id),
        metric_type: metric_type.to_string(),
        value: Some(MetricValue::Scalar(minutes_ago as f64)),
        unit: "%".to_string(),
        timestamp: (Utc::now() - Duration::minutes(minutes_ago))
            .to_rfc3339_opts(SecondsFormat::Secs, true),
    }
}

async fn seeded() -> (Router, Arc<CountingStore>) {
    let store = Arc::new(CountingStore::default());
    for i in 0..60 {
        store.insert(&metric("d7", 7, "light", i)).await.unwrap();
    }
    store.insert(&metric("d9", 9, "light", 1)).await.unwrap();
    store.insert(&metric("d9", 9, "humidity", 2)).await.unwrap();
    (create_router(store.clone()), store)
}

async fn get(app: &Router, uri: &str, user: Option<(i64, bool)>) -> (StatusCode, Value) {
    let mut request = Request::builder().uri(uri);
    if let Some((id, admin)) = user {
        request = request
            .header("x-user-id", id.to_string())
            .header("x-user-admin", admin.to_string());
    }

    let response = app
        .clone()
        .oneshot(request.body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_missing_identity_is_unauthorized() {
    let (app, _) = seeded().await;
    let (status, body) = get(&app, "/metrics/owner/7", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["detail"].is_string());
}

#[tokio::test]
async fn test_non_admin_other_owner_rejected_before_store() {
    let (app, store) = seeded().await;

    let (status, _) = get(&app, "/metrics/owner/9", Some((7, false))).await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(store.reads(), 0);
}

#[tokio::test]
async fn test_owner_scope_for_self_and_admin() {
    let (app, _) = seeded().await;

    let (status, body) = get(&app, "/metrics/owner/7", Some((7, false))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 50);

    let (status, body) = get(&app, "/metrics/owner/9", Some((1, true))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_device_pagination_is_stable() {
    let (app, _) = seeded().await;

    let (_, first) = get(&app, "/metrics/device/d7?skip=0&limit=50", Some((7, false))).await;
    let (_, second) = get(&app, "/metrics/device/d7?skip=50&limit=50", Some((7, false))).await;
    let first = first.as_array().unwrap();
    let second = second.as_array().unwrap();

    assert_eq!(first.len(), 50);
    assert_eq!(second.len(), 10);
    assert!(second.iter().all(|r| !first.contains(r)));
    // Newest first: values are minutes ago, so they increase down the pages.
    assert_eq!(first[0]["value"], 0.0);
    assert_eq!(second[0]["value"], 50.0);
}

#[tokio::test]
async fn test_device_of_other_owner_forbidden() {
    let (app, _) = seeded().await;

    let (status, _) = get(&app, "/metrics/device/d9", Some((7, false))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = get(&app, "/metrics/device/unknown", Some((7, false))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_device_hides_previous_owner_records() {
    let store = Arc::new(CountingStore::default());
    store.insert(&metric("d1", 9, "light", 30)).await.unwrap();
    store.insert(&metric("d1", 9, "light", 20)).await.unwrap();
    store.insert(&metric("d1", 7, "light", 10)).await.unwrap();
    let app = create_router(store);

    let (status, body) = get(&app, "/metrics/device/d1", Some((7, false))).await;
    assert_eq!(status, StatusCode::OK);
    let records = body.as_array().unwrap();
    assert_eq!(records.len(), 1);
    assert!(records.iter().all(|r| r["owner_id"] == 7));

    let (_, body) = get(&app, "/metrics/device/d1", Some((1, true))).await;
    assert_eq!(body.as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_latest_rules() {
    let (app, _) = seeded().await;

    let (status, body) = get(&app, "/metrics/latest/d7", Some((7, false))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["device_id"], "d7");
    assert_eq!(body["value"], 0.0);

    let (status, _) = get(&app, "/metrics/latest/d9", Some((7, false))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = get(&app, "/metrics/latest/nothing", Some((1, true))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_type_scope_is_owner_restricted_for_users() {
    let (app, _) = seeded().await;

    let (_, mine) = get(&app, "/metrics/type/light?limit=100", Some((7, false))).await;
    assert_eq!(mine.as_array().unwrap().len(), 60);
    assert!(mine.as_array().unwrap().iter().all(|r| r["owner_id"] == 7));

    let (_, all) = get(&app, "/metrics/type/light?limit=100", Some((1, true))).await;
    assert_eq!(all.as_array().unwrap().len(), 61);
}
