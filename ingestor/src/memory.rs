use crate::errors::Result;
use crate::model::{Metric, MetricRecord};
use crate::store::{retention, MetricStore, Page};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::debug;

/// How often the memory store runs its retention sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// In-process metric store.
///
/// Like the database retention job, expiry runs as a periodic sweep: records
/// past the retention window stay readable until the next sweep, which any
/// access triggers once `sweep_interval` has elapsed.
#[derive(Debug)]
pub struct MemoryMetricStore {
    inner: Mutex<Inner>,
    sweep_interval: Duration,
}

#[derive(Debug)]
struct Inner {
    records: Vec<MetricRecord>,
    last_sweep: Instant,
}

impl Default for MemoryMetricStore {
    fn default() -> Self {
        Self::with_sweep_interval(SWEEP_INTERVAL)
    }
}

impl MemoryMetricStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sweep_interval(sweep_interval: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                records: Vec::new(),
                last_sweep: Instant::now(),
            }),
            sweep_interval,
        }
    }

    pub fn len(&self) -> usize {
        self.live().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every record past the retention window now.
    pub fn sweep(&self) -> usize {
        let mut inner = self.lock();
        Self::expire(&mut inner)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn live(&self) -> MutexGuard<'_, Inner> {
        let mut inner = self.lock();
        if inner.last_sweep.elapsed() >= self.sweep_interval {
            Self::expire(&mut inner);
        }
        inner
    }

    fn expire(inner: &mut Inner) -> usize {
        let cutoff = Utc::now() - retention();
        let before = inner.records.len();
        inner.records.retain(|r| r.timestamp_dt >= cutoff);
        inner.last_sweep = Instant::now();

        let expired = before - inner.records.len();
        if expired > 0 {
            debug!("Expired {} metric records", expired);
        }
        expired
    }

    fn select<F>(&self, page: Page, filter: F) -> Vec<MetricRecord>
    where
        F: Fn(&MetricRecord) -> bool,
    {
        let inner = self.live();

        // Later inserts come first among equal instants.
        let mut matched: Vec<&MetricRecord> = inner.records.iter().rev().filter(|r| filter(r)).collect();
        matched.sort_by(|a, b| b.timestamp_dt.cmp(&a.timestamp_dt));

        matched
            .into_iter()
            .skip(page.skip)
            .take(page.limit)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl MetricStore for MemoryMetricStore {
    async fn insert(&self, metric: &Metric) -> Result<()> {
        let record = MetricRecord::new(metric.clone(), Utc::now());
        self.live().records.push(record);
        Ok(())
    }

    async fn query_by_device(&self, device_id: &str, page: Page) -> Result<Vec<MetricRecord>> {
        Ok(self.select(page, |r| r.metric.device_id == device_id))
    }

    async fn query_by_device_for_owner(
        &self,
        device_id: &str,
        owner_id: i64,
        page: Page,
    ) -> Result<Vec<MetricRecord>> {
        Ok(self.select(page, |r| {
            r.metric.device_id == device_id && r.metric.owner_id == Some(owner_id)
        }))
    }

    async fn query_by_owner(&self, owner_id: i64, page: Page) -> Result<Vec<MetricRecord>> {
        Ok(self.select(page, |r| r.metric.owner_id == Some(owner_id)))
    }

    async fn query_by_type(&self, metric_type: &str, page: Page) -> Result<Vec<MetricRecord>> {
        Ok(self.select(page, |r| r.metric.metric_type == metric_type))
    }

    async fn query_by_type_for_owner(
        &self,
        metric_type: &str,
        owner_id: i64,
        page: Page,
    ) -> Result<Vec<MetricRecord>> {
        Ok(self.select(page, |r| {
            r.metric.metric_type == metric_type && r.metric.owner_id == Some(owner_id)
        }))
    }

    async fn latest(&self, device_id: &str) -> Result<Option<MetricRecord>> {
        Ok(self
            .select(Page { skip: 0, limit: 1 }, |r| r.metric.device_id == device_id)
            .into_iter()
            .next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MetricValue;
    use chrono::{Duration, SecondsFormat};
    use std::collections::HashSet;

    fn metric(device_id: &str, owner_id: Option<i64>, metric_type: &str, ts: &str) -> Metric {
        Metric {
            device_id: device_id.to_string(),
            owner_id,
            metric_type: metric_type.to_string(),
            value: Some(MetricValue::Scalar(1.0)),
            unit: String::new(),
            timestamp: ts.to_string(),
        }
    }

    fn ago(minutes: i64) -> String {
        (Utc::now() - Duration::minutes(minutes)).to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    #[tokio::test]
    async fn test_query_by_device_newest_first() {
        let store = MemoryMetricStore::new();
        store.insert(&metric("d1", Some(1), "light", &ago(30))).await.unwrap();
        store.insert(&metric("d1", Some(1), "light", &ago(10))).await.unwrap();
        store.insert(&metric("d1", Some(1), "light", &ago(20))).await.unwrap();
        store.insert(&metric("d2", Some(1), "light", &ago(1))).await.unwrap();

        let records = store.query_by_device("d1", Page::default()).await.unwrap();

        assert_eq!(records.len(), 3);
        assert!(records
            .windows(2)
            .all(|w| w[0].timestamp_dt >= w[1].timestamp_dt));
    }

    #[tokio::test]
    async fn test_latest_is_max_timestamp_not_last_insert() {
        let store = MemoryMetricStore::new();
        let newest = ago(5);
        store.insert(&metric("d1", None, "cpu", &newest)).await.unwrap();
        store.insert(&metric("d1", None, "cpu", &ago(60))).await.unwrap();

        let latest = store.latest("d1").await.unwrap().unwrap();
        assert_eq!(latest.metric.timestamp, newest);

        assert!(store.latest("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pagination_is_disjoint() {
        let store = MemoryMetricStore::new();
        for i in 0..120 {
            store.insert(&metric("d1", Some(1), "light", &ago(i))).await.unwrap();
        }

        let first = store.query_by_device("d1", Page::new(Some(0), Some(50))).await.unwrap();
        let second = store.query_by_device("d1", Page::new(Some(50), Some(50))).await.unwrap();

        assert_eq!(first.len(), 50);
        assert_eq!(second.len(), 50);
        let first_ts: HashSet<_> = first.iter().map(|r| r.metric.timestamp.clone()).collect();
        assert!(second.iter().all(|r| !first_ts.contains(&r.metric.timestamp)));
        assert!(first.last().unwrap().timestamp_dt >= second[0].timestamp_dt);
    }

    #[tokio::test]
    async fn test_expired_records_are_unreadable() {
        let store = MemoryMetricStore::with_sweep_interval(std::time::Duration::ZERO);
        let stale = (Utc::now() - Duration::days(8)).to_rfc3339();
        store.insert(&metric("d1", Some(1), "light", &stale)).await.unwrap();
        store.insert(&metric("d1", Some(1), "light", &ago(1))).await.unwrap();

        assert_eq!(store.query_by_device("d1", Page::default()).await.unwrap().len(), 1);
        assert!(store.query_by_owner(1, Page::default()).await.unwrap().iter().all(|r| r.metric.timestamp != stale));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_old_record_readable_until_sweep() {
        let store = MemoryMetricStore::new();
        store
            .insert(&metric("d1", Some(7), "temperature", "2026-01-01T00:00:00"))
            .await
            .unwrap();

        assert_eq!(store.query_by_device("d1", Page::default()).await.unwrap().len(), 1);
        assert!(store.latest("d1").await.unwrap().is_some());

        assert_eq!(store.sweep(), 1);
        assert!(store.latest("d1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_owner_and_type_filters() {
        let store = MemoryMetricStore::new();
        store.insert(&metric("d1", Some(7), "temperature", &ago(3))).await.unwrap();
        store.insert(&metric("d2", Some(9), "temperature", &ago(2))).await.unwrap();
        store.insert(&metric("d3", Some(7), "humidity", &ago(1))).await.unwrap();

        assert_eq!(store.query_by_owner(7, Page::default()).await.unwrap().len(), 2);
        assert_eq!(store.query_by_type("temperature", Page::default()).await.unwrap().len(), 2);

        let scoped = store
            .query_by_type_for_owner("temperature", 7, Page::default())
            .await
            .unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].metric.device_id, "d1");

        store.insert(&metric("d1", Some(9), "temperature", &ago(0))).await.unwrap();
        let device = store
            .query_by_device_for_owner("d1", 7, Page::default())
            .await
            .unwrap();
        assert_eq!(device.len(), 1);
        assert_eq!(device[0].metric.owner_id, Some(7));
    }
}
