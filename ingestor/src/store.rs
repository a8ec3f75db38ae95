use crate::errors::Result;
use crate::model::{Metric, MetricRecord};
use async_trait::async_trait;

/// Records whose `timestamp_dt` is older than this are removed by the store.
pub const RETENTION_SECS: i64 = 7 * 24 * 60 * 60;

pub const DEFAULT_LIMIT: usize = 50;
pub const MAX_LIMIT: usize = 1000;
/// Largest offset Postgres accepts (`BIGINT`).
pub const MAX_SKIP: usize = i64::MAX as usize;

pub fn retention() -> chrono::Duration {
    chrono::Duration::seconds(RETENTION_SECS)
}

/// Offset pagination over newest-first results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub skip: usize,
    pub limit: usize,
}

impl Page {
    pub fn new(skip: Option<usize>, limit: Option<usize>) -> Self {
        Self {
            skip: skip.unwrap_or(0).min(MAX_SKIP),
            limit: limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT),
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// Append-only, self-expiring storage for metric records.
///
/// Every query returns records newest first by `timestamp_dt`. Implementations
/// must accept concurrent inserts and enforce retention themselves.
#[async_trait]
pub trait MetricStore: Send + Sync {
    async fn insert(&self, metric: &Metric) -> Result<()>;

    async fn query_by_device(&self, device_id: &str, page: Page) -> Result<Vec<MetricRecord>>;

    /// Device scan restricted to the records attributed to one owner.
    async fn query_by_device_for_owner(
        &self,
        device_id: &str,
        owner_id: i64,
        page: Page,
    ) -> Result<Vec<MetricRecord>>;

    async fn query_by_owner(&self, owner_id: i64, page: Page) -> Result<Vec<MetricRecord>>;

    async fn query_by_type(&self, metric_type: &str, page: Page) -> Result<Vec<MetricRecord>>;

    /// Type scan restricted to the records attributed to one owner.
    async fn query_by_type_for_owner(
        &self,
        metric_type: &str,
        owner_id: i64,
        page: Page,
    ) -> Result<Vec<MetricRecord>>;

    async fn latest(&self, device_id: &str) -> Result<Option<MetricRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_defaults() {
        assert_eq!(Page::default(), Page { skip: 0, limit: 50 });
    }

    #[test]
    fn test_page_limit_is_capped() {
        assert_eq!(Page::new(Some(10), Some(5000)).limit, MAX_LIMIT);
    }

    #[test]
    fn test_page_skip_fits_bigint() {
        let page = Page::new(Some(usize::MAX), None);
        assert_eq!(page.skip, MAX_SKIP);
        assert!(i64::try_from(page.skip).is_ok());
    }

    #[test]
    fn test_retention_is_seven_days() {
        assert_eq!(retention().num_days(), 7);
    }
}
