use crate::errors::{Error, Result};
use crate::metrics::STORE_FAILURES_TOTAL;
use crate::model::{Metric, MetricRecord, MetricValue};
use crate::store::{MetricStore, Page};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use std::time::Duration;
use tracing::{error, info, warn};

const SELECT_COLUMNS: &str =
    r#"SELECT device_id, owner_id, metric_type, value, unit, "timestamp", timestamp_dt FROM metrics"#;

pub async fn make_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

/// Metric store backed by a TimescaleDB hypertable.
///
/// Retention is a server-side policy installed by the migrations; this type
/// never deletes rows.
#[derive(Debug, Clone)]
pub struct PgMetricStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct MetricRow {
    device_id: String,
    owner_id: Option<i64>,
    metric_type: String,
    value: Option<Json<MetricValue>>,
    unit: String,
    timestamp: String,
    timestamp_dt: DateTime<Utc>,
}

impl From<MetricRow> for MetricRecord {
    fn from(row: MetricRow) -> Self {
        Self {
            metric: Metric {
                device_id: row.device_id,
                owner_id: row.owner_id,
                metric_type: row.metric_type,
                value: row.value.map(|Json(v)| v),
                unit: row.unit,
                timestamp: row.timestamp,
            },
            timestamp_dt: row.timestamp_dt,
        }
    }
}

impl PgMetricStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_inner(&self, record: &MetricRecord) -> Result<()> {
        let m = &record.metric;
        sqlx::query(
            r#"
            INSERT INTO metrics (device_id, owner_id, metric_type, value, unit, "timestamp", timestamp_dt)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&m.device_id)
        .bind(m.owner_id)
        .bind(&m.metric_type)
        .bind(m.value.as_ref().map(Json))
        .bind(&m.unit)
        .bind(&m.timestamp)
        .bind(record.timestamp_dt)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fetch_page(&self, filter: &str, bind: Filter<'_>, page: Page) -> Result<Vec<MetricRecord>> {
        let query = format!(
            "{} WHERE {} ORDER BY timestamp_dt DESC OFFSET {} LIMIT {}",
            SELECT_COLUMNS, filter, page.skip, page.limit
        );

        let mut builder = sqlx::query_as::<_, MetricRow>(&query);
        builder = match bind {
            Filter::Text(v) => builder.bind(v),
            Filter::Owner(v) => builder.bind(v),
            Filter::TextAndOwner(t, o) => builder.bind(t).bind(o),
        };

        let rows = builder.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(MetricRecord::from).collect())
    }
}

enum Filter<'a> {
    Text(&'a str),
    Owner(i64),
    TextAndOwner(&'a str, i64),
}

#[async_trait]
impl MetricStore for PgMetricStore {
    async fn insert(&self, metric: &Metric) -> Result<()> {
        let record = MetricRecord::new(metric.clone(), Utc::now());

        let mut attempts = 0;
        let max_attempts = 5;

        loop {
            attempts += 1;
            match self.insert_inner(&record).await {
                Ok(()) => return Ok(()),
                Err(Error::Database(db_err)) if attempts < max_attempts && is_transient_error(&db_err) => {
                    let wait_ms = 100 * 2_u64.pow(attempts - 1).min(32);
                    warn!(
                        "Metric insert failed (attempt {}/{}), retrying in {}ms: {}",
                        attempts, max_attempts, wait_ms, db_err
                    );
                    STORE_FAILURES_TOTAL.inc();
                    tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                }
                Err(e) => {
                    error!(
                        "Metric insert for {} failed permanently after {} attempts: {}",
                        record.metric.device_id, attempts, e
                    );
                    return Err(e);
                }
            }
        }
    }

    async fn query_by_device(&self, device_id: &str, page: Page) -> Result<Vec<MetricRecord>> {
        self.fetch_page("device_id = $1", Filter::Text(device_id), page).await
    }

    async fn query_by_device_for_owner(
        &self,
        device_id: &str,
        owner_id: i64,
        page: Page,
    ) -> Result<Vec<MetricRecord>> {
        self.fetch_page(
            "device_id = $1 AND owner_id = $2",
            Filter::TextAndOwner(device_id, owner_id),
            page,
        )
        .await
    }

    async fn query_by_owner(&self, owner_id: i64, page: Page) -> Result<Vec<MetricRecord>> {
        self.fetch_page("owner_id = $1", Filter::Owner(owner_id), page).await
    }

    async fn query_by_type(&self, metric_type: &str, page: Page) -> Result<Vec<MetricRecord>> {
        self.fetch_page("metric_type = $1", Filter::Text(metric_type), page).await
    }

    async fn query_by_type_for_owner(
        &self,
        metric_type: &str,
        owner_id: i64,
        page: Page,
    ) -> Result<Vec<MetricRecord>> {
        self.fetch_page(
            "metric_type = $1 AND owner_id = $2",
            Filter::TextAndOwner(metric_type, owner_id),
            page,
        )
        .await
    }

    async fn latest(&self, device_id: &str) -> Result<Option<MetricRecord>> {
        let mut records = self
            .fetch_page("device_id = $1", Filter::Text(device_id), Page { skip: 0, limit: 1 })
            .await?;
        Ok(records.pop())
    }
}

fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => {
            // Check if it's a connection-related error
            db_err.code().is_some_and(|code| {
                code == "08000" || // connection_exception
                code == "08003" || // connection_does_not_exist
                code == "08006" || // connection_failure
                code == "57P03" || // cannot_connect_now
                code == "53300" // too_many_connections
            })
        }
        _ => false,
    }
}
