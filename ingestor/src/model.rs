use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Measured value of a metric.
///
/// Sensors report a single number. System devices sampling several
/// sub-metrics in one reading report a map of sub-metric name to number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Scalar(f64),
    Composite(BTreeMap<String, f64>),
}

/// Canonical telemetry record, as normalized from an inbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub device_id: String,
    pub owner_id: Option<i64>,
    pub metric_type: String,
    pub value: Option<MetricValue>,
    pub unit: String,
    pub timestamp: String,
}

/// A stored metric together with its store-native instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    #[serde(flatten)]
    pub metric: Metric,
    pub timestamp_dt: DateTime<Utc>,
}

impl MetricRecord {
    /// Derives `timestamp_dt` from the metric's own timestamp, falling back to
    /// `ingested_at` when it cannot be parsed. The timestamp string is kept as-is.
    pub fn new(metric: Metric, ingested_at: DateTime<Utc>) -> Self {
        let timestamp_dt = parse_timestamp(&metric.timestamp).unwrap_or(ingested_at);
        Self {
            metric,
            timestamp_dt,
        }
    }
}

/// Parses the ISO-8601 shapes publishers send. Naive timestamps are UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }

    let naive = raw.strip_suffix('Z').unwrap_or(raw);
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(naive, format) {
            return Some(dt.and_utc());
        }
    }

    NaiveDate::parse_from_str(naive, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}
