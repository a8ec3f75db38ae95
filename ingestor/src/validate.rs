use crate::errors::{Error, Result};
use crate::model::{Metric, MetricValue};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Normalizes an inbound broker payload into a [`Metric`].
///
/// Only `device_id` and the metric type (`metric_type`, or its synonym `type`)
/// are required. Everything else falls back to a default: a missing or
/// non-integer `owner_id` becomes `None`, a missing unit becomes empty and a
/// missing timestamp becomes `now`.
pub fn normalize(payload: &Value, now: DateTime<Utc>) -> Result<Metric> {
    let fields = payload
        .as_object()
        .ok_or_else(|| Error::Validation("Payload is not a JSON object".to_string()))?;

    let device_id = text_field(fields, "device_id")
        .ok_or_else(|| Error::Validation("Missing device_id".to_string()))?;

    let metric_type = text_field(fields, "metric_type")
        .or_else(|| text_field(fields, "type"))
        .ok_or_else(|| Error::Validation(format!("Missing metric type for device {}", device_id)))?;

    let timestamp = fields
        .get("timestamp")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| now.to_rfc3339_opts(SecondsFormat::Micros, true));

    Ok(Metric {
        device_id,
        owner_id: fields.get("owner_id").and_then(coerce_owner),
        metric_type,
        value: fields.get("value").and_then(coerce_value),
        unit: fields
            .get("unit")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        timestamp,
    })
}

fn text_field(fields: &Map<String, Value>, key: &str) -> Option<String> {
    match fields.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn coerce_owner(raw: &Value) -> Option<i64> {
    match raw {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn coerce_value(raw: &Value) -> Option<MetricValue> {
    match raw {
        Value::Number(n) => n.as_f64().map(MetricValue::Scalar),
        Value::Object(parts) => {
            let parts: Option<BTreeMap<String, f64>> = parts
                .iter()
                .map(|(name, v)| v.as_f64().map(|f| (name.clone(), f)))
                .collect();
            parts.filter(|p| !p.is_empty()).map(MetricValue::Composite)
        }
        _ => None,
    }
}
