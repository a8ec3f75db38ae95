use crate::device::{Device, DeviceKind};
use crate::sampler::{HostSample, SystemSelection};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReadingValue {
    Scalar(f64),
    Composite(BTreeMap<String, f64>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub value: ReadingValue,
    pub unit: &'static str,
}

/// One device reading as published on the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Telemetry {
    pub device_id: String,
    pub owner_id: Option<i64>,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub value: ReadingValue,
    pub unit: String,
    pub status: String,
    pub location: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Telemetry {
    pub fn new(device: &Device, reading: Reading) -> Self {
        Self {
            device_id: device.device_id.clone(),
            owner_id: device.owner_id,
            name: device.name.clone(),
            kind: device.kind.to_string(),
            value: reading.value,
            unit: reading.unit.to_string(),
            status: device.status.clone(),
            location: device.location.clone(),
            timestamp: Utc::now(),
        }
    }
}

/// Produces a device's value for this cycle. System devices all report the
/// cycle's shared host sample.
pub fn synthesize(
    kind: &DeviceKind,
    host: &HostSample,
    selection: SystemSelection,
    rng: &mut impl Rng,
) -> Reading {
    let (value, unit) = match kind {
        DeviceKind::Temperature => (ReadingValue::Scalar(round2(rng.gen_range(15.0..=30.0))), "°C"),
        DeviceKind::Humidity => (ReadingValue::Scalar(round2(rng.gen_range(30.0..=80.0))), "%"),
        DeviceKind::Pressure => (ReadingValue::Scalar(round2(rng.gen_range(1000.0..=1050.0))), "hPa"),
        DeviceKind::Light => (ReadingValue::Scalar(round2(rng.gen_range(0.0..=100.0))), "%"),
        DeviceKind::System => (host.value(selection), "%"),
        DeviceKind::Other(_) => (ReadingValue::Scalar(0.0), ""),
    };

    Reading { value, unit }
}

pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
