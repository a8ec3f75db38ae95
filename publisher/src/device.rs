use crate::errors::Result;
use async_trait::async_trait;
use sqlx::PgPool;
use std::fmt;

/// Root of every device topic. The ingestor subscribes to `{TOPIC_ROOT}/#`.
pub const TOPIC_ROOT: &str = "cloud-security-iot";
/// Lifecycle events live outside the telemetry namespace.
pub const EVENTS_ROOT: &str = "cloud-security-iot-events";

const MAX_DEVICES: i64 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceKind {
    Temperature,
    Humidity,
    Pressure,
    Light,
    System,
    Other(String),
}

impl DeviceKind {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "temperature" => Self::Temperature,
            "humidity" => Self::Humidity,
            "pressure" => Self::Pressure,
            "light" => Self::Light,
            "system" => Self::System,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
            Self::Pressure => "pressure",
            Self::Light => "light",
            Self::System => "system",
            Self::Other(other) => other,
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub device_id: String,
    pub name: String,
    pub kind: DeviceKind,
    pub location: Option<String>,
    pub status: String,
    pub owner_id: Option<i64>,
}

impl Device {
    pub fn is_active(&self) -> bool {
        self.status.eq_ignore_ascii_case("active")
    }

    /// Host devices and sensors publish under different namespace segments.
    pub fn topic(&self) -> String {
        match self.kind {
            DeviceKind::System => format!("{}/system/metrics/{}", TOPIC_ROOT, self.device_id),
            _ => format!("{}/iot/{}/{}", TOPIC_ROOT, self.kind, self.device_id),
        }
    }

    pub fn events_topic(&self) -> String {
        format!("{}/{}", EVENTS_ROOT, self.device_id)
    }
}

/// Source of the devices to publish for.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    async fn list_devices(&self) -> Result<Vec<Device>>;
}

/// Reads the device-management service's table.
pub struct PgDeviceDirectory {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct DeviceRow {
    device_id: String,
    name: String,
    kind: String,
    location: Option<String>,
    status: String,
    owner_id: Option<i64>,
}

impl PgDeviceDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeviceDirectory for PgDeviceDirectory {
    async fn list_devices(&self) -> Result<Vec<Device>> {
        let rows = sqlx::query_as::<_, DeviceRow>(
            r#"
            SELECT device_id, name, type::text AS kind, location, status::text AS status,
                   owner_id::bigint AS owner_id
            FROM t_devices
            ORDER BY id
            LIMIT $1
            "#,
        )
        .bind(MAX_DEVICES)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| Device {
                device_id: row.device_id,
                name: row.name,
                kind: DeviceKind::parse(&row.kind),
                location: row.location,
                status: row.status,
                owner_id: row.owner_id,
            })
            .collect())
    }
}

/// Synthetic fleet for running without the device-management database.
pub struct FleetDirectory {
    devices: Vec<Device>,
}

impl FleetDirectory {
    pub fn new(size: usize) -> Self {
        const KINDS: [DeviceKind; 5] = [
            DeviceKind::Temperature,
            DeviceKind::Humidity,
            DeviceKind::Pressure,
            DeviceKind::Light,
            DeviceKind::System,
        ];

        let devices = (0..size)
            .map(|n| {
                let kind = KINDS[n % KINDS.len()].clone();
                Device {
                    device_id: format!("dev-{}", n),
                    name: format!("{} {}", kind, n),
                    kind,
                    location: None,
                    status: "active".to_string(),
                    owner_id: Some((n % 5) as i64 + 1),
                }
            })
            .collect();

        Self { devices }
    }
}

#[async_trait]
impl DeviceDirectory for FleetDirectory {
    async fn list_devices(&self) -> Result<Vec<Device>> {
        Ok(self.devices.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(kind: &str) -> Device {
        Device {
            device_id: "abc".to_string(),
            name: "n".to_string(),
            kind: DeviceKind::parse(kind),
            location: None,
            status: "active".to_string(),
            owner_id: Some(1),
        }
    }

    #[test]
    fn test_topics_by_kind() {
        assert_eq!(device("system").topic(), "cloud-security-iot/system/metrics/abc");
        assert_eq!(device("humidity").topic(), "cloud-security-iot/iot/humidity/abc");
        assert_eq!(device("sonar").topic(), "cloud-security-iot/iot/sonar/abc");
        assert_eq!(device("light").events_topic(), "cloud-security-iot-events/abc");
    }

    #[test]
    fn test_status_check() {
        let mut d = device("light");
        assert!(d.is_active());
        d.status = "inactive".to_string();
        assert!(!d.is_active());
    }

    #[test]
    fn test_fleet_cycles_kinds() {
        let fleet = tokio_test::block_on(FleetDirectory::new(7).list_devices()).unwrap();
        assert_eq!(fleet.len(), 7);
        assert_eq!(fleet[4].kind, DeviceKind::System);
        assert_eq!(fleet[5].kind, DeviceKind::Temperature);
        assert!(fleet.iter().all(Device::is_active));
    }
}
