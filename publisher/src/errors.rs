use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("MQTT broker unreachable after {attempts} attempts: {source}")]
    BrokerUnavailable {
        attempts: u32,
        source: rumqttc::ConnectionError,
    },

    #[error("Broker link is down")]
    Disconnected,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
