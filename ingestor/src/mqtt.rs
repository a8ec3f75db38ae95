use crate::consumer::{Consumer, Outcome};
use crate::errors::Result;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    /// Wildcard covering every device topic.
    pub topic_filter: String,
    pub retry_delay: Duration,
}

/// Runs the ingestion loop until `shutdown` is cancelled.
///
/// Broker connection failures are retried forever at a fixed delay; without
/// the broker there is nothing to ingest. The subscription is renewed on every
/// (re)connection. Each delivered message is handled to completion before the
/// next poll, so cancellation never interrupts a store write.
pub async fn run_mqtt(
    config: BrokerConfig,
    consumer: Consumer,
    shutdown: CancellationToken,
) -> Result<()> {
    info!("Connecting to MQTT broker at {}:{}", config.host, config.port);

    let mut mqtt_options = MqttOptions::new(&config.client_id, &config.host, config.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 10000);
    let mut failures: u64 = 0;

    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("Connected to MQTT broker after {} failed attempts", failures);
                failures = 0;
                if let Err(e) = client.try_subscribe(&config.topic_filter, QoS::AtLeastOnce) {
                    error!("Failed to subscribe to {}: {}", config.topic_filter, e);
                }
            }
            Ok(Event::Incoming(Packet::SubAck(_))) => {
                info!("Subscribed to {} with QoS 1", config.topic_filter);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if consumer.handle(&publish.topic, &publish.payload).await == Outcome::Rejected {
                    debug!("Message on {} rejected", publish.topic);
                }
            }
            Ok(_) => {}
            Err(e) => {
                failures += 1;
                warn!(
                    "MQTT connection error (attempt {}): {}. Retrying in {:?}",
                    failures, e, config.retry_delay
                );
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(config.retry_delay) => {}
                }
            }
        }
    }

    info!("Disconnecting from MQTT broker");
    disconnect(&client, &mut eventloop).await;
    Ok(())
}

pub(crate) async fn disconnect(client: &AsyncClient, eventloop: &mut EventLoop) {
    if let Err(e) = client.try_disconnect() {
        error!("Failed to request MQTT disconnect: {}", e);
        return;
    }

    let flushed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;

    if flushed.is_err() {
        warn!("Timed out waiting for MQTT disconnect");
    }
}
