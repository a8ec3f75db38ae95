use crate::errors::{Error, Result};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;

    fn is_connected(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub retries: u32,
    pub delay: Duration,
}

pub struct MqttTransport {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    stop: CancellationToken,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl MqttTransport {
    /// Connects to the broker, giving up after `retries` failed attempts.
    ///
    /// Once the first connection is up, the event loop keeps running in the
    /// background and reconnects on its own.
    pub async fn connect(options: ConnectOptions) -> Result<Self> {
        let mut mqtt_options = MqttOptions::new(&options.client_id, &options.host, options.port);
        mqtt_options.set_keep_alive(Duration::from_secs(30));
        mqtt_options.set_clean_session(true);

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, 1000);

        info!("Connecting to MQTT broker at {}:{}", options.host, options.port);

        let mut attempts = 0;
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => break,
                Ok(_) => {}
                Err(e) => {
                    attempts += 1;
                    if attempts >= options.retries {
                        return Err(Error::BrokerUnavailable { attempts, source: e });
                    }
                    warn!(
                        "MQTT connect attempt {}/{} failed: {}. Retrying in {:?}",
                        attempts, options.retries, e, options.delay
                    );
                    tokio::time::sleep(options.delay).await;
                }
            }
        }

        info!("Connected to MQTT broker after {} failed attempts", attempts);

        let connected = Arc::new(AtomicBool::new(true));
        let stop = CancellationToken::new();
        let pump = tokio::spawn(pump(
            eventloop,
            client.clone(),
            connected.clone(),
            stop.clone(),
            options.delay,
        ));

        Ok(Self {
            client,
            connected,
            stop,
            pump: Mutex::new(Some(pump)),
        })
    }

    /// Sends the disconnect packet and waits for the event loop to finish.
    pub async fn disconnect(&self) {
        self.stop.cancel();
        if let Some(pump) = self.pump.lock().await.take() {
            if let Err(e) = pump.await {
                error!("MQTT event loop task failed: {}", e);
            }
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::Disconnected);
        }
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

async fn pump(
    mut eventloop: EventLoop,
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    stop: CancellationToken,
    retry_delay: Duration,
) {
    loop {
        let event = tokio::select! {
            _ = stop.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("Reconnected to MQTT broker");
                connected.store(true, Ordering::SeqCst);
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                debug!("Publish {} acknowledged", ack.pkid);
            }
            Ok(_) => {}
            Err(e) => {
                if connected.swap(false, Ordering::SeqCst) {
                    warn!("Lost MQTT connection: {}", e);
                }
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(retry_delay) => {}
                }
            }
        }
    }

    if !connected.swap(false, Ordering::SeqCst) {
        return;
    }

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
