use crate::errors::{Error, Result};
use crate::fanout::hub::ViewerHub;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Shared relay between replicas.
///
/// Anything published on the backbone by any replica is delivered to the
/// viewer hub of every replica attached to it, the publisher's own included.
#[async_trait]
pub trait Backbone: Send + Sync {
    async fn publish(&self, payload: Vec<u8>) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Waits for the backbone connection to wind down after shutdown.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct BackboneConfig {
    pub host: String,
    pub port: u16,
    pub topic: String,
    pub client_id: String,
    pub reconnect_delay: Duration,
}

/// Backbone relayed through a dedicated topic on an MQTT broker.
pub struct MqttBackbone {
    client: AsyncClient,
    topic: String,
    connected: Arc<AtomicBool>,
    relay: Mutex<Option<JoinHandle<()>>>,
}

impl MqttBackbone {
    /// Starts the relay connection in the background. Relayed payloads are
    /// delivered to `hub` until `shutdown` is cancelled.
    pub fn start(config: BackboneConfig, hub: ViewerHub, shutdown: CancellationToken) -> Self {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_session(true);

        let (client, eventloop) = AsyncClient::new(options, 1000);
        let connected = Arc::new(AtomicBool::new(false));

        info!(
            "Starting fan-out backbone on {}:{} topic {}",
            config.host, config.port, config.topic
        );

        let relay = tokio::spawn(run_relay(
            eventloop,
            client.clone(),
            config.clone(),
            hub,
            connected.clone(),
            shutdown,
        ));

        Self {
            client,
            topic: config.topic,
            connected,
            relay: Mutex::new(Some(relay)),
        }
    }
}

async fn run_relay(
    mut eventloop: EventLoop,
    client: AsyncClient,
    config: BackboneConfig,
    hub: ViewerHub,
    connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("Fan-out backbone connected");
                connected.store(true, Ordering::SeqCst);
                if let Err(e) = client.try_subscribe(&config.topic, QoS::AtMostOnce) {
                    error!("Failed to subscribe to fan-out topic {}: {}", config.topic, e);
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) if publish.topic == config.topic => {
                match hub.deliver(&publish.payload) {
                    Ok(n) => debug!("Relayed metric to {} local viewers", n),
                    Err(e) => warn!("Dropping malformed fan-out payload: {}", e),
                }
            }
            Ok(_) => {}
            Err(e) => {
                if connected.swap(false, Ordering::SeqCst) {
                    warn!("Fan-out backbone disconnected: {}", e);
                } else {
                    debug!("Fan-out backbone still unreachable: {}", e);
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(config.reconnect_delay) => {}
                }
            }
        }
    }

    connected.store(false, Ordering::SeqCst);
    crate::mqtt::disconnect(&client, &mut eventloop).await;
    info!("Fan-out backbone relay stopped");
}

#[async_trait]
impl Backbone for MqttBackbone {
    async fn publish(&self, payload: Vec<u8>) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::FanoutDisconnected);
        }
        self.client
            .publish(&self.topic, QoS::AtMostOnce, false, payload)
            .await?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        if let Some(relay) = self.relay.lock().await.take() {
            let _ = relay.await;
        }
        Ok(())
    }
}

/// In-process relay. Several hubs joined to one relay behave like replicas
/// sharing an external backbone.
#[derive(Debug, Clone)]
pub struct MemoryRelay {
    tx: broadcast::Sender<Arc<[u8]>>,
}

impl MemoryRelay {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Attaches a replica's hub to the relay. Must be called inside a runtime.
    pub fn join(&self, hub: ViewerHub) -> MemoryBackbone {
        let mut rx = self.tx.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => {
                        if let Err(e) = hub.deliver(&payload) {
                            warn!("Dropping malformed fan-out payload: {}", e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Replica lagged behind relay, {} events skipped", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        MemoryBackbone {
            tx: self.tx.clone(),
            connected: AtomicBool::new(true),
        }
    }
}

pub struct MemoryBackbone {
    tx: broadcast::Sender<Arc<[u8]>>,
    connected: AtomicBool,
}

impl MemoryBackbone {
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

#[async_trait]
impl Backbone for MemoryBackbone {
    async fn publish(&self, payload: Vec<u8>) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::FanoutDisconnected);
        }
        let _ = self.tx.send(payload.into());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
