use anyhow::Context;
use axum::{routing::get, Router};
use ingestor::config::{Backend, Config};
use ingestor::consumer::Consumer;
use ingestor::db::{self, PgMetricStore};
use ingestor::fanout::{
    ws::{self, Liveness},
    Backbone, BackboneConfig, FanoutLayer, MemoryRelay, MqttBackbone, ViewerHub,
};
use ingestor::memory::MemoryMetricStore;
use ingestor::store::MetricStore;
use ingestor::{metrics, mqtt, rest};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();

    info!("Starting telemetry ingestor");
    info!("MQTT broker: {}:{}", config.mqtt_broker, config.mqtt_port);
    info!("HTTP server: {}", config.http_addr);

    metrics::init_metrics().context("failed to register metrics")?;

    let store: Arc<dyn MetricStore> = match config.store_backend {
        Backend::External => {
            info!(
                "Database: {}",
                config.database_url.split('@').last().unwrap_or("***")
            );
            let pool = db::make_pool(&config.database_url)
                .await
                .context("failed to connect to database")?;
            Arc::new(PgMetricStore::new(pool))
        }
        Backend::Memory => {
            warn!("Using in-memory metric store; data is lost on restart");
            Arc::new(MemoryMetricStore::new())
        }
    };

    let shutdown = CancellationToken::new();
    let replica_id = uuid::Uuid::new_v4();

    let hub = ViewerHub::new(config.viewer_buffer);
    let backbone: Arc<dyn Backbone> = match config.fanout_backend {
        Backend::External => Arc::new(MqttBackbone::start(
            BackboneConfig {
                host: config.fanout_broker.clone(),
                port: config.fanout_port,
                topic: config.fanout_topic.clone(),
                client_id: format!("ingestor-fanout-{}", replica_id),
                reconnect_delay: config.fanout_connect_delay,
            },
            hub.clone(),
            shutdown.clone(),
        )),
        Backend::Memory => {
            warn!("Using in-process fan-out relay; viewers only see metrics ingested by this replica");
            Arc::new(MemoryRelay::new(config.viewer_buffer).join(hub.clone()))
        }
    };
    let fanout = FanoutLayer::new(backbone);

    // The backbone is optional for ingestion; the broker below is not.
    fanout
        .wait_connected(config.fanout_connect_retries, config.fanout_connect_delay)
        .await;

    let consumer = Consumer::new(store.clone(), fanout.clone());
    let broker = mqtt::BrokerConfig {
        host: config.mqtt_broker.clone(),
        port: config.mqtt_port,
        client_id: format!("ingestor-{}", replica_id),
        topic_filter: config.topic_filter.clone(),
        retry_delay: config.broker_retry_delay,
    };
    let mqtt_shutdown = shutdown.clone();
    let mut mqtt_handle = tokio::spawn(async move {
        if let Err(e) = mqtt::run_mqtt(broker, consumer, mqtt_shutdown).await {
            error!("MQTT task failed: {}", e);
        }
    });

    let liveness = Liveness {
        heartbeat_interval: config.heartbeat_interval,
        idle_timeout: config.idle_timeout,
    };
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(|| async { "ok" }))
        .merge(rest::create_router(store))
        .merge(ws::create_router(hub, liveness));

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.http_addr))?;

    info!("HTTP server listening on {}", config.http_addr);

    let server_shutdown = shutdown.clone();
    let mut server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
            .unwrap_or_else(|e| {
                error!("HTTP server error: {}", e);
            });
    });

    let (mut mqtt_done, mut server_done) = (false, false);
    tokio::select! {
        _ = &mut mqtt_handle => {
            error!("MQTT task terminated");
            mqtt_done = true;
        }
        _ = &mut server_handle => {
            error!("HTTP server terminated");
            server_done = true;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");
    shutdown.cancel();
    if !mqtt_done {
        let _ = mqtt_handle.await;
    }
    if !server_done {
        let _ = server_handle.await;
    }
    fanout.close().await;
    info!("Shutdown complete");

    Ok(())
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
