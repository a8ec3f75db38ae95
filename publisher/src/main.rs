mod device;
mod errors;
mod lifecycle;
mod publisher;
mod sampler;
mod telemetry;
mod transport;

use anyhow::Context;
use clap::Parser;
use device::{DeviceDirectory, FleetDirectory, PgDeviceDirectory};
use lifecycle::LifecyclePool;
use publisher::Publisher;
use sampler::{SysinfoSampler, SystemSelection};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use transport::{ConnectOptions, MqttTransport};

/// Publishes synthetic device telemetry to the MQTT broker.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    #[arg(long, env = "MQTT_BROKER_HOST", default_value = "localhost")]
    broker: String,

    #[arg(long, env = "MQTT_BROKER_PORT", default_value_t = 1883)]
    port: u16,

    /// Seconds between publish cycles
    #[arg(long, env = "MQTT_PUBLISH_INTERVAL", default_value_t = 30)]
    interval: u64,

    /// Host metrics reported by system devices
    #[arg(long, env = "SYSTEM_METRIC", value_enum, default_value_t = SystemSelection::Both)]
    system_metric: SystemSelection,

    /// Device-management database; a synthetic fleet is used when unset
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Size of the synthetic fleet
    #[arg(long, env = "DEVICES", default_value_t = 10)]
    devices: usize,

    #[arg(long, default_value_t = 30)]
    connect_retries: u32,

    /// Seconds between broker connection attempts
    #[arg(long, default_value_t = 2)]
    connect_delay: u64,

    #[arg(long, default_value_t = 2)]
    lifecycle_workers: usize,

    #[arg(long, default_value_t = 256)]
    lifecycle_queue: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    info!(
        "Starting telemetry publisher (broker {}:{}, interval {}s, system metric {:?})",
        args.broker, args.port, args.interval, args.system_metric
    );

    let directory: Arc<dyn DeviceDirectory> = match &args.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(2)
                .connect(url)
                .await
                .context("failed to connect to the device database")?;
            info!("Reading devices from the device database");
            Arc::new(PgDeviceDirectory::new(pool))
        }
        None => {
            info!("No DATABASE_URL, publishing for {} synthetic devices", args.devices);
            Arc::new(FleetDirectory::new(args.devices))
        }
    };

    let transport = Arc::new(
        MqttTransport::connect(ConnectOptions {
            host: args.broker.clone(),
            port: args.port,
            client_id: format!("publisher-{}", uuid::Uuid::new_v4()),
            retries: args.connect_retries,
            delay: Duration::from_secs(args.connect_delay),
        })
        .await
        .context("broker unavailable, giving up")?,
    );

    // CPU usage needs two refreshes some time apart.
    let sampler = SysinfoSampler::new();
    tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;

    let lifecycle = LifecyclePool::new(transport.clone(), args.lifecycle_workers, args.lifecycle_queue);
    let publisher = Publisher::new(
        transport.clone(),
        directory,
        Box::new(sampler),
        args.system_metric,
        lifecycle,
        Duration::from_secs(args.interval),
    );

    let shutdown = CancellationToken::new();
    let run = tokio::spawn(publisher.run(shutdown.clone()));

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown requested");
    shutdown.cancel();

    if let Err(e) = run.await {
        error!("Publisher task failed: {}", e);
    }
    transport.disconnect().await;

    info!("Publisher stopped");
    Ok(())
}
