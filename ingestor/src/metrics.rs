use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};
use tracing::error;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_messages_total",
        "Total messages received from MQTT"
    ))
    .unwrap();
    pub static ref INVALID_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_invalid_messages_total",
        "Total messages dropped as malformed"
    ))
    .unwrap();
    pub static ref STORED_METRICS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_stored_metrics_total",
        "Total metric records persisted"
    ))
    .unwrap();
    pub static ref STORE_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_store_failures_total",
        "Total metric store insert failures, including retried attempts"
    ))
    .unwrap();
    pub static ref INSERT_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "ingestor_insert_latency_seconds",
            "Time taken to persist one metric"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
    pub static ref BROADCASTS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_broadcasts_total",
        "Total metrics handed to the fan-out backbone"
    ))
    .unwrap();
    pub static ref BROADCAST_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_broadcast_failures_total",
        "Total metrics that could not be handed to the fan-out backbone"
    ))
    .unwrap();
    pub static ref VIEWERS_CONNECTED: Gauge = Gauge::with_opts(Opts::new(
        "ingestor_viewers_connected",
        "Real-time viewers connected to this replica"
    ))
    .unwrap();
}

pub fn init_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(INVALID_MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(STORED_METRICS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(STORE_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(INSERT_LATENCY_SECONDS.clone()))?;
    REGISTRY.register(Box::new(BROADCASTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(BROADCAST_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(VIEWERS_CONNECTED.clone()))?;
    Ok(())
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registered_metrics_are_exported() {
        init_metrics().unwrap();
        MESSAGES_TOTAL.inc();

        let text = gather_metrics();
        assert!(text.contains("ingestor_messages_total"));
        assert!(text.contains("ingestor_viewers_connected"));

        assert!(init_metrics().is_err());
    }
}
