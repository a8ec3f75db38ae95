use crate::fanout::FanoutLayer;
use crate::metrics::{
    BROADCASTS_TOTAL, BROADCAST_FAILURES_TOTAL, INSERT_LATENCY_SECONDS, INVALID_MESSAGES_TOTAL,
    MESSAGES_TOTAL, STORED_METRICS_TOTAL, STORE_FAILURES_TOTAL,
};
use crate::store::MetricStore;
use crate::validate::normalize;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// What happened to one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Malformed; neither stored nor broadcast.
    Rejected,
    Accepted { stored: bool, broadcast: bool },
}

/// Turns broker messages into stored, broadcast metrics.
#[derive(Clone)]
pub struct Consumer {
    store: Arc<dyn MetricStore>,
    fanout: FanoutLayer,
}

impl Consumer {
    pub fn new(store: Arc<dyn MetricStore>, fanout: FanoutLayer) -> Self {
        Self { store, fanout }
    }

    /// Handles one message to completion.
    ///
    /// The store write and the broadcast are independent: a failed insert is
    /// still broadcast, and a disconnected backbone never holds up the insert.
    pub async fn handle(&self, topic: &str, payload: &[u8]) -> Outcome {
        MESSAGES_TOTAL.inc();
        debug!("Received message on topic {}, size: {} bytes", topic, payload.len());

        let raw: Value = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(e) => {
                warn!("Dropping unparseable message on {}: {}", topic, e);
                INVALID_MESSAGES_TOTAL.inc();
                return Outcome::Rejected;
            }
        };

        let metric = match normalize(&raw, Utc::now()) {
            Ok(m) => m,
            Err(e) => {
                warn!("Dropping invalid metric payload on {}: {}", topic, e);
                INVALID_MESSAGES_TOTAL.inc();
                return Outcome::Rejected;
            }
        };

        let start = Instant::now();
        let stored = match self.store.insert(&metric).await {
            Ok(()) => {
                INSERT_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());
                STORED_METRICS_TOTAL.inc();
                debug!("Stored {} metric for {}", metric.metric_type, metric.device_id);
                true
            }
            Err(e) => {
                error!("Failed to store metric for {}: {}", metric.device_id, e);
                STORE_FAILURES_TOTAL.inc();
                false
            }
        };

        let broadcast = if self.fanout.is_connected() {
            match self.fanout.intake(&raw).await {
                Ok(()) => {
                    BROADCASTS_TOTAL.inc();
                    true
                }
                Err(e) => {
                    warn!("Failed to broadcast metric for {}: {}", metric.device_id, e);
                    BROADCAST_FAILURES_TOTAL.inc();
                    false
                }
            }
        } else {
            debug!("Fan-out backbone down, not broadcasting {}", metric.device_id);
            false
        };

        Outcome::Accepted { stored, broadcast }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::{MemoryRelay, ViewerHub};
    use crate::memory::MemoryMetricStore;
    use crate::store::Page;

    fn consumer() -> (Consumer, Arc<MemoryMetricStore>) {
        let store = Arc::new(MemoryMetricStore::new());
        let relay = MemoryRelay::new(16);
        let hub = ViewerHub::new(16);
        let fanout = FanoutLayer::new(Arc::new(relay.join(hub)));
        (Consumer::new(store.clone(), fanout), store)
    }

    #[test]
    fn test_handle_valid_message() {
        tokio_test::block_on(async {
            let (consumer, store) = consumer();
            let payload = br#"{"device_id":"d1","owner_id":7,"type":"light","value":40.0,"unit":"%"}"#;

            let outcome = consumer.handle("cloud-security-iot/iot/light/d1", payload).await;

            assert_eq!(outcome, Outcome::Accepted { stored: true, broadcast: true });
            let records = store.query_by_device("d1", Page::default()).await.unwrap();
            assert_eq!(records.len(), 1);
        });
    }

    #[tokio::test]
    async fn test_handle_invalid_json() {
        let (consumer, store) = consumer();
        assert_eq!(consumer.handle("t", b"invalid json").await, Outcome::Rejected);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_handle_missing_type() {
        let (consumer, store) = consumer();
        let outcome = consumer.handle("t", br#"{"device_id":"d1","value":1}"#).await;
        assert_eq!(outcome, Outcome::Rejected);
        assert!(store.is_empty());
    }
}
