//! Real-time distribution of newly ingested metrics.
//!
//! Every replica runs a [`ViewerHub`] for its own WebSocket viewers and joins
//! a shared [`Backbone`]. Intake never writes to the local hub directly: it
//! publishes on the backbone, and each replica's relay task delivers what it
//! receives to its hub. A metric ingested on replica A therefore reaches
//! viewers on replica B through the same path as viewers on A.

pub mod backbone;
pub mod hub;
pub mod ws;

pub use backbone::{Backbone, BackboneConfig, MemoryBackbone, MemoryRelay, MqttBackbone};
pub use hub::{ServerFrame, Viewer, ViewerHub};

use crate::errors::{Error, Result};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Clone)]
pub struct FanoutLayer {
    backbone: Arc<dyn Backbone>,
}

impl FanoutLayer {
    pub fn new(backbone: Arc<dyn Backbone>) -> Self {
        Self { backbone }
    }

    pub fn is_connected(&self) -> bool {
        self.backbone.is_connected()
    }

    /// Announces a new metric to every replica. The payload is relayed as-is.
    pub async fn intake(&self, payload: &Value) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::FanoutDisconnected);
        }
        let bytes = serde_json::to_vec(payload)?;
        self.backbone.publish(bytes).await
    }

    /// Waits for the backbone link, giving up after `retries` checks. The
    /// relay keeps reconnecting in the background either way.
    pub async fn wait_connected(&self, retries: u32, delay: Duration) -> bool {
        for attempt in 1..=retries {
            if self.is_connected() {
                info!("Fan-out backbone ready");
                return true;
            }
            warn!(
                "Fan-out backbone not connected ({}/{}), retrying in {:?}",
                attempt, retries, delay
            );
            tokio::time::sleep(delay).await;
        }

        let connected = self.is_connected();
        if !connected {
            warn!("Proceeding without fan-out backbone; broadcasts resume once it connects");
        }
        connected
    }

    pub async fn close(&self) {
        if let Err(e) = self.backbone.close().await {
            warn!("Failed to close fan-out backbone: {}", e);
        }
    }
}
