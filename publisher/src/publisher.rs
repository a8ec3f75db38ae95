use crate::device::DeviceDirectory;
use crate::errors::Result;
use crate::lifecycle::{LifecyclePool, LifecycleTracker};
use crate::sampler::{HostSampler, SystemSelection};
use crate::telemetry::{synthesize, Telemetry};
use crate::transport::Transport;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub published: usize,
    pub failed: usize,
    pub skipped: usize,
}

pub struct Publisher {
    transport: Arc<dyn Transport>,
    directory: Arc<dyn DeviceDirectory>,
    sampler: Box<dyn HostSampler>,
    selection: SystemSelection,
    lifecycle: LifecyclePool,
    tracker: LifecycleTracker,
    interval: Duration,
}

impl Publisher {
    pub fn new(
        transport: Arc<dyn Transport>,
        directory: Arc<dyn DeviceDirectory>,
        sampler: Box<dyn HostSampler>,
        selection: SystemSelection,
        lifecycle: LifecyclePool,
        interval: Duration,
    ) -> Self {
        Self {
            transport,
            directory,
            sampler,
            selection,
            lifecycle,
            tracker: LifecycleTracker::default(),
            interval,
        }
    }

    /// Publishes one reading for every active device.
    ///
    /// A directory failure fails the whole cycle; a failed device publish only
    /// counts against the report.
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        let host = self.sampler.sample();
        let devices = self.directory.list_devices().await?;

        for event in self.tracker.observe(&devices) {
            self.lifecycle.submit(event).await;
        }

        let mut report = CycleReport::default();
        let mut outgoing = Vec::with_capacity(devices.len());
        {
            let mut rng = rand::thread_rng();
            for device in &devices {
                if !device.is_active() {
                    report.skipped += 1;
                    continue;
                }
                let reading = synthesize(&device.kind, &host, self.selection, &mut rng);
                let payload = serde_json::to_vec(&Telemetry::new(device, reading))?;
                outgoing.push((device, payload));
            }
        }

        for (device, payload) in outgoing {
            let topic = device.topic();
            match self.transport.publish(&topic, payload).await {
                Ok(()) => {
                    debug!("Published to {}", topic);
                    report.published += 1;
                }
                Err(e) => {
                    warn!("Failed to publish for {}: {}", device.device_id, e);
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Runs cycles back to back until `shutdown` is cancelled, then drains the
    /// lifecycle pool. A cycle in progress always completes.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Publishing every {:?}", self.interval);

        loop {
            let started = Instant::now();

            match self.run_cycle().await {
                Ok(report) => info!(
                    "Cycle done: {} published, {} failed, {} inactive",
                    report.published, report.failed, report.skipped
                ),
                Err(e) => error!("Cycle aborted: {}", e),
            }

            let remaining = self.interval.saturating_sub(started.elapsed());
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(remaining) => {}
            }
        }

        info!("Stopping publisher");
        self.lifecycle.shutdown().await;
    }
}
