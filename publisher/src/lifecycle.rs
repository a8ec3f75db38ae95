use crate::device::Device;
use crate::transport::Transport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleKind {
    DeviceRegistered,
    DeviceStatusChanged,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub event: LifecycleKind,
    pub device_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip)]
    pub topic: String,
}

impl LifecycleEvent {
    pub fn new(event: LifecycleKind, device: &Device) -> Self {
        Self {
            event,
            device_id: device.device_id.clone(),
            name: device.name.clone(),
            kind: device.kind.to_string(),
            status: device.status.clone(),
            timestamp: Utc::now(),
            topic: device.events_topic(),
        }
    }
}

/// Remembers each device's last seen status across cycles.
#[derive(Debug, Default)]
pub struct LifecycleTracker {
    seen: HashMap<String, String>,
}

impl LifecycleTracker {
    pub fn observe(&mut self, devices: &[Device]) -> Vec<LifecycleEvent> {
        let mut events = Vec::new();
        for device in devices {
            match self.seen.get(&device.device_id) {
                None => events.push(LifecycleEvent::new(LifecycleKind::DeviceRegistered, device)),
                Some(status) if *status != device.status => {
                    events.push(LifecycleEvent::new(LifecycleKind::DeviceStatusChanged, device))
                }
                Some(_) => continue,
            }
            self.seen
                .insert(device.device_id.clone(), device.status.clone());
        }
        events
    }
}

/// Bounded queue of lifecycle events drained by a fixed set of workers.
pub struct LifecyclePool {
    sender: Mutex<Option<mpsc::Sender<LifecycleEvent>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl LifecyclePool {
    pub fn new(transport: Arc<dyn Transport>, workers: usize, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let handles = (0..workers.max(1))
            .map(|id| tokio::spawn(worker(id, rx.clone(), transport.clone())))
            .collect();

        Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
        }
    }

    /// Queues an event without waiting. Returns false if it was dropped.
    pub async fn submit(&self, event: LifecycleEvent) -> bool {
        let sender = self.sender.lock().await;
        let Some(sender) = sender.as_ref() else {
            warn!("Lifecycle pool closed, dropping event for {}", event.device_id);
            return false;
        };

        match sender.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!("Lifecycle queue full, dropping event for {}", event.device_id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                warn!("Lifecycle queue closed, dropping event for {}", event.device_id);
                false
            }
        }
    }

    /// Closes the queue and waits until every queued event has been sent.
    pub async fn shutdown(&self) {
        self.sender.lock().await.take();

        let workers = std::mem::take(&mut *self.workers.lock().await);
        for handle in workers {
            if let Err(e) = handle.await {
                error!("Lifecycle worker failed: {}", e);
            }
        }
        info!("Lifecycle pool drained");
    }
}

async fn worker(
    id: usize,
    queue: Arc<Mutex<mpsc::Receiver<LifecycleEvent>>>,
    transport: Arc<dyn Transport>,
) {
    loop {
        let Some(event) = queue.lock().await.recv().await else {
            break;
        };

        let payload = match serde_json::to_vec(&event) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to serialize lifecycle event: {}", e);
                continue;
            }
        };

        match transport.publish(&event.topic, payload).await {
            Ok(()) => debug!("Worker {} sent {:?} for {}", id, event.event, event.device_id),
            Err(e) => warn!("Failed to send lifecycle event for {}: {}", event.device_id, e),
        }
    }
}
