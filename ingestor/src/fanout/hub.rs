use crate::errors::Result;
use crate::metrics::VIEWERS_CONNECTED;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Frames pushed to viewers. Serialized as `{"event": ..., "data": ...}`.
#[derive(Debug, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerFrame {
    Connected { viewer_id: u64 },
    MetricsLive(Value),
}

impl ServerFrame {
    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Viewers connected to this replica.
///
/// Frames are serialized once per delivery and shared by every viewer.
#[derive(Debug, Clone)]
pub struct ViewerHub {
    tx: broadcast::Sender<Arc<str>>,
    viewers: Arc<AtomicUsize>,
    next_id: Arc<AtomicU64>,
}

impl ViewerHub {
    /// `buffer` bounds how far a slow viewer may fall behind before it starts
    /// missing events.
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer.max(1));
        Self {
            tx,
            viewers: Arc::new(AtomicUsize::new(0)),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn connect(&self) -> Viewer {
        let count = self.viewers.fetch_add(1, Ordering::SeqCst) + 1;
        VIEWERS_CONNECTED.set(count as f64);
        Viewer {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            rx: self.tx.subscribe(),
            viewers: self.viewers.clone(),
        }
    }

    /// Pushes a relayed metric payload to every local viewer and returns how
    /// many received it.
    pub fn deliver(&self, payload: &[u8]) -> Result<usize> {
        let data: Value = serde_json::from_slice(payload)?;
        let frame: Arc<str> = ServerFrame::MetricsLive(data).to_text()?.into();
        // No receivers is not an error: nobody is watching this replica.
        Ok(self.tx.send(frame).unwrap_or(0))
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.load(Ordering::SeqCst)
    }
}

/// One connected viewer. Dropping it disconnects the viewer from the hub.
#[derive(Debug)]
pub struct Viewer {
    id: u64,
    rx: broadcast::Receiver<Arc<str>>,
    viewers: Arc<AtomicUsize>,
}

impl Viewer {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> std::result::Result<Arc<str>, broadcast::error::RecvError> {
        self.rx.recv().await
    }
}

impl Drop for Viewer {
    fn drop(&mut self) {
        let count = self.viewers.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        VIEWERS_CONNECTED.set(count as f64);
    }
}
