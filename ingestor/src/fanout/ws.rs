use crate::fanout::hub::{ServerFrame, ViewerHub};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Heartbeat settings for viewer connections.
#[derive(Debug, Clone, Copy)]
pub struct Liveness {
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
}

impl Default for Liveness {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(25),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Clone)]
struct WsState {
    hub: ViewerHub,
    liveness: Liveness,
}

pub fn create_router(hub: ViewerHub, liveness: Liveness) -> Router {
    Router::new()
        .route("/ws", get(websocket_handler))
        .with_state(WsState { hub, liveness })
}

async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<WsState>) -> Response {
    ws.on_upgrade(move |socket| serve_viewer(socket, state.hub, state.liveness))
}

async fn serve_viewer(mut socket: WebSocket, hub: ViewerHub, liveness: Liveness) {
    let mut viewer = hub.connect();
    let viewer_id = viewer.id();
    info!("Viewer {} connected ({} on this replica)", viewer_id, hub.viewer_count());

    let hello = match (ServerFrame::Connected { viewer_id }).to_text() {
        Ok(text) => text,
        Err(e) => {
            warn!("Failed to encode connect frame: {}", e);
            return;
        }
    };
    if socket.send(Message::Text(hello)).await.is_err() {
        return;
    }

    let mut heartbeat = interval(liveness.heartbeat_interval.max(Duration::from_millis(1)));
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.tick().await;
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            frame = viewer.recv() => match frame {
                Ok(text) => {
                    if socket.send(Message::Text(text.to_string())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    warn!("Viewer {} lagged, {} events skipped", viewer_id, n);
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => last_seen = Instant::now(),
                Some(Err(e)) => {
                    debug!("Viewer {} socket error: {}", viewer_id, e);
                    break;
                }
            },
            _ = heartbeat.tick() => {
                if last_seen.elapsed() >= liveness.idle_timeout {
                    info!("Viewer {} missed heartbeats, disconnecting", viewer_id);
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
                if socket.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    drop(viewer);
    info!("Viewer {} disconnected ({} on this replica)", viewer_id, hub.viewer_count());
}
