//! Monitoring WebSocket
//!
//! Streams every router lifecycle event as one JSON text frame. Slow
//! clients that fall behind the broadcast buffer skip events.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use incident_router::RouterEvent;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use crate::SharedState;

pub async fn monitor(ws: WebSocketUpgrade, State(state): State<SharedState>) -> Response {
    let events = state.router.subscribe();
    ws.on_upgrade(move |socket| stream_events(socket, events))
}

async fn stream_events(mut socket: WebSocket, mut events: broadcast::Receiver<RouterEvent>) {
    debug!("Monitor client connected");
    loop {
        tokio::select! {
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Monitor client lagged, {} events skipped", skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to encode {} event: {}", event.name(), e);
                        continue;
                    }
                };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    debug!("Monitor client disconnected");
}
