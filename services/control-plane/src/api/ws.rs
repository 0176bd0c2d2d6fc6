//! Advisory websocket event push.
//!
//! Subscribers receive `endpoint_update`, `node_status_update` and
//! `metrics_update` events as JSON text frames. The channel is lossy: a
//! lagging client is disconnected and reconciles over REST.

use super::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

pub async fn upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let events = state.events.subscribe();
    ws.on_upgrade(move |socket| push_events(socket, events))
}

async fn push_events(
    mut socket: WebSocket,
    mut events: tokio::sync::broadcast::Receiver<crate::events::Event>,
) {
    loop {
        tokio::select! {
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(missed)) => {
                        debug!(missed, "Websocket subscriber lagged, disconnecting");
                        break;
                    }
                    Err(RecvError::Closed) => break,
                };
                let payload = match serde_json::to_string(&event) {
                    Ok(payload) => payload,
                    Err(_) => continue,
                };
                if socket.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    // Pings are answered by axum; other frames are ignored.
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
    debug!("Websocket subscriber closed");
}
