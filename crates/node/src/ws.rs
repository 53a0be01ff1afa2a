//! WebSocket event streaming: one bus subscription per socket.
//!
//! Bus events (including heartbeats) are forwarded as JSON text
//! frames; the client answers heartbeats with a pong frame or a
//! literal `"pong"` text. Silent clients are reaped by the bus and
//! their stream ends here.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use tracing::debug;

use crate::api::AppState;

pub async fn events(ws: WebSocketUpgrade, State(system): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| stream_events(socket, system))
}

async fn stream_events(mut socket: WebSocket, system: AppState) {
    let subscription = system.subscribe();
    debug!(subscriber = %subscription.id(), "Event stream opened");
    loop {
        tokio::select! {
            event = subscription.next() => {
                let Some(event) = event else { break };
                let Ok(payload) = serde_json::to_string(&event) else { continue };
                if socket.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Pong(_))) => subscription.pong(),
                    Some(Ok(Message::Text(text))) if text.trim() == "pong" => subscription.pong(),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
    debug!(subscriber = %subscription.id(), "Event stream closed");
}
