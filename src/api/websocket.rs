use axum::{
    extract::{State, ws::{Message, WebSocket, WebSocketUpgrade}},
    response::IntoResponse,
};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::events::SessionEvent;
use crate::session::{SessionHandle, SessionState};

/// First frame on every event stream, so clients don't have to poll `/api/v1/session`.
#[derive(Serialize)]
#[serde(tag = "type", content = "data")]
enum Greeting<'a> {
    Snapshot(&'a SessionState),
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(session): State<SessionHandle>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, session))
}

async fn send_json<T: Serialize>(socket: &mut WebSocket, value: &T) -> bool {
    match serde_json::to_string(value) {
        Ok(json) => socket.send(Message::Text(json)).await.is_ok(),
        Err(e) => {
            warn!("Failed to serialize event: {}", e);
            true
        }
    }
}

async fn handle_socket(mut socket: WebSocket, session: SessionHandle) {
    debug!("Event stream client connected");
    let mut event_rx = session.subscribe();

    let snapshot = session.state();
    if !send_json(&mut socket, &Greeting::Snapshot(&snapshot)).await {
        return;
    }

    loop {
        tokio::select! {
            result = event_rx.recv() => {
                match result {
                    Ok(event) => {
                        let last = matches!(event, SessionEvent::Left);
                        if !send_json(&mut socket, &event).await || last {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Event stream client lagged, skipped {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = socket.send(Message::Close(None)).await;
    debug!("Event stream client disconnected");
}
