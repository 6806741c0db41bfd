use std::sync::Arc;

use axum::{
    extract::{State, ws::{Message, WebSocket, WebSocketUpgrade}},
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::relay::rooms::{ConnId, RoomRegistry};
use crate::relay::server::RelayState;
use crate::signaling::protocol::Envelope;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<RelayState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.rooms))
}

async fn handle_socket(socket: WebSocket, rooms: Arc<RoomRegistry>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let conn = rooms.register(tx).await;
    debug!("Relay connection {} opened", conn);

    // Single writer per socket; routing from other connections only touches the channel.
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => route_frame(&rooms, conn, &text).await,
            Ok(Message::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => route_frame(&rooms, conn, &text).await,
                Err(_) => warn!("Discarding non-UTF-8 binary frame from connection {}", conn),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Relay connection {} errored: {}", conn, e);
                break;
            }
        }
    }

    rooms.unregister(conn).await;
    writer.abort();
    debug!("Relay connection {} closed", conn);
}

async fn route_frame(rooms: &RoomRegistry, conn: ConnId, text: &str) {
    match Envelope::parse(text) {
        Ok(envelope) => {
            let delivered = rooms.route(conn, &envelope, text).await;
            debug!(
                "Connection {} sent {} ({} recipients)",
                conn, envelope.kind, delivered
            );
        }
        Err(e) => {
            warn!("Discarding malformed frame from connection {}: {}", conn, e);
        }
    }
}
