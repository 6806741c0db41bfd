use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::error::Result;
use crate::relay::rooms::{RelayStats, RoomRegistry};
use crate::relay::websocket;

#[derive(Clone, Default)]
pub struct RelayState {
    pub rooms: Arc<RoomRegistry>,
}

pub fn build_router(state: RelayState) -> Router {
    Router::new()
        // Browsers connect to the bare origin; `/ws` is accepted as well
        .route("/", get(websocket::ws_handler))
        .route("/ws", get(websocket::ws_handler))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health(State(state): State<RelayState>) -> Json<RelayStats> {
    Json(state.rooms.stats().await)
}

pub async fn serve(listener: TcpListener, state: RelayState) -> Result<()> {
    let router = build_router(state);
    if let Ok(addr) = listener.local_addr() {
        info!("Signaling relay listening on ws://{}", addr);
    }
    axum::serve(listener, router).await?;
    Ok(())
}

/// Bind and serve in the background. Returns the bound address (useful with port 0).
pub async fn spawn_relay(addr: SocketAddr) -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    let handle = tokio::spawn(async move {
        if let Err(e) = serve(listener, RelayState::default()).await {
            error!("Signaling relay stopped: {}", e);
        }
    });
    Ok((local_addr, handle))
}
