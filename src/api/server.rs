use axum::{routing::{get, post, put}, Router};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::api::{routes, websocket};
use crate::error::Result;
use crate::session::SessionHandle;

pub fn build_router(session: SessionHandle) -> Router {
    Router::new()
        // Session
        .route("/api/v1/session", get(routes::session::get_session))
        .route("/api/v1/session/chat", post(routes::session::send_chat))
        .route("/api/v1/session/reaction", post(routes::session::send_reaction))
        .route("/api/v1/session/muted", put(routes::session::set_muted))
        .route("/api/v1/session/camera-off", put(routes::session::set_camera_off))
        .route("/api/v1/session/screen/start", post(routes::session::start_screen_share))
        .route("/api/v1/session/screen/stop", post(routes::session::stop_screen_share))
        .route("/api/v1/session/leave", post(routes::session::leave))
        // WebSocket
        .route("/ws", get(websocket::ws_handler))
        // Middleware
        .layer(CorsLayer::permissive())
        .with_state(session)
}

pub async fn start_api_server(session: SessionHandle, port: u16) -> Result<()> {
    let router = build_router(session);
    let addr = format!("127.0.0.1:{}", port);
    let listener = TcpListener::bind(&addr).await?;
    info!("API server listening on http://{}", addr);
    axum::serve(listener, router).await?;
    Ok(())
}
