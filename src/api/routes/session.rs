use axum::{
    extract::State,
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use crate::media::LocalTrack;
use crate::session::{SessionHandle, SessionState};

fn ok() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true}))
}

pub async fn get_session(State(session): State<SessionHandle>) -> Json<SessionState> {
    Json(session.state())
}

#[derive(Deserialize)]
pub struct ChatRequest {
    pub text: String,
}

pub async fn send_chat(
    State(session): State<SessionHandle>,
    Json(body): Json<ChatRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    if body.text.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Message text is empty".to_string()));
    }
    session
        .send_chat(body.text)
        .await
        .map(|_| ok())
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to send chat: {}", e)))
}

#[derive(Deserialize)]
pub struct ReactionRequest {
    pub emoji: String,
}

pub async fn send_reaction(
    State(session): State<SessionHandle>,
    Json(body): Json<ReactionRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    session
        .send_reaction(body.emoji)
        .await
        .map(|_| ok())
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to send reaction: {}", e)))
}

#[derive(Deserialize)]
pub struct MutedRequest {
    pub muted: bool,
}

pub async fn set_muted(
    State(session): State<SessionHandle>,
    Json(body): Json<MutedRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    session
        .set_muted(body.muted)
        .await
        .map(|_| ok())
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to set muted: {}", e)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraOffRequest {
    pub camera_off: bool,
}

pub async fn set_camera_off(
    State(session): State<SessionHandle>,
    Json(body): Json<CameraOffRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    session
        .set_camera_off(body.camera_off)
        .await
        .map(|_| ok())
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to set camera: {}", e)))
}

pub async fn start_screen_share(
    State(session): State<SessionHandle>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    // Headless participants have no display to capture; share a blank track
    let track = LocalTrack::screen(session.local_id());
    session
        .start_screen_share(track)
        .await
        .map(|_| ok())
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to start screen share: {}", e)))
}

pub async fn stop_screen_share(
    State(session): State<SessionHandle>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    session
        .stop_screen_share()
        .await
        .map(|_| ok())
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to stop screen share: {}", e)))
}

pub async fn leave(
    State(session): State<SessionHandle>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    session
        .leave()
        .await
        .map(|_| ok())
        .map_err(|e| (StatusCode::CONFLICT, format!("Failed to leave: {}", e)))
}
