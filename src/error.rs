//! Error types shared by the relay, the transports and the session.

use thiserror::Error;

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum Error {
    /// A send was attempted while the signal transport was not connected
    #[error("signal transport not connected")]
    NotConnected,

    /// WebSocket connect/send failure
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// Malformed or unsupported signal message
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Failure while applying or producing a session description or candidate
    #[error("negotiation error: {0}")]
    Negotiation(String),

    /// Failure in the media connection backend
    #[error("media error: {0}")]
    Media(String),

    /// The session or connection has already been closed
    #[error("closed")]
    Closed,

    /// Invalid configuration value
    #[error("config error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn negotiation(msg: impl Into<String>) -> Self {
        Error::Negotiation(msg.into())
    }

    pub fn media(msg: impl Into<String>) -> Self {
        Error::Media(msg.into())
    }
}

impl From<webrtc::Error> for Error {
    fn from(e: webrtc::Error) -> Self {
        Error::Media(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
