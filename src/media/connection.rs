//! Seam between the negotiation logic and a concrete peer connection backend.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::media::{LocalTrack, RemoteTrack};
use crate::signaling::protocol::{IceCandidate, SessionDescription};

/// Transport-level connectivity as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Events a connection raises on its own, outside any call into it.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Local candidate gathered; must be sent to the remote peer.
    IceCandidate {
        peer_id: String,
        candidate: IceCandidate,
    },
    LinkStateChanged {
        peer_id: String,
        state: LinkState,
    },
    RemoteTrack {
        peer_id: String,
        stream_id: String,
        track: RemoteTrack,
    },
}

#[async_trait]
pub trait MediaConnection: Send + Sync {
    /// Create an offer and apply it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Answer the applied remote offer and apply the answer locally.
    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// Drop an unanswered local offer and return to the stable state.
    async fn rollback(&self) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Attach the track on a new sender.
    async fn add_track(&self, track: &LocalTrack) -> Result<()>;

    /// Swap the track on the existing sender of the same kind, without renegotiation.
    async fn replace_track(&self, track: &LocalTrack) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create(
        &self,
        peer_id: &str,
        events: mpsc::Sender<ConnectionEvent>,
    ) -> Result<Arc<dyn MediaConnection>>;
}
