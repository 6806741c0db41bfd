use serde::Serialize;
use tokio::sync::broadcast;

use crate::media::{NegotiationState, RemoteStream};
use crate::models::{ChatMessage, PeerRecord, Reaction};
use crate::signaling::TransportState;

/// Session events for UI layers and the control API's websocket stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum SessionEvent {
    TransportStateChanged { state: TransportState },
    /// A peer announced itself for the first time.
    PeerJoined(PeerRecord),
    PeerUpdated(PeerRecord),
    PeerLeft { peer_id: String },
    RemoteStreamAttached { peer_id: String, stream: RemoteStream },
    ConnectionStateChanged { peer_id: String, state: NegotiationState },
    ChatReceived(ChatMessage),
    ReactionReceived(Reaction),
    ReactionExpired { reaction_id: String },
    Left,
}

pub type EventSender = broadcast::Sender<SessionEvent>;
pub type EventReceiver = broadcast::Receiver<SessionEvent>;

pub fn create_event_bus() -> (EventSender, EventReceiver) {
    broadcast::channel(256)
}
