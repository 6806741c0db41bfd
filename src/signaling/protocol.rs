//! Wire format of the signaling relay.
//!
//! Every frame is one JSON object:
//!
//! ```text
//! { "type": "join" | "leave" | "offer" | "answer" | "ice-candidate"
//!           | "update-state" | "chat" | "reaction",
//!   "senderId": "...", "targetId": "...", "roomId": "...",
//!   "payload": { ... }, "timestamp": 1700000000000 }
//! ```
//!
//! `targetId` absent means broadcast to the room. `roomId` and `timestamp` are
//! stamped by the sending transport.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::{now_millis, ChatMessage, Presence, PresenceUpdate, Reaction};

/// The closed set of signal variants, tagged by `type` with the body under `payload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum Signal {
    Join(Presence),
    Leave,
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
    UpdateState(PresenceUpdate),
    Chat(ChatMessage),
    Reaction(Reaction),
}

impl Signal {
    pub fn kind(&self) -> &'static str {
        match self {
            Signal::Join(_) => "join",
            Signal::Leave => "leave",
            Signal::Offer(_) => "offer",
            Signal::Answer(_) => "answer",
            Signal::IceCandidate(_) => "ice-candidate",
            Signal::UpdateState(_) => "update-state",
            Signal::Chat(_) => "chat",
            Signal::Reaction(_) => "reaction",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMessage {
    #[serde(flatten)]
    pub body: Signal,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl SignalMessage {
    /// Broadcast message from `sender_id`.
    pub fn new(sender_id: impl Into<String>, body: Signal) -> Self {
        Self {
            body,
            sender_id: sender_id.into(),
            target_id: None,
            room_id: None,
            timestamp: None,
        }
    }

    /// Address the message to a single peer.
    pub fn to(mut self, target_id: impl Into<String>) -> Self {
        self.target_id = Some(target_id.into());
        self
    }

    /// Room and send-time stamp applied by transports before a message leaves.
    pub fn stamped(mut self, room_id: &str) -> Self {
        self.room_id = Some(room_id.to_string());
        self.timestamp = Some(now_millis());
        self
    }

    /// True when the message is a broadcast or is targeted at `local_id`.
    pub fn is_for(&self, local_id: &str) -> bool {
        match self.target_id {
            Some(ref target) => target == local_id,
            None => true,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Protocol(format!("invalid signal message: {}", e)))
    }
}

/// Kind of a session description, serialized the way browsers do (`"offer"`, `"answer"`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// Session description blob, passed between peers without interpretation by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Answer, sdp: sdp.into() }
    }
}

/// One trickled ICE candidate, in the browser's `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Routing header the relay reads from each frame. The frame itself is forwarded verbatim,
/// so payloads and unknown message types pass through untouched.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub sender_id: Option<String>,
    #[serde(default)]
    pub target_id: Option<String>,
    #[serde(default)]
    pub room_id: Option<String>,
}

impl Envelope {
    pub fn parse(text: &str) -> Result<Self> {
        let envelope: Envelope = serde_json::from_str(text)
            .map_err(|e| Error::Protocol(format!("invalid frame: {}", e)))?;
        if envelope.kind.is_empty() {
            return Err(Error::Protocol("frame has empty type".to_string()));
        }
        Ok(envelope)
    }
}

/// `leave` frame the relay emits on behalf of a disconnected transport.
pub fn leave_frame(room_id: &str, sender_id: &str) -> Result<String> {
    SignalMessage::new(sender_id, Signal::Leave).stamped(room_id).to_json()
}
