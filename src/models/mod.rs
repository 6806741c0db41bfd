use serde::{Deserialize, Serialize};

use crate::media::RemoteStream;

// ============================================================
// Participant identity
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AvatarStyle {
    #[default]
    Cat,
    Dog,
    Bear,
    Rabbit,
    Fox,
    Panda,
    Unicorn,
    Koala,
    Tiger,
    Lion,
    Pig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Accessory {
    #[default]
    None,
    Glasses,
    Bow,
    Hat,
    Scarf,
    Headphones,
    Crown,
    Flower,
    Mask,
    Pirate,
    Monocle,
    Mustache,
    Bowtie,
    Beanie,
    Earrings,
    Visor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvatarConfig {
    pub style: AvatarStyle,
    /// Hex color, e.g. `#f59e0b`.
    pub color: String,
    pub accessory: Accessory,
}

impl Default for AvatarConfig {
    fn default() -> Self {
        Self {
            style: AvatarStyle::default(),
            color: "#f59e0b".to_string(),
            accessory: Accessory::default(),
        }
    }
}

/// Self-asserted identity of the local participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: String,
    pub display_name: String,
    pub avatar_config: AvatarConfig,
}

// ============================================================
// Presence (join / update-state payloads)
// ============================================================

/// Full presence carried by `join`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    pub id: String,
    pub display_name: String,
    pub avatar_config: AvatarConfig,
    #[serde(default)]
    pub is_muted: bool,
    #[serde(default)]
    pub is_camera_off: bool,
    #[serde(default)]
    pub is_screen_sharing: bool,
}

impl Presence {
    pub fn from_identity(identity: &Identity) -> Self {
        Self {
            id: identity.id.clone(),
            display_name: identity.display_name.clone(),
            avatar_config: identity.avatar_config.clone(),
            is_muted: false,
            is_camera_off: false,
            is_screen_sharing: false,
        }
    }
}

/// Partial presence carried by `update-state`. Absent fields are left untouched on merge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_config: Option<AvatarConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_muted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_camera_off: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_screen_sharing: Option<bool>,
}

impl From<Presence> for PresenceUpdate {
    fn from(p: Presence) -> Self {
        Self {
            id: Some(p.id),
            display_name: Some(p.display_name),
            avatar_config: Some(p.avatar_config),
            is_muted: Some(p.is_muted),
            is_camera_off: Some(p.is_camera_off),
            is_screen_sharing: Some(p.is_screen_sharing),
        }
    }
}

// ============================================================
// Chat & reactions
// ============================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub text: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub id: String,
    pub sender_id: String,
    pub emoji: String,
    pub timestamp: i64,
}

// ============================================================
// Roster entries
// ============================================================

/// A remote participant as known to the local session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    pub id: String,
    pub display_name: String,
    pub avatar_config: AvatarConfig,
    pub is_muted: bool,
    pub is_camera_off: bool,
    pub is_screen_sharing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<RemoteStream>,
}

impl PeerRecord {
    /// Record for a peer first seen through a partial update; unknown fields get defaults.
    pub fn placeholder(id: &str) -> Self {
        Self {
            id: id.to_string(),
            display_name: String::new(),
            avatar_config: AvatarConfig::default(),
            is_muted: false,
            is_camera_off: false,
            is_screen_sharing: false,
            stream: None,
        }
    }

    pub fn merge(&mut self, update: &PresenceUpdate) {
        if let Some(ref name) = update.display_name {
            self.display_name = name.clone();
        }
        if let Some(ref avatar) = update.avatar_config {
            self.avatar_config = avatar.clone();
        }
        if let Some(muted) = update.is_muted {
            self.is_muted = muted;
        }
        if let Some(off) = update.is_camera_off {
            self.is_camera_off = off;
        }
        if let Some(sharing) = update.is_screen_sharing {
            self.is_screen_sharing = sharing;
        }
    }
}

impl From<Presence> for PeerRecord {
    fn from(p: Presence) -> Self {
        Self {
            id: p.id,
            display_name: p.display_name,
            avatar_config: p.avatar_config,
            is_muted: p.is_muted,
            is_camera_off: p.is_camera_off,
            is_screen_sharing: p.is_screen_sharing,
            stream: None,
        }
    }
}

/// Milliseconds since the Unix epoch, as stamped on wire messages.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
