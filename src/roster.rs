//! Client-side roster of remote participants.
//!
//! A plain reducer: the session feeds it `join`, `update-state` and `leave` messages and it
//! reports what changed. The local participant is never stored here.

use crate::media::RemoteStream;
use crate::models::{PeerRecord, Presence, PresenceUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RosterChange {
    Added,
    Updated,
    Removed,
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct Roster {
    local_id: String,
    peers: Vec<PeerRecord>,
}

impl Roster {
    pub fn new(local_id: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            peers: Vec::new(),
        }
    }

    /// Append the peer unless it is already known or is ourselves.
    pub fn join(&mut self, presence: Presence) -> RosterChange {
        if presence.id == self.local_id || self.contains(&presence.id) {
            return RosterChange::Unchanged;
        }
        self.peers.push(PeerRecord::from(presence));
        RosterChange::Added
    }

    /// Merge a partial update. Updates addressed to another participant are ignored.
    pub fn update(
        &mut self,
        sender_id: &str,
        target_id: Option<&str>,
        update: &PresenceUpdate,
    ) -> RosterChange {
        if target_id.is_some_and(|t| t != self.local_id) {
            return RosterChange::Unchanged;
        }

        let peer_id = update.id.as_deref().unwrap_or(sender_id);
        if peer_id == self.local_id {
            return RosterChange::Unchanged;
        }

        match self.peers.iter_mut().find(|p| p.id == peer_id) {
            Some(peer) => {
                peer.merge(update);
                RosterChange::Updated
            }
            None => {
                let mut peer = PeerRecord::placeholder(peer_id);
                peer.merge(update);
                self.peers.push(peer);
                RosterChange::Added
            }
        }
    }

    pub fn leave(&mut self, peer_id: &str) -> RosterChange {
        let before = self.peers.len();
        self.peers.retain(|p| p.id != peer_id);
        if self.peers.len() == before {
            RosterChange::Unchanged
        } else {
            RosterChange::Removed
        }
    }

    /// Attach (or extend) the remote stream of a known peer. Returns false for unknown peers.
    pub fn attach_stream(&mut self, peer_id: &str, stream: RemoteStream) -> bool {
        let Some(peer) = self.peers.iter_mut().find(|p| p.id == peer_id) else {
            return false;
        };
        match peer.stream {
            Some(ref mut existing) if existing.stream_id == stream.stream_id => {
                for track in stream.tracks {
                    if !existing.tracks.iter().any(|t| t.id == track.id) {
                        existing.tracks.push(track);
                    }
                }
            }
            _ => peer.stream = Some(stream),
        }
        true
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerRecord> {
        self.peers.iter().find(|p| p.id == peer_id)
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.get(peer_id).is_some()
    }

    pub fn peers(&self) -> &[PeerRecord] {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{RemoteTrack, TrackKind};
    use crate::models::{AvatarConfig, AvatarStyle};

    fn presence(id: &str, name: &str) -> Presence {
        Presence {
            id: id.to_string(),
            display_name: name.to_string(),
            avatar_config: AvatarConfig::default(),
            is_muted: false,
            is_camera_off: false,
            is_screen_sharing: false,
        }
    }

    fn stream(id: &str, tracks: &[&str]) -> RemoteStream {
        RemoteStream {
            stream_id: id.to_string(),
            tracks: tracks
                .iter()
                .map(|t| RemoteTrack {
                    id: t.to_string(),
                    kind: TrackKind::Video,
                    handle: None,
                })
                .collect(),
        }
    }

    #[test]
    fn test_join_is_idempotent_and_skips_self() {
        let mut roster = Roster::new("me");
        assert_eq!(roster.join(presence("b", "Bo")), RosterChange::Added);
        assert_eq!(roster.join(presence("b", "Bo again")), RosterChange::Unchanged);
        assert_eq!(roster.join(presence("me", "Me")), RosterChange::Unchanged);
        assert_eq!(roster.len(), 1);
        assert_eq!(roster.get("b").unwrap().display_name, "Bo");
    }

    #[test]
    fn test_update_merges_and_is_idempotent() {
        let mut roster = Roster::new("me");
        roster.join(presence("b", "Bo"));

        let update = PresenceUpdate {
            is_muted: Some(true),
            avatar_config: Some(AvatarConfig {
                style: AvatarStyle::Panda,
                ..AvatarConfig::default()
            }),
            ..PresenceUpdate::default()
        };
        roster.update("b", None, &update);
        let once = format!("{:?}", roster.peers());
        roster.update("b", None, &update);
        assert_eq!(format!("{:?}", roster.peers()), once);

        let peer = roster.get("b").unwrap();
        assert!(peer.is_muted);
        assert_eq!(peer.display_name, "Bo");
        assert_eq!(peer.avatar_config.style, AvatarStyle::Panda);
    }

    #[test]
    fn test_update_for_someone_else_is_ignored() {
        let mut roster = Roster::new("me");
        let update = PresenceUpdate::from(presence("c", "Cy"));
        assert_eq!(roster.update("c", Some("other"), &update), RosterChange::Unchanged);
        assert!(roster.is_empty());

        assert_eq!(roster.update("c", Some("me"), &update), RosterChange::Added);
        assert_eq!(roster.get("c").unwrap().display_name, "Cy");
    }

    #[test]
    fn test_update_creates_placeholder_from_sender() {
        let mut roster = Roster::new("me");
        let update = PresenceUpdate {
            is_screen_sharing: Some(true),
            ..PresenceUpdate::default()
        };
        assert_eq!(roster.update("d", None, &update), RosterChange::Added);
        assert!(roster.get("d").unwrap().is_screen_sharing);
    }

    #[test]
    fn test_update_preserves_stream() {
        let mut roster = Roster::new("me");
        roster.join(presence("b", "Bo"));
        assert!(roster.attach_stream("b", stream("s1", &["v1"])));
        assert!(roster.attach_stream("b", stream("s1", &["a1", "v1"])));

        roster.update("b", None, &PresenceUpdate {
            is_camera_off: Some(true),
            ..PresenceUpdate::default()
        });
        let peer = roster.get("b").unwrap();
        assert!(peer.is_camera_off);
        assert_eq!(peer.stream.as_ref().unwrap().tracks.len(), 2);
        assert!(!roster.attach_stream("ghost", stream("s2", &["v"])));
    }

    #[test]
    fn test_leave() {
        let mut roster = Roster::new("me");
        roster.join(presence("b", "Bo"));
        assert_eq!(roster.leave("b"), RosterChange::Removed);
        assert_eq!(roster.leave("b"), RosterChange::Unchanged);
    }
}
