//! In-memory connection backend.
//!
//! Produces deterministic session descriptions that list the attached senders, reports one
//! synthetic host candidate and `connected` as soon as both descriptions are applied, and
//! surfaces the remote side's senders as remote tracks. Used by headless demo runs and tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::media::connection::{ConnectionEvent, ConnectionFactory, LinkState, MediaConnection};
use crate::media::{LocalTrack, RemoteTrack, TrackKind};
use crate::signaling::protocol::{IceCandidate, SdpKind, SessionDescription};

#[derive(Default)]
pub struct LoopbackFactory {
    connections: Mutex<HashMap<String, Arc<LoopbackConnection>>>,
}

impl LoopbackFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent connection created towards `peer_id`.
    pub async fn connection(&self, peer_id: &str) -> Option<Arc<LoopbackConnection>> {
        self.connections.lock().await.get(peer_id).cloned()
    }

    pub async fn created(&self) -> usize {
        self.connections.lock().await.len()
    }
}

#[async_trait]
impl ConnectionFactory for LoopbackFactory {
    async fn create(
        &self,
        peer_id: &str,
        events: mpsc::Sender<ConnectionEvent>,
    ) -> Result<Arc<dyn MediaConnection>> {
        let conn = Arc::new(LoopbackConnection {
            peer_id: peer_id.to_string(),
            events,
            inner: Mutex::new(Inner::default()),
        });
        self.connections
            .lock()
            .await
            .insert(peer_id.to_string(), conn.clone());
        Ok(conn)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Signaling {
    #[default]
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

struct Sender {
    kind: TrackKind,
    track_id: String,
    stream_id: String,
}

#[derive(Default)]
struct Inner {
    signaling: Signaling,
    senders: Vec<Sender>,
    pending_local: Option<SessionDescription>,
    current_local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    seen_remote_tracks: HashSet<String>,
    remote_candidates: Vec<IceCandidate>,
    offers_created: usize,
    version: u64,
    connected: bool,
    closed: bool,
}

impl Inner {
    fn describe(&mut self, kind: SdpKind) -> SessionDescription {
        self.version += 1;
        let mut sdp = format!(
            "v=0\r\no=loopback 0 {} IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
            self.version
        );
        for sender in &self.senders {
            let media = match sender.kind {
                TrackKind::Audio => "audio",
                TrackKind::Video => "video",
            };
            sdp.push_str(&format!(
                "m={}\r\na=msid:{} {}\r\n",
                media, sender.stream_id, sender.track_id
            ));
        }
        SessionDescription { kind, sdp }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }
}

pub struct LoopbackConnection {
    peer_id: String,
    events: mpsc::Sender<ConnectionEvent>,
    inner: Mutex<Inner>,
}

impl LoopbackConnection {
    /// Kinds of the attached senders, in attach order.
    pub async fn sender_kinds(&self) -> Vec<TrackKind> {
        self.inner.lock().await.senders.iter().map(|s| s.kind).collect()
    }

    pub async fn sender_track_ids(&self) -> Vec<String> {
        self.inner
            .lock()
            .await
            .senders
            .iter()
            .map(|s| s.track_id.clone())
            .collect()
    }

    pub async fn offers_created(&self) -> usize {
        self.inner.lock().await.offers_created
    }

    pub async fn remote_candidates(&self) -> usize {
        self.inner.lock().await.remote_candidates.len()
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.closed
    }

    /// Report the link as failed, as ICE would after losing every candidate pair.
    pub fn fail_link(&self) {
        self.emit(ConnectionEvent::LinkStateChanged {
            peer_id: self.peer_id.clone(),
            state: LinkState::Failed,
        });
    }

    // The session loop consumes these events and may be the caller of this connection, so
    // never wait for channel capacity here.
    fn emit(&self, event: ConnectionEvent) {
        if let Err(e) = self.events.try_send(event) {
            warn!("Loopback event for {} dropped: {}", self.peer_id, e);
        }
    }

    fn remote_tracks(&self, inner: &mut Inner, description: &SessionDescription) {
        let mut kind = None;
        for line in description.sdp.lines() {
            if let Some(media) = line.strip_prefix("m=") {
                kind = match media.split_whitespace().next() {
                    Some("audio") => Some(TrackKind::Audio),
                    Some("video") => Some(TrackKind::Video),
                    _ => None,
                };
            } else if let Some(msid) = line.strip_prefix("a=msid:") {
                let mut parts = msid.split_whitespace();
                let (Some(stream_id), Some(track_id), Some(kind)) = (parts.next(), parts.next(), kind)
                else {
                    continue;
                };
                if inner.seen_remote_tracks.insert(track_id.to_string()) {
                    self.emit(ConnectionEvent::RemoteTrack {
                        peer_id: self.peer_id.clone(),
                        stream_id: stream_id.to_string(),
                        track: RemoteTrack {
                            id: track_id.to_string(),
                            kind,
                            handle: None,
                        },
                    });
                }
            }
        }
    }

    fn maybe_connect(&self, inner: &mut Inner) {
        if inner.connected || inner.current_local.is_none() || inner.remote.is_none() {
            return;
        }
        inner.connected = true;
        self.emit(ConnectionEvent::IceCandidate {
            peer_id: self.peer_id.clone(),
            candidate: IceCandidate {
                candidate: "candidate:1 1 udp 2130706431 127.0.0.1 9 typ host".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            },
        });
        self.emit(ConnectionEvent::LinkStateChanged {
            peer_id: self.peer_id.clone(),
            state: LinkState::Connected,
        });
    }
}

#[async_trait]
impl MediaConnection for LoopbackConnection {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let mut inner = self.inner.lock().await;
        inner.ensure_open()?;
        if inner.signaling == Signaling::HaveRemoteOffer {
            return Err(Error::negotiation("cannot offer while a remote offer is pending"));
        }
        let offer = inner.describe(SdpKind::Offer);
        inner.pending_local = Some(offer.clone());
        inner.signaling = Signaling::HaveLocalOffer;
        inner.offers_created += 1;
        Ok(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let mut inner = self.inner.lock().await;
        inner.ensure_open()?;
        if inner.signaling != Signaling::HaveRemoteOffer {
            return Err(Error::negotiation("no remote offer to answer"));
        }
        let answer = inner.describe(SdpKind::Answer);
        inner.current_local = Some(answer.clone());
        inner.signaling = Signaling::Stable;
        self.maybe_connect(&mut inner);
        Ok(answer)
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.ensure_open()?;
        if !description.sdp.starts_with("v=0") {
            return Err(Error::negotiation("malformed session description"));
        }

        match description.kind {
            SdpKind::Offer => {
                if inner.signaling == Signaling::HaveLocalOffer {
                    return Err(Error::negotiation("remote offer collides with local offer"));
                }
                inner.signaling = Signaling::HaveRemoteOffer;
            }
            SdpKind::Answer | SdpKind::Pranswer => {
                if inner.signaling != Signaling::HaveLocalOffer {
                    return Err(Error::negotiation("answer without a local offer"));
                }
                inner.current_local = inner.pending_local.take();
                inner.signaling = Signaling::Stable;
            }
            SdpKind::Rollback => {
                return Err(Error::negotiation("remote rollback is not supported"));
            }
        }

        self.remote_tracks(&mut inner, &description);
        inner.remote = Some(description);
        self.maybe_connect(&mut inner);
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.ensure_open()?;
        if inner.signaling != Signaling::HaveLocalOffer {
            return Err(Error::negotiation("no local offer to roll back"));
        }
        inner.pending_local = None;
        inner.signaling = Signaling::Stable;
        debug!("Loopback connection to {} rolled back", self.peer_id);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.ensure_open()?;
        if inner.remote.is_none() {
            return Err(Error::negotiation("candidate before remote description"));
        }
        inner.remote_candidates.push(candidate);
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.ensure_open()?;
        inner.senders.push(Sender {
            kind: track.kind(),
            track_id: track.id().to_string(),
            stream_id: track.stream_id().to_string(),
        });
        Ok(())
    }

    async fn replace_track(&self, track: &LocalTrack) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.ensure_open()?;
        let sender = inner
            .senders
            .iter_mut()
            .find(|s| s.kind == track.kind())
            .ok_or_else(|| Error::media(format!("no {:?} sender", track.kind())))?;
        sender.track_id = track.id().to_string();
        sender.stream_id = track.stream_id().to_string();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Ok(());
        }
        inner.closed = true;
        inner.senders.clear();
        self.emit(ConnectionEvent::LinkStateChanged {
            peer_id: self.peer_id.clone(),
            state: LinkState::Closed,
        });
        Ok(())
    }
}
