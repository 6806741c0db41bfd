//! Per-peer negotiation state machine.
//!
//! One [`PeerManager`] per session owns every connection of that session, keyed by remote
//! participant id. It is driven from a single task; nothing here is shared or locked.
//!
//! Offer collisions are resolved by id order: the participant with the lexicographically
//! lower id is polite and rolls back its own offer, the other one ignores the incoming offer.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::media::connection::{ConnectionEvent, ConnectionFactory, LinkState, MediaConnection};
use crate::media::{LocalTrack, RemoteStream, TrackKind};
use crate::signaling::protocol::{IceCandidate, SessionDescription, Signal, SignalMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    Initiator,
    Answerer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NegotiationState {
    Created,
    Negotiating,
    Connected,
    Renegotiating,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSnapshot {
    pub peer_id: String,
    pub role: PeerRole,
    pub state: NegotiationState,
}

struct PeerEntry {
    role: PeerRole,
    state: NegotiationState,
    connection: Arc<dyn MediaConnection>,
    sender_kinds: HashSet<TrackKind>,
    /// A local offer is out and unanswered.
    making_offer: bool,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
    needs_renegotiation: bool,
    link_connected: bool,
}

impl PeerEntry {
    fn begin_round(&mut self) {
        self.state = match self.state {
            NegotiationState::Created => NegotiationState::Negotiating,
            NegotiationState::Connected => NegotiationState::Renegotiating,
            other => other,
        };
    }

    fn finish_round(&mut self) {
        if matches!(
            self.state,
            NegotiationState::Negotiating | NegotiationState::Renegotiating | NegotiationState::Created
        ) {
            self.state = NegotiationState::Connected;
        }
    }

    async fn flush_candidates(&mut self, peer_id: &str) {
        for candidate in std::mem::take(&mut self.pending_candidates) {
            if let Err(e) = self.connection.add_ice_candidate(candidate).await {
                warn!("Failed to apply buffered ICE candidate from {}: {}", peer_id, e);
            }
        }
    }
}

pub struct PeerManager {
    local_id: String,
    factory: Arc<dyn ConnectionFactory>,
    /// Current outgoing tracks, at most one per kind.
    outgoing: Vec<LocalTrack>,
    peers: HashMap<String, PeerEntry>,
    event_tx: mpsc::Sender<ConnectionEvent>,
    outbox: mpsc::UnboundedSender<SignalMessage>,
}

impl PeerManager {
    pub fn new(
        local_id: impl Into<String>,
        factory: Arc<dyn ConnectionFactory>,
        event_tx: mpsc::Sender<ConnectionEvent>,
        outbox: mpsc::UnboundedSender<SignalMessage>,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            factory,
            outgoing: Vec::new(),
            peers: HashMap::new(),
            event_tx,
            outbox,
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    fn is_polite(&self, peer_id: &str) -> bool {
        self.local_id.as_str() < peer_id
    }

    fn send(&self, peer_id: &str, signal: Signal) {
        let message = SignalMessage::new(self.local_id.clone(), signal).to(peer_id);
        if self.outbox.send(message).is_err() {
            debug!("Outbox closed, dropping signal for {}", peer_id);
        }
    }

    async fn open(&self, peer_id: &str, role: PeerRole) -> crate::error::Result<PeerEntry> {
        let connection = self.factory.create(peer_id, self.event_tx.clone()).await?;
        let mut sender_kinds = HashSet::new();
        for track in &self.outgoing {
            connection.add_track(track).await?;
            sender_kinds.insert(track.kind());
        }
        info!("Created {:?} connection for {}", role, peer_id);
        Ok(PeerEntry {
            role,
            state: NegotiationState::Created,
            connection,
            sender_kinds,
            making_offer: false,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            needs_renegotiation: false,
            link_connected: false,
        })
    }

    /// Initiator path: open a connection towards a newly announced peer and offer.
    /// A second call for a known peer is a no-op.
    pub async fn connect_to(&mut self, peer_id: &str) {
        if peer_id == self.local_id || self.peers.contains_key(peer_id) {
            debug!("Connection to {} already exists", peer_id);
            return;
        }
        match self.open(peer_id, PeerRole::Initiator).await {
            Ok(entry) => {
                self.peers.insert(peer_id.to_string(), entry);
                self.send_offer(peer_id).await;
            }
            Err(e) => error!("Failed to create connection for {}: {}", peer_id, e),
        }
    }

    async fn send_offer(&mut self, peer_id: &str) {
        let Some(entry) = self.peers.get_mut(peer_id) else {
            return;
        };
        let offer = match entry.connection.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                error!("Failed to create offer for {}: {}", peer_id, e);
                return;
            }
        };
        entry.making_offer = true;
        entry.needs_renegotiation = false;
        entry.begin_round();
        info!("Sending offer to {}", peer_id);
        self.send(peer_id, Signal::Offer(offer));
    }

    /// Answerer path, also used for renegotiation offers on an existing connection.
    pub async fn handle_offer(&mut self, from: &str, offer: SessionDescription) {
        if !self.peers.contains_key(from) {
            match self.open(from, PeerRole::Answerer).await {
                Ok(entry) => {
                    self.peers.insert(from.to_string(), entry);
                }
                Err(e) => {
                    error!("Failed to create connection for {}: {}", from, e);
                    return;
                }
            }
        }

        let polite = self.is_polite(from);
        let Some(entry) = self.peers.get_mut(from) else {
            return;
        };

        if entry.making_offer {
            if !polite {
                info!("Ignoring colliding offer from {}", from);
                return;
            }
            info!("Offer collision with {}, rolling back local offer", from);
            if let Err(e) = entry.connection.rollback().await {
                error!("Failed to roll back offer to {}: {}", from, e);
                return;
            }
            entry.making_offer = false;
            entry.needs_renegotiation = true;
        }

        if let Err(e) = entry.connection.set_remote_description(offer).await {
            error!("Failed to apply offer from {}: {}", from, e);
            return;
        }
        entry.remote_description_set = true;
        entry.flush_candidates(from).await;

        let answer = match entry.connection.create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                error!("Failed to create answer for {}: {}", from, e);
                return;
            }
        };
        if entry.link_connected {
            entry.finish_round();
        } else {
            entry.begin_round();
        }
        let renegotiate = entry.needs_renegotiation;

        info!("Sending answer to {}", from);
        self.send(from, Signal::Answer(answer));

        if renegotiate {
            self.send_offer(from).await;
        }
    }

    pub async fn handle_answer(&mut self, from: &str, answer: SessionDescription) {
        let Some(entry) = self.peers.get_mut(from) else {
            warn!("Answer from unknown peer {}", from);
            return;
        };
        if !entry.making_offer {
            warn!("Unexpected answer from {}, no offer outstanding", from);
            return;
        }
        if let Err(e) = entry.connection.set_remote_description(answer).await {
            error!("Failed to apply answer from {}: {}", from, e);
            return;
        }
        entry.making_offer = false;
        entry.remote_description_set = true;
        entry.flush_candidates(from).await;
        entry.finish_round();
        info!("Applied answer from {}", from);

        if entry.needs_renegotiation {
            self.send_offer(from).await;
        }
    }

    pub async fn handle_ice_candidate(&mut self, from: &str, candidate: IceCandidate) {
        let Some(entry) = self.peers.get_mut(from) else {
            debug!("ICE candidate from unknown peer {}", from);
            return;
        };
        if !entry.remote_description_set {
            entry.pending_candidates.push(candidate);
            return;
        }
        if let Err(e) = entry.connection.add_ice_candidate(candidate).await {
            warn!("Failed to add ICE candidate from {}: {}", from, e);
        }
    }

    /// Apply a backend event. Returns a remote stream the session should attach to its roster.
    pub fn handle_connection_event(&mut self, event: ConnectionEvent) -> Option<(String, RemoteStream)> {
        match event {
            ConnectionEvent::IceCandidate { peer_id, candidate } => {
                if self.peers.contains_key(&peer_id) {
                    self.send(&peer_id, Signal::IceCandidate(candidate));
                }
                None
            }
            ConnectionEvent::LinkStateChanged { peer_id, state } => {
                let entry = self.peers.get_mut(&peer_id)?;
                match state {
                    LinkState::Connected => {
                        entry.link_connected = true;
                        if entry.state == NegotiationState::Negotiating {
                            entry.state = NegotiationState::Connected;
                        }
                    }
                    LinkState::Failed => {
                        entry.link_connected = false;
                        entry.state = NegotiationState::Failed;
                    }
                    LinkState::Disconnected => {
                        entry.link_connected = false;
                        warn!("Connection to {} disconnected", peer_id);
                    }
                    LinkState::New | LinkState::Connecting | LinkState::Closed => {}
                }
                None
            }
            ConnectionEvent::RemoteTrack {
                peer_id,
                stream_id,
                track,
            } => {
                if !self.peers.contains_key(&peer_id) {
                    return None;
                }
                Some((
                    peer_id,
                    RemoteStream {
                        stream_id,
                        tracks: vec![track],
                    },
                ))
            }
        }
    }

    /// Make `track` the outgoing track of its kind on every connection. An existing sender of
    /// that kind is swapped in place; otherwise a sender is added and the peer renegotiates.
    pub async fn set_outgoing_track(&mut self, track: LocalTrack) {
        let kind = track.kind();
        self.outgoing.retain(|t| t.kind() != kind);
        self.outgoing.push(track.clone());

        let mut renegotiate = Vec::new();
        for (peer_id, entry) in self.peers.iter_mut() {
            if entry.sender_kinds.contains(&kind) {
                if let Err(e) = entry.connection.replace_track(&track).await {
                    warn!("Failed to replace {:?} track for {}: {}", kind, peer_id, e);
                }
                continue;
            }
            match entry.connection.add_track(&track).await {
                Ok(()) => {
                    entry.sender_kinds.insert(kind);
                    renegotiate.push(peer_id.clone());
                }
                Err(e) => warn!("Failed to add {:?} track for {}: {}", kind, peer_id, e),
            }
        }

        for peer_id in renegotiate {
            self.renegotiate(&peer_id).await;
        }
    }

    /// Start a new offer round now, or once the current round has completed.
    pub async fn renegotiate(&mut self, peer_id: &str) {
        let Some(entry) = self.peers.get_mut(peer_id) else {
            return;
        };
        if entry.making_offer || entry.state != NegotiationState::Connected {
            debug!("Deferring renegotiation with {}", peer_id);
            entry.needs_renegotiation = true;
            return;
        }
        self.send_offer(peer_id).await;
    }

    /// Close and forget the connection to `peer_id`. Safe to call repeatedly.
    pub async fn close_peer(&mut self, peer_id: &str) -> bool {
        let Some(entry) = self.peers.remove(peer_id) else {
            return false;
        };
        if let Err(e) = entry.connection.close().await {
            warn!("Error closing connection to {}: {}", peer_id, e);
        }
        info!("Closed connection to {}", peer_id);
        true
    }

    /// Close every connection but keep the outgoing tracks, so connections opened afterwards
    /// start with the same media.
    pub async fn reset(&mut self) {
        let peer_ids: Vec<String> = self.peers.keys().cloned().collect();
        for peer_id in peer_ids {
            self.close_peer(&peer_id).await;
        }
    }

    pub async fn close_all(&mut self) {
        self.reset().await;
        self.outgoing.clear();
    }

    pub fn state(&self, peer_id: &str) -> Option<NegotiationState> {
        self.peers.get(peer_id).map(|e| e.state)
    }

    pub fn role(&self, peer_id: &str) -> Option<PeerRole> {
        self.peers.get(peer_id).map(|e| e.role)
    }

    pub fn has_peer(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn outgoing(&self) -> &[LocalTrack] {
        &self.outgoing
    }

    pub fn snapshot(&self) -> Vec<PeerSnapshot> {
        let mut peers: Vec<PeerSnapshot> = self
            .peers
            .iter()
            .map(|(peer_id, entry)| PeerSnapshot {
                peer_id: peer_id.clone(),
                role: entry.role,
                state: entry.state,
            })
            .collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        peers
    }
}
