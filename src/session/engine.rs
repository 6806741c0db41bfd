use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::events::{EventSender, SessionEvent};
use crate::media::{ConnectionEvent, LocalMedia, LocalTrack, PeerManager, PeerSnapshot, TrackKind};
use crate::models::{now_millis, ChatMessage, Presence, PresenceUpdate, Reaction};
use crate::roster::{Roster, RosterChange};
use crate::signaling::{Signal, SignalMessage, SignalTransport, TransportState};

use super::{SessionCommand, SessionState};

pub(super) struct Channels {
    pub commands: mpsc::Receiver<SessionCommand>,
    pub inbound: broadcast::Receiver<SignalMessage>,
    pub transport: watch::Receiver<TransportState>,
    pub connections: mpsc::Receiver<ConnectionEvent>,
    pub outbox: mpsc::UnboundedReceiver<SignalMessage>,
}

pub(super) struct Engine {
    config: SessionConfig,
    local: Presence,
    transport: Arc<dyn SignalTransport>,
    transport_state: TransportState,
    roster: Roster,
    peers: PeerManager,
    microphone: Option<LocalTrack>,
    camera: LocalTrack,
    screen: Option<LocalTrack>,
    chat: Vec<ChatMessage>,
    reactions: Vec<(Reaction, Instant)>,
    connections: Vec<PeerSnapshot>,
    event_tx: EventSender,
    state_tx: watch::Sender<SessionState>,
    /// `join` went out on an earlier connection.
    announced: bool,
    left: bool,
}

impl Engine {
    pub(super) fn new(
        config: SessionConfig,
        local: Presence,
        transport: Arc<dyn SignalTransport>,
        peers: PeerManager,
        media: LocalMedia,
        event_tx: EventSender,
        state_tx: watch::Sender<SessionState>,
    ) -> Self {
        Self {
            roster: Roster::new(local.id.clone()),
            config,
            local,
            transport,
            transport_state: TransportState::Idle,
            peers,
            microphone: media.microphone,
            camera: media.camera,
            screen: None,
            chat: Vec::new(),
            reactions: Vec::new(),
            connections: Vec::new(),
            event_tx,
            state_tx,
            announced: false,
            left: false,
        }
    }

    /// Run the session loop until `leave` or until every handle is dropped.
    pub(super) async fn run(mut self, mut channels: Channels) {
        info!("Session for {} started in room {}", self.local.id, self.config.room_id);

        if let Some(mic) = self.microphone.clone() {
            self.peers.set_outgoing_track(mic).await;
        }
        self.peers.set_outgoing_track(self.camera.clone()).await;

        let initial = *channels.transport.borrow_and_update();
        self.on_transport_state(initial).await;
        self.publish();

        loop {
            let next_expiry = self.reactions.iter().map(|(_, deadline)| *deadline).min();

            tokio::select! {
                command = channels.commands.recv() => {
                    match command {
                        Some(SessionCommand::Leave(done)) => {
                            self.leave().await;
                            let _ = done.send(());
                            break;
                        }
                        Some(command) => self.handle_command(command).await,
                        None => {
                            debug!("All session handles dropped");
                            self.leave().await;
                            break;
                        }
                    }
                }
                received = channels.inbound.recv() => {
                    match received {
                        Ok(message) => self.handle_signal(message).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Session lagged, skipped {} signal messages", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            self.leave().await;
                            break;
                        }
                    }
                }
                changed = channels.transport.changed() => {
                    if changed.is_err() {
                        self.leave().await;
                        break;
                    }
                    let state = *channels.transport.borrow_and_update();
                    self.on_transport_state(state).await;
                }
                Some(event) = channels.connections.recv() => {
                    if let Some((peer_id, stream)) = self.peers.handle_connection_event(event) {
                        if !self.roster.contains(&peer_id) {
                            self.roster.update(&peer_id, None, &PresenceUpdate::default());
                        }
                        self.roster.attach_stream(&peer_id, stream.clone());
                        let _ = self.event_tx.send(SessionEvent::RemoteStreamAttached { peer_id, stream });
                    }
                }
                Some(message) = channels.outbox.recv() => {
                    let _ = self.transport.send(message);
                }
                _ = tokio::time::sleep_until(next_expiry.unwrap_or_else(Instant::now)), if next_expiry.is_some() => {
                    self.expire_reactions();
                }
            }

            self.publish();
        }

        self.publish();
        info!("Session for {} ended", self.local.id);
    }

    fn broadcast(&self, signal: Signal) {
        let _ = self
            .transport
            .send(SignalMessage::new(self.local.id.clone(), signal));
    }

    fn broadcast_update(&self, update: PresenceUpdate) {
        self.broadcast(Signal::UpdateState(PresenceUpdate {
            id: Some(self.local.id.clone()),
            ..update
        }));
    }

    async fn on_transport_state(&mut self, state: TransportState) {
        if state == self.transport_state {
            return;
        }
        self.transport_state = state;
        let _ = self.event_tx.send(SessionEvent::TransportStateChanged { state });

        if state != TransportState::Connected || self.left {
            return;
        }
        if self.announced {
            self.rejoin().await;
        }
        info!("Announcing {} in room {}", self.local.id, self.config.room_id);
        self.broadcast(Signal::Join(self.local.clone()));
        self.announced = true;
    }

    /// The relay told the room we left when the socket dropped, so every member has already
    /// torn down its side. Start over from an empty room; members reconnect on our `join`.
    async fn rejoin(&mut self) {
        info!("Reconnected to room {}, rejoining", self.config.room_id);
        self.peers.reset().await;
        let gone: Vec<String> = self.roster.peers().iter().map(|p| p.id.clone()).collect();
        self.roster.clear();
        for peer_id in gone {
            let _ = self.event_tx.send(SessionEvent::PeerLeft { peer_id });
        }
    }

    async fn handle_signal(&mut self, message: SignalMessage) {
        if self.left || message.sender_id == self.local.id {
            return;
        }
        if !message.is_for(&self.local.id) {
            debug!("Ignoring {} for {:?}", message.body.kind(), message.target_id);
            return;
        }

        let SignalMessage {
            body,
            sender_id,
            target_id,
            ..
        } = message;

        match body {
            Signal::Join(presence) => self.on_join(&sender_id, presence).await,
            Signal::Leave => self.on_leave(&sender_id).await,
            Signal::Offer(offer) => self.peers.handle_offer(&sender_id, offer).await,
            Signal::Answer(answer) => self.peers.handle_answer(&sender_id, answer).await,
            Signal::IceCandidate(candidate) => {
                self.peers.handle_ice_candidate(&sender_id, candidate).await
            }
            Signal::UpdateState(update) => self.on_update(&sender_id, target_id.as_deref(), update),
            Signal::Chat(chat) => self.on_chat(chat),
            Signal::Reaction(reaction) => self.on_reaction(reaction),
        }
    }

    async fn on_join(&mut self, sender_id: &str, mut presence: Presence) {
        if presence.id != sender_id {
            debug!("Join payload id {} differs from sender {}", presence.id, sender_id);
            presence.id = sender_id.to_string();
        }

        if self.roster.join(presence) == RosterChange::Added {
            if let Some(peer) = self.roster.get(sender_id) {
                info!("{} ({}) joined", peer.display_name, sender_id);
                let _ = self.event_tx.send(SessionEvent::PeerJoined(peer.clone()));
            }
        }

        // Greet the newcomer so it learns about us without a roster dump
        let greeting = SignalMessage::new(
            self.local.id.clone(),
            Signal::UpdateState(PresenceUpdate::from(self.local.clone())),
        )
        .to(sender_id);
        let _ = self.transport.send(greeting);

        self.peers.connect_to(sender_id).await;
    }

    async fn on_leave(&mut self, sender_id: &str) {
        if self.roster.leave(sender_id) == RosterChange::Removed {
            info!("{} left", sender_id);
            let _ = self.event_tx.send(SessionEvent::PeerLeft {
                peer_id: sender_id.to_string(),
            });
        }
        self.peers.close_peer(sender_id).await;
    }

    fn on_update(&mut self, sender_id: &str, target_id: Option<&str>, update: PresenceUpdate) {
        let peer_id = update.id.clone().unwrap_or_else(|| sender_id.to_string());
        match self.roster.update(sender_id, target_id, &update) {
            RosterChange::Added | RosterChange::Updated => {
                if let Some(peer) = self.roster.get(&peer_id) {
                    let _ = self.event_tx.send(SessionEvent::PeerUpdated(peer.clone()));
                }
            }
            RosterChange::Removed | RosterChange::Unchanged => {}
        }
    }

    fn on_chat(&mut self, chat: ChatMessage) {
        if self.chat.iter().any(|c| c.id == chat.id) {
            return;
        }
        debug!("Chat from {}", chat.sender_id);
        self.chat.push(chat.clone());
        let _ = self.event_tx.send(SessionEvent::ChatReceived(chat));
    }

    fn on_reaction(&mut self, reaction: Reaction) {
        if self.reactions.iter().any(|(r, _)| r.id == reaction.id) {
            return;
        }
        let deadline = Instant::now() + self.config.reaction_ttl();
        self.reactions.push((reaction.clone(), deadline));
        let _ = self.event_tx.send(SessionEvent::ReactionReceived(reaction));
    }

    fn expire_reactions(&mut self) {
        let now = Instant::now();
        let (expired, active): (Vec<_>, Vec<_>) =
            self.reactions.drain(..).partition(|(_, deadline)| *deadline <= now);
        self.reactions = active;
        for (reaction, _) in expired {
            let _ = self.event_tx.send(SessionEvent::ReactionExpired {
                reaction_id: reaction.id,
            });
        }
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        if self.left {
            warn!("Session already left, ignoring {:?}", command);
            return;
        }

        match command {
            SessionCommand::SendChat { text } => {
                if text.trim().is_empty() {
                    return;
                }
                let chat = ChatMessage {
                    id: uuid::Uuid::new_v4().to_string(),
                    sender_id: self.local.id.clone(),
                    sender_name: self.local.display_name.clone(),
                    text,
                    timestamp: now_millis(),
                };
                // Shown locally right away, not on echo
                self.chat.push(chat.clone());
                self.broadcast(Signal::Chat(chat));
            }
            SessionCommand::SendReaction { emoji } => {
                let reaction = Reaction {
                    id: uuid::Uuid::new_v4().to_string(),
                    sender_id: self.local.id.clone(),
                    emoji,
                    timestamp: now_millis(),
                };
                let deadline = Instant::now() + self.config.reaction_ttl();
                self.reactions.push((reaction.clone(), deadline));
                self.broadcast(Signal::Reaction(reaction));
            }
            SessionCommand::SetMuted(muted) => {
                self.local.is_muted = muted;
                self.broadcast_update(PresenceUpdate {
                    is_muted: Some(muted),
                    ..PresenceUpdate::default()
                });
            }
            SessionCommand::SetCameraOff(off) => {
                self.local.is_camera_off = off;
                self.broadcast_update(PresenceUpdate {
                    is_camera_off: Some(off),
                    ..PresenceUpdate::default()
                });
            }
            SessionCommand::StartScreenShare(track) => {
                if track.kind() != TrackKind::Video {
                    warn!("Screen share needs a video track, got {:?}", track.kind());
                    return;
                }
                info!("Starting screen share");
                self.screen = Some(track.clone());
                self.peers.set_outgoing_track(track).await;
                self.local.is_screen_sharing = true;
                self.broadcast_update(PresenceUpdate {
                    is_screen_sharing: Some(true),
                    ..PresenceUpdate::default()
                });
            }
            SessionCommand::StopScreenShare => {
                if self.screen.take().is_none() {
                    return;
                }
                info!("Stopping screen share");
                self.peers.set_outgoing_track(self.camera.clone()).await;
                self.local.is_screen_sharing = false;
                self.broadcast_update(PresenceUpdate {
                    is_screen_sharing: Some(false),
                    ..PresenceUpdate::default()
                });
            }
            SessionCommand::ReplaceMedia(media) => {
                self.camera = media.camera;
                if self.screen.is_none() {
                    self.peers.set_outgoing_track(self.camera.clone()).await;
                }
                if let Some(mic) = media.microphone {
                    self.microphone = Some(mic.clone());
                    self.peers.set_outgoing_track(mic).await;
                }
            }
            SessionCommand::Leave(done) => {
                self.leave().await;
                let _ = done.send(());
            }
        }
    }

    async fn leave(&mut self) {
        if self.left {
            return;
        }
        info!("Leaving room {}", self.config.room_id);
        self.broadcast(Signal::Leave);
        self.peers.close_all().await;
        self.roster.clear();
        self.reactions.clear();
        self.screen = None;
        self.transport.close();
        self.left = true;
        let _ = self.event_tx.send(SessionEvent::Left);
    }

    fn publish(&mut self) {
        let connections = self.peers.snapshot();
        for snapshot in &connections {
            if !self.connections.contains(snapshot) {
                let _ = self.event_tx.send(SessionEvent::ConnectionStateChanged {
                    peer_id: snapshot.peer_id.clone(),
                    state: snapshot.state,
                });
            }
        }
        for gone in self
            .connections
            .iter()
            .filter(|old| !connections.iter().any(|c| c.peer_id == old.peer_id))
        {
            let _ = self.event_tx.send(SessionEvent::ConnectionStateChanged {
                peer_id: gone.peer_id.clone(),
                state: crate::media::NegotiationState::Closed,
            });
        }
        self.connections = connections;

        self.state_tx.send_replace(SessionState {
            room_id: self.config.room_id.clone(),
            local: self.local.clone(),
            transport: self.transport_state,
            peers: self.roster.peers().to_vec(),
            connections: self.connections.clone(),
            chat: self.chat.clone(),
            reactions: self.reactions.iter().map(|(r, _)| r.clone()).collect(),
            left: self.left,
        });
    }
}
