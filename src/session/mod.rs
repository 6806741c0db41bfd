//! Per-user session controller.
//!
//! [`start`] spawns one task that owns the roster, the connection table and the local
//! media selection for a single room visit. Everything else talks to it through a
//! [`SessionHandle`].

mod engine;

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::events::{create_event_bus, EventReceiver, EventSender};
use crate::media::{ConnectionFactory, LocalMedia, LocalTrack, PeerManager, PeerSnapshot};
use crate::models::{ChatMessage, PeerRecord, Presence, Reaction};
use crate::signaling::{SignalTransport, TransportState};

#[derive(Debug)]
pub enum SessionCommand {
    SendChat { text: String },
    SendReaction { emoji: String },
    SetMuted(bool),
    SetCameraOff(bool),
    StartScreenShare(LocalTrack),
    StopScreenShare,
    /// New capture tracks from the device layer (e.g. a different camera was picked).
    ReplaceMedia(LocalMedia),
    Leave(oneshot::Sender<()>),
}

/// Snapshot published after every step of the session loop.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub room_id: String,
    pub local: Presence,
    pub transport: TransportState,
    pub peers: Vec<PeerRecord>,
    pub connections: Vec<PeerSnapshot>,
    pub chat: Vec<ChatMessage>,
    pub reactions: Vec<Reaction>,
    pub left: bool,
}

impl SessionState {
    fn initial(room_id: &str, local: Presence) -> Self {
        Self {
            room_id: room_id.to_string(),
            local,
            transport: TransportState::Idle,
            peers: Vec::new(),
            connections: Vec::new(),
            chat: Vec::new(),
            reactions: Vec::new(),
            left: false,
        }
    }
}

#[derive(Clone)]
pub struct SessionHandle {
    local_id: String,
    command_tx: mpsc::Sender<SessionCommand>,
    state_rx: watch::Receiver<SessionState>,
    event_tx: EventSender,
}

impl SessionHandle {
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn state(&self) -> SessionState {
        self.state_rx.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.event_tx.subscribe()
    }

    async fn command(&self, command: SessionCommand) -> Result<()> {
        self.command_tx.send(command).await.map_err(|_| Error::Closed)
    }

    pub async fn send_chat(&self, text: impl Into<String>) -> Result<()> {
        self.command(SessionCommand::SendChat { text: text.into() }).await
    }

    pub async fn send_reaction(&self, emoji: impl Into<String>) -> Result<()> {
        self.command(SessionCommand::SendReaction { emoji: emoji.into() }).await
    }

    pub async fn set_muted(&self, muted: bool) -> Result<()> {
        self.command(SessionCommand::SetMuted(muted)).await
    }

    pub async fn set_camera_off(&self, off: bool) -> Result<()> {
        self.command(SessionCommand::SetCameraOff(off)).await
    }

    pub async fn start_screen_share(&self, track: LocalTrack) -> Result<()> {
        self.command(SessionCommand::StartScreenShare(track)).await
    }

    pub async fn stop_screen_share(&self) -> Result<()> {
        self.command(SessionCommand::StopScreenShare).await
    }

    pub async fn replace_media(&self, media: LocalMedia) -> Result<()> {
        self.command(SessionCommand::ReplaceMedia(media)).await
    }

    /// Send `leave`, close every connection and the transport. Resolves once done.
    pub async fn leave(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.command(SessionCommand::Leave(done_tx)).await?;
        done_rx.await.map_err(|_| Error::Closed)
    }
}

/// Connect the transport and spawn the session loop.
pub fn start(
    config: SessionConfig,
    transport: Arc<dyn SignalTransport>,
    factory: Arc<dyn ConnectionFactory>,
    media: LocalMedia,
) -> Result<SessionHandle> {
    if config.room_id != transport.room_id() {
        return Err(Error::Config(format!(
            "session room {} does not match transport room {}",
            config.room_id,
            transport.room_id()
        )));
    }

    let local = Presence::from_identity(&config.identity);
    let local_id = local.id.clone();
    let (command_tx, command_rx) = mpsc::channel(64);
    let (event_tx, _) = create_event_bus();
    let (state_tx, state_rx) = watch::channel(SessionState::initial(&config.room_id, local.clone()));

    let (connection_tx, connection_rx) = mpsc::channel(256);
    let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
    let peers = PeerManager::new(local_id.clone(), factory, connection_tx, outbox_tx);

    // Subscribe before connecting so nothing delivered on connect is missed
    let channels = engine::Channels {
        commands: command_rx,
        inbound: transport.subscribe(),
        transport: transport.state(),
        connections: connection_rx,
        outbox: outbox_rx,
    };
    transport.connect()?;

    let engine = engine::Engine::new(config, local, transport, peers, media, event_tx.clone(), state_tx);
    tokio::spawn(engine.run(channels));

    Ok(SessionHandle {
        local_id,
        command_tx,
        state_rx,
        event_tx,
    })
}
