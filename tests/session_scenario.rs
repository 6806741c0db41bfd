//! Two participants meeting in one room, over the in-process bus and over a real relay.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};

use meshtalk_lib::config::{SessionConfig, TransportConfig};
use meshtalk_lib::events::SessionEvent;
use meshtalk_lib::media::{
    LocalMedia, LocalTrack, LoopbackConnection, LoopbackFactory, NegotiationState, PeerRole,
};
use meshtalk_lib::models::{AvatarConfig, ChatMessage, Identity, PresenceUpdate};
use meshtalk_lib::relay::spawn_relay;
use meshtalk_lib::session::{self, SessionHandle, SessionState};
use meshtalk_lib::signaling::{
    LocalBus, LocalTransport, Signal, SignalMessage, SignalTransport, TransportState,
    WebSocketTransport,
};
use meshtalk_lib::{Error, Result};

const ROOM: &str = "sprint-standup";

struct Participant {
    session: SessionHandle,
    factory: Arc<LoopbackFactory>,
    transport: Arc<dyn SignalTransport>,
    camera_id: String,
}

/// Bus transport whose link can be cut and restored. Cutting it posts a `leave` for the
/// participant, which is what the relay does when a socket drops.
struct FlakyTransport {
    inner: LocalTransport,
    local_id: String,
    inbound_tx: broadcast::Sender<SignalMessage>,
    state_tx: watch::Sender<TransportState>,
}

impl FlakyTransport {
    fn new(bus: &LocalBus, id: &str) -> Self {
        let (inbound_tx, _) = broadcast::channel(256);
        let (state_tx, _) = watch::channel(TransportState::Idle);
        Self {
            inner: LocalTransport::new(bus.clone(), ROOM, id),
            local_id: id.to_string(),
            inbound_tx,
            state_tx,
        }
    }

    fn cut(&self) {
        self.state_tx.send_replace(TransportState::Backoff);
        let _ = self
            .inner
            .send(SignalMessage::new(self.local_id.clone(), Signal::Leave));
    }

    fn restore(&self) {
        self.state_tx.send_replace(TransportState::Connected);
    }
}

impl SignalTransport for FlakyTransport {
    fn connect(&self) -> Result<()> {
        let mut bus_rx = self.inner.subscribe();
        self.inner.connect()?;

        let inbound_tx = self.inbound_tx.clone();
        let state_rx = self.state_tx.subscribe();
        tokio::spawn(async move {
            while let Ok(message) = bus_rx.recv().await {
                if *state_rx.borrow() == TransportState::Connected {
                    let _ = inbound_tx.send(message);
                }
            }
        });

        self.state_tx.send_replace(TransportState::Connected);
        Ok(())
    }

    fn send(&self, message: SignalMessage) -> Result<()> {
        if *self.state_tx.borrow() != TransportState::Connected {
            return Err(Error::NotConnected);
        }
        self.inner.send(message)
    }

    fn subscribe(&self) -> broadcast::Receiver<SignalMessage> {
        self.inbound_tx.subscribe()
    }

    fn state(&self) -> watch::Receiver<TransportState> {
        self.state_tx.subscribe()
    }

    fn close(&self) {
        self.inner.close();
        self.state_tx.send_replace(TransportState::Closed);
    }

    fn room_id(&self) -> &str {
        self.inner.room_id()
    }
}

fn config(id: &str, name: &str) -> SessionConfig {
    let identity = Identity {
        id: id.to_string(),
        display_name: name.to_string(),
        avatar_config: AvatarConfig::default(),
    };
    let mut config = SessionConfig::new(ROOM, identity);
    config.reaction_ttl_ms = 200;
    config
}

fn start(id: &str, name: &str, transport: Arc<dyn SignalTransport>) -> Participant {
    let factory = Arc::new(LoopbackFactory::new());
    let media = LocalMedia::synthetic(id);
    let camera_id = media.camera.id().to_string();
    let session = session::start(config(id, name), transport.clone(), factory.clone(), media).unwrap();
    Participant {
        session,
        factory,
        transport,
        camera_id,
    }
}

fn on_bus(bus: &LocalBus, id: &str, name: &str) -> Participant {
    start(id, name, Arc::new(LocalTransport::new(bus.clone(), ROOM, id)))
}

async fn on_relay(url: &str, id: &str, name: &str) -> Participant {
    let mut transport = TransportConfig::new(url, ROOM);
    transport.reconnect_delay_ms = 100;
    let participant = start(id, name, Arc::new(WebSocketTransport::new(transport)));
    wait_for(&participant.session, "relay connection", |s| {
        s.transport == TransportState::Connected
    })
    .await;
    // Give the relay a moment to register the announced membership
    tokio::time::sleep(Duration::from_millis(100)).await;
    participant
}

async fn wait_for(
    session: &SessionHandle,
    what: &str,
    predicate: impl FnMut(&SessionState) -> bool,
) -> SessionState {
    let mut rx = session.watch_state();
    let state = match tokio::time::timeout(Duration::from_secs(5), rx.wait_for(predicate)).await {
        Ok(Ok(state)) => state.clone(),
        _ => panic!("timed out waiting for {}: {:#?}", what, session.state()),
    };
    state
}

async fn wait_for_sender(conn: &LoopbackConnection, track_id: &str) {
    let sent = tokio::time::timeout(Duration::from_secs(5), async {
        while !conn.sender_track_ids().await.iter().any(|id| id == track_id) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(sent.is_ok(), "track {} never became a sender", track_id);
}

fn connection(state: &SessionState, peer_id: &str) -> Option<(PeerRole, NegotiationState)> {
    state
        .connections
        .iter()
        .find(|c| c.peer_id == peer_id)
        .map(|c| (c.role, c.state))
}

/// A is already in the room when B arrives, so A offers and B answers.
async fn meet(alice: &Participant, bob: &Participant) {
    let a = wait_for(&alice.session, "alice connected to bob", |s| {
        matches!(connection(s, "bob"), Some((_, NegotiationState::Connected)))
    })
    .await;
    assert_eq!(connection(&a, "bob").unwrap().0, PeerRole::Initiator);
    assert_eq!(a.peers.len(), 1);
    assert_eq!(a.peers[0].display_name, "Bob");

    let b = wait_for(&bob.session, "bob connected to alice", |s| {
        matches!(connection(s, "alice"), Some((_, NegotiationState::Connected)))
    })
    .await;
    assert_eq!(connection(&b, "alice").unwrap().0, PeerRole::Answerer);

    let b = wait_for(&bob.session, "alice's media at bob", |s| {
        s.peers
            .iter()
            .any(|p| p.id == "alice" && p.stream.as_ref().is_some_and(|st| st.tracks.len() == 2))
    })
    .await;
    let record = b.peers.iter().find(|p| p.id == "alice").unwrap();
    assert_eq!(record.display_name, "Alice");
    assert_eq!(record.stream.as_ref().unwrap().stream_id, "alice");
}

#[tokio::test]
async fn test_standup_over_local_bus() {
    let bus = LocalBus::new();
    let mut tap = bus.subscribe();

    let alice = on_bus(&bus, "alice", "Alice");
    wait_for(&alice.session, "alice transport", |s| {
        s.transport == TransportState::Connected
    })
    .await;
    let bob = on_bus(&bus, "bob", "Bob");

    meet(&alice, &bob).await;
    let to_bob = alice.factory.connection("bob").await.unwrap();
    assert_eq!(to_bob.offers_created().await, 1);
    assert_eq!(bob.factory.connection("alice").await.unwrap().offers_created().await, 0);

    // Screen share swaps the video sender in place
    while tap.try_recv().is_ok() {}
    let screen = LocalTrack::screen("alice");
    let screen_id = screen.id().to_string();
    alice.session.start_screen_share(screen).await.unwrap();

    wait_for(&bob.session, "screen share flag at bob", |s| {
        s.peers.iter().any(|p| p.id == "alice" && p.is_screen_sharing)
    })
    .await;
    assert!(alice.session.state().local.is_screen_sharing);
    assert_eq!(to_bob.offers_created().await, 1);
    assert!(to_bob.sender_track_ids().await.contains(&screen_id));
    while let Ok(message) = tap.try_recv() {
        assert!(!matches!(message.body, Signal::Offer(_)), "screen share must not renegotiate");
    }

    alice.session.stop_screen_share().await.unwrap();
    wait_for(&bob.session, "screen share ended at bob", |s| {
        s.peers.iter().any(|p| p.id == "alice" && !p.is_screen_sharing)
    })
    .await;
    wait_for_sender(&to_bob, &alice.camera_id).await;
    assert!(!to_bob.sender_track_ids().await.contains(&screen_id));
    assert!(!alice.session.state().local.is_screen_sharing);
    assert_eq!(to_bob.offers_created().await, 1);
    while let Ok(message) = tap.try_recv() {
        assert!(!matches!(message.body, Signal::Offer(_)), "camera restore must not renegotiate");
    }

    bob.session.leave().await.unwrap();
    assert!(bob.session.state().left);

    let a = wait_for(&alice.session, "bob gone", |s| {
        s.peers.is_empty() && s.connections.is_empty()
    })
    .await;
    assert!(a.connections.is_empty());
    assert!(to_bob.is_closed().await);
}

#[tokio::test]
async fn test_chat_and_reactions() {
    let bus = LocalBus::new();
    let alice = on_bus(&bus, "alice", "Alice");
    wait_for(&alice.session, "alice transport", |s| {
        s.transport == TransportState::Connected
    })
    .await;
    let bob = on_bus(&bus, "bob", "Bob");
    meet(&alice, &bob).await;

    let mut bob_events = bob.session.subscribe();

    alice.session.send_chat("morning all").await.unwrap();
    alice.session.send_chat("   ").await.unwrap();
    let a = wait_for(&alice.session, "own chat", |s| !s.chat.is_empty()).await;
    assert_eq!(a.chat[0].text, "morning all");
    assert_eq!(a.chat[0].sender_name, "Alice");

    let b = wait_for(&bob.session, "chat at bob", |s| !s.chat.is_empty()).await;
    assert_eq!(b.chat.len(), 1);
    assert_eq!(b.chat[0].id, a.chat[0].id);

    alice.session.send_reaction("🎉").await.unwrap();
    let b = wait_for(&bob.session, "reaction at bob", |s| !s.reactions.is_empty()).await;
    assert_eq!(b.reactions[0].emoji, "🎉");
    wait_for(&bob.session, "reaction expired at bob", |s| s.reactions.is_empty()).await;
    wait_for(&alice.session, "reaction expired at alice", |s| s.reactions.is_empty()).await;

    let mut saw_chat = false;
    let mut saw_expiry = false;
    while let Ok(event) = bob_events.try_recv() {
        match event {
            SessionEvent::ChatReceived(chat) => saw_chat = chat.text == "morning all",
            SessionEvent::ReactionExpired { .. } => saw_expiry = true,
            _ => {}
        }
    }
    assert!(saw_chat);
    assert!(saw_expiry);

    alice.session.set_muted(true).await.unwrap();
    alice.session.set_camera_off(true).await.unwrap();
    wait_for(&bob.session, "presence flags at bob", |s| {
        s.peers
            .iter()
            .any(|p| p.id == "alice" && p.is_muted && p.is_camera_off && p.display_name == "Alice")
    })
    .await;
}

#[tokio::test]
async fn test_standup_over_relay() {
    let (addr, _relay) = spawn_relay("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let url = format!("ws://{}", addr);

    let alice = on_relay(&url, "alice", "Alice").await;
    let bob = on_relay(&url, "bob", "Bob").await;
    meet(&alice, &bob).await;

    let carol = on_relay(&url, "carol", "Carol").await;
    wait_for(&carol.session, "carol connected to both", |s| {
        s.connections.len() == 2
            && s.connections
                .iter()
                .all(|c| c.state == NegotiationState::Connected && c.role == PeerRole::Answerer)
    })
    .await;

    // Dropping the socket without a leave: the relay speaks for carol
    carol.transport.close();
    for session in [&alice.session, &bob.session] {
        wait_for(session, "carol removed", |s| {
            !s.peers.iter().any(|p| p.id == "carol")
                && !s.connections.iter().any(|c| c.peer_id == "carol")
        })
        .await;
    }
    assert!(alice.factory.connection("carol").await.unwrap().is_closed().await);

    alice.session.leave().await.unwrap();
    bob.session.leave().await.unwrap();
}

#[tokio::test]
async fn test_room_mismatch_is_rejected() {
    let bus = LocalBus::new();
    let transport: Arc<dyn SignalTransport> =
        Arc::new(LocalTransport::new(bus, "another-room", "alice"));
    let result = session::start(
        config("alice", "Alice"),
        transport,
        Arc::new(LoopbackFactory::new()),
        LocalMedia::synthetic("alice"),
    );
    assert!(matches!(result, Err(meshtalk_lib::Error::Config(_))));
}

async fn bus_pair(bus: &LocalBus) -> (Participant, Participant) {
    let alice = on_bus(bus, "alice", "Alice");
    wait_for(&alice.session, "alice transport", |s| {
        s.transport == TransportState::Connected
    })
    .await;
    let bob = on_bus(bus, "bob", "Bob");
    meet(&alice, &bob).await;
    (alice, bob)
}

#[tokio::test]
async fn test_new_camera_replaces_in_place_unless_sharing() {
    let bus = LocalBus::new();
    let mut tap = bus.subscribe();
    let (alice, bob) = bus_pair(&bus).await;
    let to_bob = alice.factory.connection("bob").await.unwrap();
    while tap.try_recv().is_ok() {}

    let swapped = LocalMedia::synthetic("alice");
    let swapped_camera = swapped.camera.id().to_string();
    let swapped_mic = swapped.microphone.as_ref().unwrap().id().to_string();
    alice.session.replace_media(swapped).await.unwrap();
    wait_for_sender(&to_bob, &swapped_camera).await;
    wait_for_sender(&to_bob, &swapped_mic).await;
    assert!(!to_bob.sender_track_ids().await.contains(&alice.camera_id));

    let screen = LocalTrack::screen("alice");
    let screen_id = screen.id().to_string();
    alice.session.start_screen_share(screen).await.unwrap();
    wait_for(&bob.session, "screen share flag at bob", |s| {
        s.peers.iter().any(|p| p.id == "alice" && p.is_screen_sharing)
    })
    .await;

    // While sharing, only the microphone follows the new devices
    let during_share = LocalMedia::synthetic("alice");
    let during_share_camera = during_share.camera.id().to_string();
    let during_share_mic = during_share.microphone.as_ref().unwrap().id().to_string();
    alice.session.replace_media(during_share).await.unwrap();
    wait_for_sender(&to_bob, &during_share_mic).await;
    let senders = to_bob.sender_track_ids().await;
    assert!(senders.contains(&screen_id));
    assert!(!senders.contains(&during_share_camera));

    // Ending the share brings back the most recent camera
    alice.session.stop_screen_share().await.unwrap();
    wait_for_sender(&to_bob, &during_share_camera).await;
    assert!(!to_bob.sender_track_ids().await.contains(&screen_id));

    assert_eq!(to_bob.offers_created().await, 1);
    assert_eq!(to_bob.sender_kinds().await.len(), 2);
    while let Ok(message) = tap.try_recv() {
        assert!(!matches!(message.body, Signal::Offer(_)), "device swaps must not renegotiate");
    }
}

#[tokio::test]
async fn test_failed_link_is_reported() {
    let bus = LocalBus::new();
    let (alice, _bob) = bus_pair(&bus).await;
    let mut events = alice.session.subscribe();

    alice.factory.connection("bob").await.unwrap().fail_link();

    let a = wait_for(&alice.session, "failed connection", |s| {
        matches!(connection(s, "bob"), Some((_, NegotiationState::Failed)))
    })
    .await;
    assert_eq!(connection(&a, "bob").unwrap().0, PeerRole::Initiator);
    assert_eq!(a.peers.len(), 1, "a failed link keeps the participant in the room");

    let mut reported = false;
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::ConnectionStateChanged { peer_id, state } = event {
            reported |= peer_id == "bob" && state == NegotiationState::Failed;
        }
    }
    assert!(reported);
}

#[tokio::test]
async fn test_reconnect_rejoins_with_fresh_connections() {
    let bus = LocalBus::new();
    let mut tap = bus.subscribe();

    let alice = on_bus(&bus, "alice", "Alice");
    wait_for(&alice.session, "alice transport", |s| {
        s.transport == TransportState::Connected
    })
    .await;
    let link = Arc::new(FlakyTransport::new(&bus, "bob"));
    let bob = start("bob", "Bob", link.clone());
    meet(&alice, &bob).await;

    let stale = bob.factory.connection("alice").await.unwrap();
    let mut bob_events = bob.session.subscribe();

    link.cut();
    wait_for(&alice.session, "bob dropped at alice", |s| {
        s.peers.is_empty() && s.connections.is_empty()
    })
    .await;
    wait_for(&bob.session, "bob backing off", |s| s.transport == TransportState::Backoff).await;
    while tap.try_recv().is_ok() {}

    link.restore();

    let a = wait_for(&alice.session, "alice reconnected to bob", |s| {
        matches!(connection(s, "bob"), Some((_, NegotiationState::Connected)))
    })
    .await;
    assert_eq!(connection(&a, "bob").unwrap().0, PeerRole::Initiator);
    assert_eq!(a.peers[0].display_name, "Bob");

    let b = wait_for(&bob.session, "bob reconnected to alice", |s| {
        matches!(connection(s, "alice"), Some((_, NegotiationState::Connected)))
            && s.peers.iter().any(|p| p.id == "alice")
    })
    .await;
    assert_eq!(connection(&b, "alice").unwrap().0, PeerRole::Answerer);

    assert!(stale.is_closed().await);
    let fresh = bob.factory.connection("alice").await.unwrap();
    assert!(!Arc::ptr_eq(&stale, &fresh));
    assert_eq!(fresh.sender_kinds().await.len(), 2, "outgoing media survives the rejoin");
    assert_eq!(
        alice.factory.connection("bob").await.unwrap().offers_created().await,
        1
    );

    let mut rejoined = false;
    while let Ok(message) = tap.try_recv() {
        rejoined |= message.sender_id == "bob" && matches!(message.body, Signal::Join(_));
    }
    assert!(rejoined, "bob should announce itself again");

    let mut dropped_alice = false;
    while let Ok(event) = bob_events.try_recv() {
        if let SessionEvent::PeerLeft { peer_id } = event {
            dropped_alice |= peer_id == "alice";
        }
    }
    assert!(dropped_alice);
}

#[tokio::test]
async fn test_messages_for_other_members_are_ignored() {
    let bus = LocalBus::new();
    let (_alice, bob) = bus_pair(&bus).await;

    let mallory = LocalTransport::new(bus.clone(), ROOM, "mallory");
    mallory.connect().unwrap();
    let update = PresenceUpdate {
        display_name: Some("Mallory".to_string()),
        ..PresenceUpdate::default()
    };
    mallory
        .send(SignalMessage::new("mallory", Signal::UpdateState(update)).to("carol"))
        .unwrap();
    mallory
        .send(SignalMessage::new(
            "mallory",
            Signal::Chat(ChatMessage {
                id: "chat-1".to_string(),
                sender_id: "mallory".to_string(),
                sender_name: "Mallory".to_string(),
                text: "anyone?".to_string(),
                timestamp: 0,
            }),
        ))
        .unwrap();

    let b = wait_for(&bob.session, "broadcast chat at bob", |s| !s.chat.is_empty()).await;
    assert!(!b.peers.iter().any(|p| p.id == "mallory"));
}
