//! Same-device fallback transport.
//!
//! Every [`LocalTransport`] attached to one [`LocalBus`] sees the messages of the others,
//! filtered to its own room. There is no relay in between, so targeted messages reach every
//! member and receivers filter on `targetId` themselves.

use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use super::protocol::SignalMessage;
use super::transport::{LinkEvent, SignalTransport, TransportState};

#[derive(Clone)]
pub struct LocalBus {
    tx: broadcast::Sender<SignalMessage>,
}

impl LocalBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    /// Tap every message posted on the bus, regardless of room.
    pub fn subscribe(&self) -> broadcast::Receiver<SignalMessage> {
        self.tx.subscribe()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

pub struct LocalTransport {
    bus: LocalBus,
    room_id: String,
    local_id: String,
    inbound_tx: broadcast::Sender<SignalMessage>,
    state_tx: watch::Sender<TransportState>,
    shutdown_tx: watch::Sender<bool>,
}

impl LocalTransport {
    pub fn new(bus: LocalBus, room_id: impl Into<String>, local_id: impl Into<String>) -> Self {
        let (inbound_tx, _) = broadcast::channel(256);
        let (state_tx, _) = watch::channel(TransportState::Idle);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            bus,
            room_id: room_id.into(),
            local_id: local_id.into(),
            inbound_tx,
            state_tx,
            shutdown_tx,
        }
    }

    fn advance(&self, event: LinkEvent) {
        self.state_tx.send_if_modified(|state| {
            let next = state.on(event);
            let changed = next != *state;
            *state = next;
            changed
        });
    }
}

impl SignalTransport for LocalTransport {
    fn connect(&self) -> Result<()> {
        match *self.state_tx.borrow() {
            TransportState::Closed => return Err(Error::Closed),
            TransportState::Idle => {}
            _ => return Ok(()),
        }

        let mut bus_rx = self.bus.subscribe();
        let mut shutdown = self.shutdown_tx.subscribe();
        let inbound_tx = self.inbound_tx.clone();
        let room_id = self.room_id.clone();
        let local_id = self.local_id.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = bus_rx.recv() => match received {
                        Ok(message) => {
                            if message.room_id.as_deref() == Some(room_id.as_str())
                                && message.sender_id != local_id
                            {
                                let _ = inbound_tx.send(message);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Local signal bus lagged, skipped {} messages", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Local transport for {} stopped", local_id);
        });

        self.advance(LinkEvent::Dial);
        self.advance(LinkEvent::Opened);
        Ok(())
    }

    fn send(&self, message: SignalMessage) -> Result<()> {
        if *self.state_tx.borrow() != TransportState::Connected {
            warn!(
                "Local transport not connected, dropping {} message",
                message.body.kind()
            );
            return Err(Error::NotConnected);
        }

        let _ = self.bus.tx.send(message.stamped(&self.room_id));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<SignalMessage> {
        self.inbound_tx.subscribe()
    }

    fn state(&self) -> watch::Receiver<TransportState> {
        self.state_tx.subscribe()
    }

    fn close(&self) {
        self.shutdown_tx.send_replace(true);
        self.advance(LinkEvent::Shutdown);
    }

    fn room_id(&self) -> &str {
        &self.room_id
    }
}
