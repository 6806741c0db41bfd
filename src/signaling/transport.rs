use serde::Serialize;
use tokio::sync::{broadcast, watch};

use crate::error::Result;
use super::protocol::SignalMessage;

/// Lifecycle of a signal transport.
///
/// ```text
/// idle -> connecting -> connected -> backoff -> connecting -> ...
///                 \______________________/
/// any  -> closed (explicit close only)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    Idle,
    Connecting,
    Connected,
    Backoff,
    Closed,
}

/// Inputs driving [`TransportState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// A connection attempt starts.
    Dial,
    /// The socket opened.
    Opened,
    /// The attempt failed or an open socket dropped.
    Lost,
    /// The fixed retry delay elapsed.
    RetryDue,
    /// `close()` was called.
    Shutdown,
}

impl TransportState {
    pub fn on(self, event: LinkEvent) -> TransportState {
        use LinkEvent::*;
        use TransportState::*;

        match (self, event) {
            (Closed, _) => Closed,
            (_, Shutdown) => Closed,
            (Idle, Dial) | (Backoff, RetryDue) | (Backoff, Dial) => Connecting,
            (Connecting, Opened) => Connected,
            (Connecting, Lost) | (Connected, Lost) => Backoff,
            (state, _) => state,
        }
    }
}

/// Duplex channel between a client and the relay.
///
/// Implementations stamp every outbound message with their room id. `send` never queues:
/// while not connected the message is dropped and `Error::NotConnected` is returned.
pub trait SignalTransport: Send + Sync {
    /// Start connecting. Returns immediately; progress is reported through [`Self::state`].
    fn connect(&self) -> Result<()>;

    /// Fire-and-forget send.
    fn send(&self, message: SignalMessage) -> Result<()>;

    /// Stream of inbound messages.
    fn subscribe(&self) -> broadcast::Receiver<SignalMessage>;

    /// Current and future lifecycle states.
    fn state(&self) -> watch::Receiver<TransportState>;

    /// Stop for good. Idempotent.
    fn close(&self);

    fn room_id(&self) -> &str;
}
