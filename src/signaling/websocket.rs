//! Persistent WebSocket transport with fixed-delay reconnection.
//!
//! There is no exponential backoff and no retry limit: after an unexpected close the
//! transport waits `reconnect_delay` and dials again, forever, until [`SignalTransport::close`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::error::{Error, Result};
use super::protocol::SignalMessage;
use super::transport::{LinkEvent, SignalTransport, TransportState};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub struct WebSocketTransport {
    config: TransportConfig,
    inbound_tx: broadcast::Sender<SignalMessage>,
    state_tx: Arc<watch::Sender<TransportState>>,
    outbound: OnceLock<mpsc::UnboundedSender<String>>,
    shutdown_tx: watch::Sender<bool>,
    attempts: Arc<AtomicU64>,
}

impl WebSocketTransport {
    pub fn new(config: TransportConfig) -> Self {
        let (inbound_tx, _) = broadcast::channel(256);
        let (state_tx, _) = watch::channel(TransportState::Idle);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            inbound_tx,
            state_tx: Arc::new(state_tx),
            outbound: OnceLock::new(),
            shutdown_tx,
            attempts: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of connection attempts made so far, including the first.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl SignalTransport for WebSocketTransport {
    fn connect(&self) -> Result<()> {
        if *self.state_tx.borrow() == TransportState::Closed {
            return Err(Error::Closed);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if self.outbound.set(tx).is_err() {
            debug!("Signal transport already started");
            return Ok(());
        }

        let driver = Driver {
            url: self.config.url.clone(),
            reconnect_delay: self.config.reconnect_delay(),
            inbound_tx: self.inbound_tx.clone(),
            state_tx: self.state_tx.clone(),
            attempts: self.attempts.clone(),
        };
        tokio::spawn(driver.run(rx, self.shutdown_tx.subscribe()));
        Ok(())
    }

    fn send(&self, message: SignalMessage) -> Result<()> {
        let connected = *self.state_tx.borrow() == TransportState::Connected;
        let outbound = match self.outbound.get() {
            Some(tx) if connected => tx,
            _ => {
                warn!(
                    "Signal transport not connected, dropping {} message",
                    message.body.kind()
                );
                return Err(Error::NotConnected);
            }
        };

        let json = message.stamped(&self.config.room_id).to_json()?;
        outbound.send(json).map_err(|_| Error::NotConnected)
    }

    fn subscribe(&self) -> broadcast::Receiver<SignalMessage> {
        self.inbound_tx.subscribe()
    }

    fn state(&self) -> watch::Receiver<TransportState> {
        self.state_tx.subscribe()
    }

    fn close(&self) {
        self.shutdown_tx.send_replace(true);
        advance(&self.state_tx, LinkEvent::Shutdown);
    }

    fn room_id(&self) -> &str {
        &self.config.room_id
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

fn advance(state_tx: &watch::Sender<TransportState>, event: LinkEvent) -> TransportState {
    state_tx.send_if_modified(|state| {
        let next = state.on(event);
        if next != *state {
            debug!("Signal transport {:?} -> {:?}", *state, next);
            *state = next;
            true
        } else {
            false
        }
    });
    *state_tx.borrow()
}

#[derive(Debug, PartialEq, Eq)]
enum Exit {
    Dropped,
    Shutdown,
}

/// Background task owning the socket across reconnections.
struct Driver {
    url: String,
    reconnect_delay: Duration,
    inbound_tx: broadcast::Sender<SignalMessage>,
    state_tx: Arc<watch::Sender<TransportState>>,
    attempts: Arc<AtomicU64>,
}

impl Driver {
    async fn run(
        self,
        mut outbound_rx: mpsc::UnboundedReceiver<String>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            advance(&self.state_tx, LinkEvent::Dial);
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            info!("Connecting to signaling relay {} (attempt {})", self.url, attempt);

            let dialed = tokio::select! {
                result = connect_async(self.url.as_str()) => result,
                _ = shutdown.changed() => break,
            };

            match dialed {
                Ok((ws_stream, _)) => {
                    advance(&self.state_tx, LinkEvent::Opened);
                    info!("Connected to signaling relay {}", self.url);
                    if self.pump(ws_stream, &mut outbound_rx, &mut shutdown).await == Exit::Shutdown {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to connect to signaling relay {}: {}", self.url, e);
                }
            }

            let mut dropped = 0usize;
            while outbound_rx.try_recv().is_ok() {
                dropped += 1;
            }
            if dropped > 0 {
                warn!("Dropped {} unsent signal messages after disconnect", dropped);
            }

            advance(&self.state_tx, LinkEvent::Lost);
            info!("Reconnecting to signaling relay in {:?}", self.reconnect_delay);

            tokio::select! {
                _ = tokio::time::sleep(self.reconnect_delay) => {
                    advance(&self.state_tx, LinkEvent::RetryDue);
                }
                _ = shutdown.changed() => break,
            }
        }

        advance(&self.state_tx, LinkEvent::Shutdown);
        debug!("Signal transport driver stopped");
    }

    async fn pump(
        &self,
        ws_stream: WsStream,
        outbound_rx: &mut mpsc::UnboundedReceiver<String>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Exit {
        let (mut write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                Some(json) = outbound_rx.recv() => {
                    if let Err(e) = write.send(Message::Text(json)).await {
                        warn!("Failed to send signal message: {}", e);
                        return Exit::Dropped;
                    }
                }
                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => self.deliver(&text),
                        Some(Ok(Message::Close(frame))) => {
                            info!("Signaling relay closed the connection: {:?}", frame);
                            return Exit::Dropped;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("Signaling socket error: {}", e);
                            return Exit::Dropped;
                        }
                        None => return Exit::Dropped,
                    }
                }
                _ = shutdown.changed() => {
                    // Flush what was queued before close(), e.g. a final `leave`
                    while let Ok(json) = outbound_rx.try_recv() {
                        if write.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    let _ = write.send(Message::Close(None)).await;
                    return Exit::Shutdown;
                }
            }
        }
    }

    fn deliver(&self, text: &str) {
        match SignalMessage::from_json(text) {
            Ok(message) => {
                debug!("Received {} from {}", message.body.kind(), message.sender_id);
                let _ = self.inbound_tx.send(message);
            }
            Err(e) => {
                debug!("Discarding malformed signal message: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::protocol::Signal;

    fn config() -> TransportConfig {
        TransportConfig {
            url: "ws://127.0.0.1:9".to_string(),
            room_id: "room".to_string(),
            reconnect_delay_ms: 3000,
        }
    }

    #[test]
    fn test_send_before_connect_is_dropped() {
        let transport = WebSocketTransport::new(config());
        let err = transport
            .send(SignalMessage::new("a", Signal::Leave))
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected));
        assert_eq!(*transport.state().borrow(), TransportState::Idle);
    }

    #[tokio::test]
    async fn test_close_before_connect() {
        let transport = WebSocketTransport::new(config());
        transport.close();
        assert_eq!(*transport.state().borrow(), TransportState::Closed);
        assert!(matches!(transport.connect(), Err(Error::Closed)));
        assert_eq!(transport.attempts(), 0);
    }
}
