//! Client side of the signaling channel: wire protocol and the transports that carry it.

pub mod local;
pub mod protocol;
pub mod transport;
pub mod websocket;

pub use local::{LocalBus, LocalTransport};
pub use protocol::{IceCandidate, SdpKind, SessionDescription, Signal, SignalMessage};
pub use transport::{LinkEvent, SignalTransport, TransportState};
pub use websocket::WebSocketTransport;
