//! Signaling relay: groups websocket transports by room and forwards frames between them.

pub mod rooms;
pub mod server;
pub mod websocket;

pub use rooms::{ConnId, RelayStats, RoomRegistry};
pub use server::{build_router, serve, spawn_relay, RelayState};
