//! Local control API of a headless participant.

pub mod routes;
pub mod server;
pub mod websocket;
