//! Runtime configuration for the relay and for a headless participant.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::Identity;

pub const DEFAULT_RELAY_PORT: u16 = 3001;
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 3000;
pub const DEFAULT_REACTION_TTL_MS: u64 = 3000;
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub host: IpAddr,
    pub port: u16,
}

impl RelayConfig {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_RELAY_PORT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// `ws://` or `wss://` address of the relay.
    pub url: String,
    pub room_id: String,
    pub reconnect_delay_ms: u64,
}

impl TransportConfig {
    pub fn new(url: impl Into<String>, room_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            room_id: room_id.into(),
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(Error::Config(format!(
                "relay url must start with ws:// or wss://, got {}",
                self.url
            )));
        }
        if self.room_id.trim().is_empty() {
            return Err(Error::Config("room id must not be empty".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// STUN/TURN urls handed to every peer connection.
    pub ice_servers: Vec<String>,
}

impl PeerConfig {
    pub fn validate(&self) -> Result<()> {
        for url in &self.ice_servers {
            if !["stun:", "turn:", "turns:"].iter().any(|p| url.starts_with(p)) {
                return Err(Error::Config(format!("unsupported ICE server url: {}", url)));
            }
        }
        Ok(())
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub room_id: String,
    pub identity: Identity,
    pub reaction_ttl_ms: u64,
}

impl SessionConfig {
    pub fn new(room_id: impl Into<String>, identity: Identity) -> Self {
        Self {
            room_id: room_id.into(),
            identity,
            reaction_ttl_ms: DEFAULT_REACTION_TTL_MS,
        }
    }

    pub fn reaction_ttl(&self) -> Duration {
        Duration::from_millis(self.reaction_ttl_ms)
    }
}

/// Everything `meshtalk join` needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub transport: TransportConfig,
    pub peer: PeerConfig,
    pub session: SessionConfig,
    /// Port of the local control API; `None` disables it.
    pub api_port: Option<u16>,
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        self.transport.validate()?;
        self.peer.validate()?;
        if self.session.room_id != self.transport.room_id {
            return Err(Error::Config("session and transport room ids differ".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let relay = RelayConfig::default();
        assert_eq!(relay.port, 3001);
        assert_eq!(relay.addr().to_string(), "0.0.0.0:3001");

        let transport = TransportConfig::new("ws://localhost:3001", "standup");
        assert_eq!(transport.reconnect_delay(), Duration::from_secs(3));
        assert!(transport.validate().is_ok());
        assert!(PeerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(TransportConfig::new("http://localhost:3001", "r").validate().is_err());
        assert!(TransportConfig::new("ws://localhost:3001", "  ").validate().is_err());

        let peer = PeerConfig {
            ice_servers: vec!["stun:ok".to_string(), "https://nope".to_string()],
        };
        assert!(matches!(peer.validate(), Err(Error::Config(_))));
    }
}
