use std::net::IpAddr;

use anyhow::Context;
use clap::{Parser, Subcommand};

use meshtalk_lib::config::{
    ClientConfig, PeerConfig, RelayConfig, SessionConfig, TransportConfig,
    DEFAULT_RECONNECT_DELAY_MS, DEFAULT_STUN_SERVER,
};
use meshtalk_lib::models::{Accessory, AvatarConfig, AvatarStyle, Identity};

#[derive(Parser)]
#[command(name = "meshtalk", about = "Mesh video rooms: signaling relay and headless participant")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the signaling relay
    Relay {
        #[arg(long, default_value = "0.0.0.0")]
        host: IpAddr,

        #[arg(long, env = "PORT", default_value = "3001")]
        port: u16,
    },
    /// Join a room as a headless participant
    Join {
        /// Relay address, e.g. ws://localhost:3001
        #[arg(long)]
        url: String,

        #[arg(long)]
        room: String,

        #[arg(long, default_value = "Headless")]
        name: String,

        /// Participant id (random when omitted)
        #[arg(long)]
        id: Option<String>,

        #[arg(long, value_enum, default_value_t = AvatarStyle::Cat)]
        style: AvatarStyle,

        #[arg(long, default_value = "#f59e0b")]
        color: String,

        #[arg(long, value_enum, default_value_t = Accessory::None)]
        accessory: Accessory,

        /// STUN/TURN server url, repeatable
        #[arg(long = "stun", default_value = DEFAULT_STUN_SERVER)]
        stun: Vec<String>,

        #[arg(long, default_value_t = DEFAULT_RECONNECT_DELAY_MS)]
        reconnect_delay_ms: u64,

        /// Expose the local control API on this port
        #[arg(long)]
        api_port: Option<u16>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;

    match cli.command {
        Command::Relay { host, port } => {
            rt.block_on(meshtalk_lib::run_relay(RelayConfig { host, port }))?;
        }
        Command::Join {
            url,
            room,
            name,
            id,
            style,
            color,
            accessory,
            stun,
            reconnect_delay_ms,
            api_port,
        } => {
            let identity = Identity {
                id: id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                display_name: name,
                avatar_config: AvatarConfig { style, color, accessory },
            };
            let config = ClientConfig {
                transport: TransportConfig {
                    url,
                    room_id: room.clone(),
                    reconnect_delay_ms,
                },
                peer: PeerConfig { ice_servers: stun },
                session: SessionConfig::new(room, identity),
                api_port,
            };
            rt.block_on(meshtalk_lib::run_headless(config))?;
        }
    }

    Ok(())
}
