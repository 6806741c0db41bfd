pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod media;
pub mod models;
pub mod relay;
pub mod roster;
pub mod session;
pub mod signaling;

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

pub use crate::error::{Error, Result};

use crate::config::{ClientConfig, RelayConfig};
use crate::media::{LocalMedia, RtcConnectionFactory};
use crate::signaling::{SignalTransport, WebSocketTransport};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Run the signaling relay until the process is stopped.
pub async fn run_relay(config: RelayConfig) -> Result<()> {
    init_tracing();

    let listener = tokio::net::TcpListener::bind(config.addr()).await?;
    relay::serve(listener, relay::RelayState::default()).await
}

/// Join a room as a headless participant with synthetic media. Leaves on ctrl-c.
pub async fn run_headless(config: ClientConfig) -> Result<()> {
    init_tracing();
    config.validate()?;

    let local_id = config.session.identity.id.clone();
    info!(
        "Joining room {} as {} ({})",
        config.session.room_id, config.session.identity.display_name, local_id
    );

    let transport: Arc<dyn SignalTransport> =
        Arc::new(WebSocketTransport::new(config.transport.clone()));
    let factory = Arc::new(RtcConnectionFactory::new(config.peer.clone())?);
    let media = LocalMedia::synthetic(&local_id);

    let session = session::start(config.session, transport, factory, media)?;

    if let Some(port) = config.api_port {
        let api_session = session.clone();
        tokio::spawn(async move {
            if let Err(e) = api::server::start_api_server(api_session, port).await {
                error!("API server stopped: {}", e);
            }
        });
    }

    let mut state_rx = session.watch_state();
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Interrupted, leaving room");
            session.leave().await?;
        }
        // Left through the control API
        _ = state_rx.wait_for(|s| s.left) => {}
    }

    info!("Left room");
    Ok(())
}
