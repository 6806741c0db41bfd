//! webrtc-rs backed connections.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;

use crate::config::PeerConfig;
use crate::error::{Error, Result};
use crate::media::connection::{ConnectionEvent, ConnectionFactory, LinkState, MediaConnection};
use crate::media::{LocalTrack, RemoteTrack, TrackKind};
use crate::signaling::protocol::{IceCandidate, SdpKind, SessionDescription};

pub struct RtcConnectionFactory {
    api: API,
    config: PeerConfig,
}

impl RtcConnectionFactory {
    pub fn new(config: PeerConfig) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api, config })
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.config.ice_servers.is_empty() {
            vec![]
        } else {
            vec![RTCIceServer {
                urls: self.config.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl ConnectionFactory for RtcConnectionFactory {
    async fn create(
        &self,
        peer_id: &str,
        events: mpsc::Sender<ConnectionEvent>,
    ) -> Result<Arc<dyn MediaConnection>> {
        let pc = Arc::new(self.api.new_peer_connection(self.rtc_configuration()).await?);

        let event_tx_state = events.clone();
        let pid_state = peer_id.to_string();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = event_tx_state.clone();
            let pid = pid_state.clone();
            Box::pin(async move {
                info!("WebRTC connection to {} state: {}", pid, state);
                let _ = tx
                    .send(ConnectionEvent::LinkStateChanged {
                        peer_id: pid,
                        state: link_state(state),
                    })
                    .await;
            })
        }));

        let event_tx_track = events.clone();
        let pid_track = peer_id.to_string();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let tx = event_tx_track.clone();
            let pid = pid_track.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    RTPCodecType::Video => TrackKind::Video,
                    _ => return,
                };
                info!("Received remote {:?} track from {}", kind, pid);
                let _ = tx
                    .send(ConnectionEvent::RemoteTrack {
                        peer_id: pid,
                        stream_id: track.stream_id().to_string(),
                        track: RemoteTrack {
                            id: track.id().to_string(),
                            kind,
                            handle: Some(track),
                        },
                    })
                    .await;
            })
        }));

        let event_tx_ice = events;
        let pid_ice = peer_id.to_string();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = event_tx_ice.clone();
            let pid = pid_ice.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                let init = match candidate.to_json() {
                    Ok(init) => init,
                    Err(e) => {
                        warn!("Failed to serialize ICE candidate: {}", e);
                        return;
                    }
                };
                let _ = tx
                    .send(ConnectionEvent::IceCandidate {
                        peer_id: pid,
                        candidate: IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        },
                    })
                    .await;
            })
        }));

        info!("Created WebRTC peer connection for {}", peer_id);
        Ok(Arc::new(RtcConnection {
            peer_id: peer_id.to_string(),
            pc,
            senders: Mutex::new(HashMap::new()),
        }))
    }
}

struct RtcConnection {
    peer_id: String,
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<TrackKind, Arc<RTCRtpSender>>>,
}

#[async_trait]
impl MediaConnection for RtcConnection {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        to_wire(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        to_wire(answer)
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let description = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp)?,
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp)?,
            SdpKind::Pranswer => RTCSessionDescription::pranswer(description.sdp)?,
            SdpKind::Rollback => {
                return Err(Error::negotiation("remote rollback is not supported"));
            }
        };
        self.pc.set_remote_description(description).await?;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let pending = self
            .pc
            .pending_local_description()
            .await
            .ok_or_else(|| Error::negotiation("no local offer to roll back"))?;
        let mut rollback = RTCSessionDescription::default();
        rollback.sdp_type = RTCSdpType::Rollback;
        rollback.sdp = pending.sdp;
        self.pc.set_local_description(rollback).await?;
        debug!("Rolled back local offer to {}", self.peer_id);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        debug!("Added ICE candidate from peer {}", self.peer_id);
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        let rtp_sender = self.pc.add_track(track.inner()).await?;

        // RTCP has to be drained for the interceptors to work
        let reader = rtp_sender.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while reader.read(&mut buf).await.is_ok() {}
        });

        self.senders.lock().await.insert(track.kind(), rtp_sender);
        Ok(())
    }

    async fn replace_track(&self, track: &LocalTrack) -> Result<()> {
        let sender = self
            .senders
            .lock()
            .await
            .get(&track.kind())
            .cloned()
            .ok_or_else(|| Error::media(format!("no {:?} sender to {}", track.kind(), self.peer_id)))?;
        sender.replace_track(Some(track.inner())).await?;
        debug!("Replaced {:?} track for {} with {}", track.kind(), self.peer_id, track.id());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.senders.lock().await.clear();
        self.pc.close().await?;
        Ok(())
    }
}

fn to_wire(description: RTCSessionDescription) -> Result<SessionDescription> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        RTCSdpType::Unspecified => {
            return Err(Error::negotiation("session description without type"));
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: description.sdp,
    })
}

fn link_state(state: RTCPeerConnectionState) -> LinkState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => LinkState::New,
        RTCPeerConnectionState::Connecting => LinkState::Connecting,
        RTCPeerConnectionState::Connected => LinkState::Connected,
        RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
        RTCPeerConnectionState::Failed => LinkState::Failed,
        RTCPeerConnectionState::Closed => LinkState::Closed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_offer_lists_attached_tracks() {
        let factory = RtcConnectionFactory::new(PeerConfig { ice_servers: vec![] }).unwrap();
        let (tx, _rx) = mpsc::channel(16);
        let conn = factory.create("remote", tx).await.unwrap();

        conn.add_track(&LocalTrack::microphone("me")).await.unwrap();
        conn.add_track(&LocalTrack::camera("me")).await.unwrap();

        let offer = conn.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));

        conn.rollback().await.unwrap();
        conn.close().await.unwrap();
    }

    #[test]
    fn test_link_state_mapping() {
        assert_eq!(link_state(RTCPeerConnectionState::Failed), LinkState::Failed);
        assert_eq!(link_state(RTCPeerConnectionState::Unspecified), LinkState::New);
    }
}
