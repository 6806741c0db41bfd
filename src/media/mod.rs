pub mod connection;
pub mod loopback;
pub mod peer;
pub mod rtc;

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

pub use connection::{ConnectionEvent, ConnectionFactory, LinkState, MediaConnection};
pub use loopback::{LoopbackConnection, LoopbackFactory};
pub use peer::{NegotiationState, PeerManager, PeerRole, PeerSnapshot};
pub use rtc::RtcConnectionFactory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Where an outgoing track comes from. Camera and screen share the video sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
}

impl TrackSource {
    pub fn kind(self) -> TrackKind {
        match self {
            TrackSource::Microphone => TrackKind::Audio,
            TrackSource::Camera | TrackSource::Screen => TrackKind::Video,
        }
    }
}

/// Opaque handle to an outgoing track owned by the capture layer.
#[derive(Clone)]
pub struct LocalTrack {
    source: TrackSource,
    inner: Arc<dyn TrackLocal + Send + Sync>,
}

impl LocalTrack {
    pub fn new(source: TrackSource, inner: Arc<dyn TrackLocal + Send + Sync>) -> Self {
        Self { source, inner }
    }

    /// Opus sample track, as produced by a microphone capture.
    pub fn microphone(stream_id: &str) -> Self {
        Self::sample(TrackSource::Microphone, stream_id, RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_string(),
            clock_rate: 48000,
            channels: 1,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
            rtcp_feedback: vec![],
        })
    }

    pub fn camera(stream_id: &str) -> Self {
        Self::sample(TrackSource::Camera, stream_id, vp8())
    }

    pub fn screen(stream_id: &str) -> Self {
        Self::sample(TrackSource::Screen, stream_id, vp8())
    }

    fn sample(source: TrackSource, stream_id: &str, codec: RTCRtpCodecCapability) -> Self {
        let label = match source {
            TrackSource::Microphone => "audio",
            TrackSource::Camera => "camera",
            TrackSource::Screen => "screen",
        };
        let track_id = format!("{}-{}", label, uuid::Uuid::new_v4().simple());
        let track = TrackLocalStaticSample::new(codec, track_id, stream_id.to_string());
        Self::new(source, Arc::new(track))
    }

    pub fn id(&self) -> &str {
        self.inner.id()
    }

    pub fn stream_id(&self) -> &str {
        self.inner.stream_id()
    }

    pub fn source(&self) -> TrackSource {
        self.source
    }

    pub fn kind(&self) -> TrackKind {
        self.source.kind()
    }

    pub fn inner(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.inner.clone()
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("source", &self.source)
            .field("id", &self.id())
            .finish()
    }
}

fn vp8() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_VP8.to_string(),
        clock_rate: 90000,
        channels: 0,
        sdp_fmtp_line: String::new(),
        rtcp_feedback: vec![],
    }
}

/// The tracks the capture layer hands to a session at start.
#[derive(Debug, Clone)]
pub struct LocalMedia {
    pub microphone: Option<LocalTrack>,
    pub camera: LocalTrack,
}

impl LocalMedia {
    /// Silent microphone plus a blank camera; used by headless participants.
    pub fn synthetic(stream_id: &str) -> Self {
        Self {
            microphone: Some(LocalTrack::microphone(stream_id)),
            camera: LocalTrack::camera(stream_id),
        }
    }
}

/// Media received from one remote participant.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteStream {
    pub stream_id: String,
    pub tracks: Vec<RemoteTrack>,
}

#[derive(Clone, Serialize)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
    #[serde(skip)]
    pub handle: Option<Arc<TrackRemote>>,
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("live", &self.handle.is_some())
            .finish()
    }
}
