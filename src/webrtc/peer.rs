use ::webrtc::api::interceptor_registry::register_default_interceptors;
use ::webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264};
use ::webrtc::api::APIBuilder;
use ::webrtc::ice_transport::ice_server::RTCIceServer;
use ::webrtc::interceptor::registry::Registry;
use ::webrtc::media::Sample;
use ::webrtc::peer_connection::configuration::RTCConfiguration;
use ::webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use ::webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use ::webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use ::webrtc::peer_connection::RTCPeerConnection;
use ::webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use ::webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use ::webrtc::track::track_local::TrackLocal;
use bytes::Bytes;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

use super::encoder::H264Encoder;
use crate::broadcast::Subscription;
use crate::config::{RelayConfig, ServerConfig};
use crate::errors::RelayError;
use crate::session::{ConnectionEvents, PeerConnector, PeerHandle, SessionId};
use crate::timing::{ticks_to_duration, FrameClock};
use crate::types::{ConnectionState, SdpType, SessionDescription, VideoFrame};

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => ConnectionState::New,
            RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
            RTCPeerConnectionState::Connected => ConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionState::Failed,
            RTCPeerConnectionState::Closed => ConnectionState::Closed,
        }
    }
}

impl From<RTCSdpType> for SdpType {
    fn from(sdp_type: RTCSdpType) -> Self {
        match sdp_type {
            RTCSdpType::Offer | RTCSdpType::Unspecified => SdpType::Offer,
            RTCSdpType::Answer => SdpType::Answer,
            RTCSdpType::Pranswer => SdpType::Pranswer,
            RTCSdpType::Rollback => SdpType::Rollback,
        }
    }
}

impl TryFrom<SessionDescription> for RTCSessionDescription {
    type Error = RelayError;

    fn try_from(desc: SessionDescription) -> Result<Self, Self::Error> {
        let parsed = match desc.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
            SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
            SdpType::Rollback => {
                return Err(RelayError::NegotiationError(
                    "Rollback SDP type not supported".to_string(),
                ))
            }
        };
        parsed.map_err(|e| RelayError::NegotiationError(format!("Invalid SDP: {}", e)))
    }
}

impl From<RTCSessionDescription> for SessionDescription {
    fn from(desc: RTCSessionDescription) -> Self {
        SessionDescription {
            sdp_type: desc.sdp_type.into(),
            sdp: desc.sdp,
        }
    }
}

/// ICE servers from the `[server]` configuration section
pub fn ice_servers(config: &ServerConfig) -> Vec<RTCIceServer> {
    let mut servers = Vec::new();
    if let Some(stun) = &config.stun_url {
        servers.push(RTCIceServer {
            urls: vec![stun.clone()],
            ..Default::default()
        });
    }
    if let Some(turn) = &config.turn_url {
        servers.push(RTCIceServer {
            urls: vec![turn.clone()],
            username: config.turn_username.clone().unwrap_or_default(),
            credential: config.turn_password.clone().unwrap_or_default(),
            ..Default::default()
        });
    }
    servers
}

fn negotiation(context: &str) -> impl FnOnce(::webrtc::Error) -> RelayError + '_ {
    move |e| RelayError::NegotiationError(format!("{}: {}", context, e))
}

/// Answers offers with a send-only H.264 video track
#[derive(Debug, Clone)]
pub struct WebRtcConnector {
    ice_servers: Vec<RTCIceServer>,
    frame_interval: Duration,
}

impl WebRtcConnector {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            ice_servers: ice_servers(&config.server),
            frame_interval: FrameClock::new(config.camera.fps).frame_interval(),
        }
    }

    async fn new_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, RelayError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(negotiation("Failed to register codecs"))?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(negotiation("Failed to register interceptors"))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let peer_connection = api
            .new_peer_connection(config)
            .await
            .map_err(negotiation("Failed to create peer connection"))?;
        Ok(Arc::new(peer_connection))
    }

    async fn negotiate(
        &self,
        peer_connection: &Arc<RTCPeerConnection>,
        track: &Arc<TrackLocalStaticSample>,
        offer: SessionDescription,
    ) -> Result<SessionDescription, RelayError> {
        let rtp_sender = peer_connection
            .add_track(Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(negotiation("Failed to add video track"))?;

        // RTCP has to be read for interceptors such as NACK to work
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while rtp_sender.read(&mut rtcp_buf).await.is_ok() {}
        });

        let remote: RTCSessionDescription = offer.try_into()?;
        peer_connection
            .set_remote_description(remote)
            .await
            .map_err(negotiation("Failed to set remote description"))?;

        let answer = peer_connection
            .create_answer(None)
            .await
            .map_err(negotiation("Failed to create answer"))?;

        let mut gather_complete = peer_connection.gathering_complete_promise().await;
        peer_connection
            .set_local_description(answer)
            .await
            .map_err(negotiation("Failed to set local description"))?;
        let _ = gather_complete.recv().await;

        peer_connection
            .local_description()
            .await
            .map(SessionDescription::from)
            .ok_or_else(|| RelayError::NegotiationError("No local description".to_string()))
    }
}

impl PeerConnector for WebRtcConnector {
    type Peer = WebRtcPeer;

    async fn accept(
        &self,
        offer: SessionDescription,
        subscription: Subscription,
        events: ConnectionEvents,
    ) -> Result<(WebRtcPeer, SessionDescription), RelayError> {
        let session_id = events.session_id();
        let peer_connection = self.new_peer_connection().await?;

        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                log::info!("Peer connection {} state: {}", session_id, state);
                events.notify(state.into());
                Box::pin(async {})
            },
        ));

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            format!("crabrelay-{}", session_id),
        ));

        let answer = match self.negotiate(&peer_connection, &track, offer).await {
            Ok(answer) => answer,
            Err(e) => {
                if let Err(close_err) = peer_connection.close().await {
                    log::debug!("Closing rejected peer {}: {}", session_id, close_err);
                }
                return Err(e);
            }
        };

        let media = tokio::spawn(send_video(
            session_id,
            subscription,
            track,
            self.frame_interval,
        ));

        log::info!("Peer connection {} answered", session_id);
        Ok((
            WebRtcPeer {
                session_id,
                peer_connection,
                media: Mutex::new(Some(media)),
            },
            answer,
        ))
    }
}

/// Encode frames from `subscription` and write them to `track` until the
/// subscription ends.
async fn send_video(
    session_id: SessionId,
    mut subscription: Subscription,
    track: Arc<TrackLocalStaticSample>,
    default_duration: Duration,
) {
    let mut encoder: Option<H264Encoder> = None;
    let mut last_pts: Option<u64> = None;
    let mut samples = 0u64;

    while let Some(frame) = subscription.next().await {
        let duration = sample_duration(last_pts, frame.pts, default_duration);
        last_pts = Some(frame.pts);

        let (returned, encoded) = match encode_blocking(encoder.take(), frame).await {
            Ok(result) => result,
            Err(e) => {
                log::warn!("Session {} dropped a frame: {}", session_id, e);
                continue;
            }
        };
        encoder = returned;

        let data = match encoded {
            Ok(data) => data,
            Err(e) => {
                log::warn!("Session {} dropped a frame: {}", session_id, e);
                continue;
            }
        };

        let sample = Sample {
            data,
            duration,
            ..Default::default()
        };
        if let Err(e) = track.write_sample(&sample).await {
            log::warn!("Session {} failed to write sample: {}", session_id, e);
            break;
        }
        samples += 1;
    }

    log::debug!(
        "Session {} media ended after {} samples ({} frames skipped)",
        session_id,
        samples,
        subscription.skipped()
    );
}

/// Time between this frame and the previous one, or `default` when there is
/// no usable previous timestamp
fn sample_duration(last_pts: Option<u64>, pts: u64, default: Duration) -> Duration {
    match last_pts {
        Some(last) if pts > last => ticks_to_duration(pts - last),
        _ => default,
    }
}

/// Encode on the blocking pool; the encoder is handed back for the next frame
async fn encode_blocking(
    encoder: Option<H264Encoder>,
    frame: VideoFrame,
) -> Result<(Option<H264Encoder>, Result<Bytes, RelayError>), RelayError> {
    tokio::task::spawn_blocking(move || {
        let (width, height) = (frame.frame.width, frame.frame.height);
        // a camera switch can change the frame size
        let mut encoder = match encoder {
            Some(encoder) if encoder.dimensions() == (width, height) => encoder,
            _ => match H264Encoder::new(width, height) {
                Ok(encoder) => encoder,
                Err(e) => return (None, Err(e)),
            },
        };
        let encoded = encoder
            .encode_rgb(&frame.frame.data)
            .map(|encoded| Bytes::from(encoded.data));
        (Some(encoder), encoded)
    })
    .await
    .map_err(|e| RelayError::EncodingError(format!("Encode task failed: {}", e)))
}

/// A negotiated WebRTC peer and its media task
pub struct WebRtcPeer {
    session_id: SessionId,
    peer_connection: Arc<RTCPeerConnection>,
    media: Mutex<Option<JoinHandle<()>>>,
}

impl WebRtcPeer {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.peer_connection.connection_state().into()
    }
}

impl PeerHandle for WebRtcPeer {
    async fn close(&self) -> Result<(), RelayError> {
        let media = self.media.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(media) = media {
            media.abort();
        }

        log::info!("Closing peer connection {}", self.session_id);
        self.peer_connection
            .close()
            .await
            .map_err(|e| RelayError::TeardownError(format!("Failed to close peer connection: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ice_servers_from_config() {
        let config = ServerConfig {
            stun_url: Some("stun:stun.l.google.com:19302".to_string()),
            turn_url: Some("turn:turn.example.com:3478".to_string()),
            turn_username: Some("user".to_string()),
            turn_password: Some("secret".to_string()),
            ..ServerConfig::default()
        };

        let servers = ice_servers(&config);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].urls, vec!["stun:stun.l.google.com:19302".to_string()]);
        assert_eq!(servers[1].username, "user");
        assert_eq!(servers[1].credential, "secret");
        assert!(ice_servers(&ServerConfig::default()).is_empty());
    }

    #[test]
    fn test_state_conversion() {
        assert_eq!(
            ConnectionState::from(RTCPeerConnectionState::Failed),
            ConnectionState::Failed
        );
        assert_eq!(
            ConnectionState::from(RTCPeerConnectionState::Unspecified),
            ConnectionState::New
        );
    }

    #[test]
    fn test_rollback_is_rejected() {
        let desc = SessionDescription {
            sdp_type: SdpType::Rollback,
            sdp: String::new(),
        };
        let result: Result<RTCSessionDescription, _> = desc.try_into();
        assert!(matches!(result, Err(RelayError::NegotiationError(_))));
    }

    #[test]
    fn test_sample_duration_from_pts_delta() {
        let default = Duration::from_millis(33);
        assert_eq!(sample_duration(None, 3000, default), default);
        assert_eq!(
            sample_duration(Some(3000), 6000, default),
            ticks_to_duration(3000)
        );
        assert_eq!(
            sample_duration(Some(6000), 15000, default),
            Duration::from_millis(100)
        );
        assert_eq!(sample_duration(Some(6000), 6000, default), default);
        assert_eq!(sample_duration(Some(9000), 6000, default), default);
    }

    fn video_frame(pts: u64, width: u32, height: u32) -> VideoFrame {
        VideoFrame {
            pts,
            frame: crate::testing::synthetic_video_frame(pts, width, height, "0"),
        }
    }

    #[tokio::test]
    async fn test_encoder_reused_until_frame_size_changes() {
        let (encoder, encoded) = encode_blocking(None, video_frame(0, 64, 48)).await.unwrap();
        assert!(!encoded.unwrap().is_empty());
        let encoder = encoder.unwrap();
        assert_eq!(encoder.frame_count(), 1);

        let (encoder, encoded) = encode_blocking(Some(encoder), video_frame(3000, 64, 48))
            .await
            .unwrap();
        assert!(encoded.is_ok());
        let encoder = encoder.unwrap();
        assert_eq!(encoder.dimensions(), (64, 48));
        assert_eq!(encoder.frame_count(), 2);

        let (encoder, encoded) = encode_blocking(Some(encoder), video_frame(6000, 32, 24))
            .await
            .unwrap();
        assert!(encoded.is_ok());
        let encoder = encoder.unwrap();
        assert_eq!(encoder.dimensions(), (32, 24));
        assert_eq!(encoder.frame_count(), 1);
        assert!(encoder.last_was_keyframe());
    }

    #[tokio::test]
    async fn test_unencodable_frame_drops_encoder() {
        let (encoder, encoded) = encode_blocking(None, video_frame(0, 33, 24)).await.unwrap();
        assert!(encoder.is_none());
        assert!(matches!(encoded, Err(RelayError::EncodingError(_))));
    }

    #[tokio::test]
    async fn test_garbage_offer_is_negotiation_error() {
        use crate::testing::ScriptedBackend;
        use crate::SessionRegistry;

        let backend = ScriptedBackend::new(1);
        let mut config = RelayConfig::with_candidates(backend.candidates());
        config.camera.resolution = [16, 12];
        config.failover.rotation_period_ms = 0;

        let registry = SessionRegistry::new(
            config.clone(),
            Arc::new(backend.clone()),
            WebRtcConnector::new(&config),
        );

        let result = registry
            .request_session(SessionDescription::offer("not an sdp"))
            .await;
        assert!(matches!(result, Err(RelayError::NegotiationError(_))));
        assert!(!registry.is_streaming().await);
        registry.shutdown().await;
    }
}
