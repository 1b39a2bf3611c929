//! WebRTC Peer Connection
//!
//! Produktions-Implementierung von [`TransportFactory`] auf Basis von
//! webrtc-rs. Jede Session bekommt eine eigene API-Instanz mit Standard-Codecs
//! und Interceptors.

use super::media::{LocalTrack, TrackKind};
use super::session::CallRole;
use super::transport::{
    PeerTransport, RemoteTrack, TransportError, TransportEvent, TransportEventSink,
    TransportFactory,
};
use crate::config::CallConfig;
use crate::signaling::{IceCandidate, SdpType, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

/// Opus läuft immer mit 48 kHz
pub const AUDIO_CLOCK_RATE: u32 = 48000;
pub const AUDIO_CHANNELS: u16 = 2;
pub const VIDEO_CLOCK_RATE: u32 = 90000;

fn backend(e: webrtc::Error) -> TransportError {
    TransportError::Backend(e.to_string())
}

// ============================================================================
// TRANSPORT FACTORY
// ============================================================================

#[derive(Debug, Clone)]
pub struct WebRtcTransportFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcTransportFactory {
    pub fn new(config: &CallConfig) -> Self {
        let ice_servers = config
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone(),
                credential: server.credential.clone(),
                ..Default::default()
            })
            .collect();

        Self { ice_servers }
    }

    /// Erstellt eine neue Peer Connection
    async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(backend)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(backend)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        Ok(Arc::new(
            api.new_peer_connection(config).await.map_err(backend)?,
        ))
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        role: CallRole,
        events: TransportEventSink,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let pc = self.create_peer_connection().await?;
        WebRtcPeer::register_handlers(&pc, events);

        tracing::debug!("Created {:?} peer connection", role);
        Ok(Arc::new(WebRtcPeer { pc }))
    }
}

// ============================================================================
// PEER
// ============================================================================

pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
}

impl WebRtcPeer {
    /// Registriert Event Handler für die Peer Connection
    fn register_handlers(pc: &Arc<RTCPeerConnection>, events: TransportEventSink) {
        // Connection State Handler
        let sink = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            tracing::info!("Peer connection state for {}: {:?}", sink.session_id(), s);

            match s {
                RTCPeerConnectionState::Connected => sink.emit(TransportEvent::Connected),
                RTCPeerConnectionState::Disconnected => {
                    sink.emit(TransportEvent::Failed("peer connection lost".to_string()))
                }
                RTCPeerConnectionState::Failed => {
                    sink.emit(TransportEvent::Failed("peer connection failed".to_string()))
                }
                _ => {}
            }

            Box::pin(async {})
        }));

        // ICE Candidate Handler
        let sink = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(c) = candidate {
                match c.to_json() {
                    Ok(init) => sink.emit(TransportEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    })),
                    Err(e) => tracing::warn!("Failed to serialize local candidate: {}", e),
                }
            }
            Box::pin(async {})
        }));

        // Track Handler
        let sink = events;
        pc.on_track(Box::new(move |track, _, _| {
            let kind = match track.kind() {
                RTPCodecType::Video => TrackKind::Video,
                _ => TrackKind::Audio,
            };
            sink.emit(TransportEvent::RemoteTrack(RemoteTrack {
                id: track.id(),
                kind,
                stream_id: track.stream_id(),
            }));
            Box::pin(async {})
        }));
    }

    fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
        let result = match desc.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        };
        result.map_err(|e| TransportError::InvalidSdp(e.to_string()))
    }
}

#[async_trait]
impl PeerTransport for WebRtcPeer {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), TransportError> {
        let capability = match track.kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: AUDIO_CLOCK_RATE,
                channels: AUDIO_CHANNELS,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: VIDEO_CLOCK_RATE,
                ..Default::default()
            },
        };

        let local = Arc::new(TrackLocalStaticRTP::new(
            capability,
            track.id.clone(),
            track.stream_id.clone(),
        ));

        self.pc
            .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.pc.create_offer(None).await.map_err(backend)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self.pc.create_answer(None).await.map_err(backend)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.pc
            .set_local_description(Self::to_rtc(desc)?)
            .await
            .map_err(backend)
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.pc
            .set_remote_description(Self::to_rtc(desc)?)
            .await
            .map_err(backend)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc.add_ice_candidate(init).await.map_err(backend)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.pc.close().await.map_err(backend)
    }
}

impl std::fmt::Debug for WebRtcPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcPeer")
            .field("connection_state", &self.pc.connection_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::media::{MediaHandle, MediaKind};
    use crate::signaling::SessionId;
    use tokio::sync::mpsc;

    fn local_config() -> CallConfig {
        CallConfig {
            ice_servers: Vec::new(),
            ..CallConfig::default()
        }
    }

    #[tokio::test]
    async fn test_offer_answer_between_two_peers() {
        let factory = WebRtcTransportFactory::new(&local_config());
        let (tx, _rx) = mpsc::unbounded_channel();

        let caller = factory
            .create(
                CallRole::Caller,
                TransportEventSink::new(SessionId::from("s1"), tx.clone()),
            )
            .await
            .unwrap();
        let callee = factory
            .create(
                CallRole::Callee,
                TransportEventSink::new(SessionId::from("s1"), tx),
            )
            .await
            .unwrap();

        for track in MediaHandle::new(MediaKind::Video).tracks {
            caller.add_track(&track).await.unwrap();
        }
        let offer = caller.create_offer().await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));
        caller.set_local_description(offer.clone()).await.unwrap();

        callee.set_remote_description(offer).await.unwrap();
        for track in MediaHandle::new(MediaKind::Video).tracks {
            callee.add_track(&track).await.unwrap();
        }
        let answer = callee.create_answer().await.unwrap();
        assert_eq!(answer.sdp_type, SdpType::Answer);
        callee.set_local_description(answer.clone()).await.unwrap();

        caller.set_remote_description(answer).await.unwrap();

        caller.close().await.unwrap();
        callee.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_remote_sdp_rejected() {
        let factory = WebRtcTransportFactory::new(&local_config());
        let (tx, _rx) = mpsc::unbounded_channel();
        let peer = factory
            .create(
                CallRole::Callee,
                TransportEventSink::new(SessionId::from("s1"), tx),
            )
            .await
            .unwrap();

        let result = peer
            .set_remote_description(SessionDescription::offer("not sdp"))
            .await;
        assert!(result.is_err());
        peer.close().await.unwrap();
    }
}
