//! Peer-to-peer media sessions
//!
//! A `PeerSession` wraps one negotiated media connection. Its callbacks are
//! delivered through a `PeerEventSink` so the call state machine sees them as
//! ordinary events instead of transport-level callbacks.

use crate::config::IceServer;
use crate::error::{Error, Result};
use crate::media::{LocalMedia, TrackKind};
use crate::models::{IceCandidate, SdpKind, SessionDescription};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_remote::TrackRemote;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    /// States the connection never recovers from.
    pub fn is_terminal(self) -> bool {
        matches!(self, PeerConnectionState::Failed | PeerConnectionState::Closed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// A locally gathered candidate to forward to the counterpart.
    LocalCandidate(IceCandidate),
    /// The first remote media track arrived.
    RemoteTrack(TrackKind),
    StateChanged(PeerConnectionState),
}

pub type PeerEventSink = Arc<dyn Fn(PeerEvent) + Send + Sync>;

#[async_trait]
pub trait PeerSession: Send + Sync {
    /// Attach every local track; must happen before any offer or answer.
    async fn add_local_tracks(&self, media: &LocalMedia) -> Result<()>;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    /// Fails with `Error::Signaling` when closed or when the SDP is invalid.
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// Candidates arriving after `close()` are dropped without error.
    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Idempotent.
    async fn close(&self);
}

#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerSession>>;
}

// ============================================================================
// WebRTC implementation
// ============================================================================

pub struct WebRtcConnector {
    api: API,
}

impl WebRtcConnector {
    pub fn new() -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api })
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerSession>> {
        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: s.urls.clone(),
                    username: s.username.clone().unwrap_or_default(),
                    credential: s.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = Arc::new(self.api.new_peer_connection(config).await?);
        let peer = WebRtcPeer {
            pc,
            closed: AtomicBool::new(false),
        };
        peer.observe(events);

        Ok(Arc::new(peer))
    }
}

pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    closed: AtomicBool,
}

impl WebRtcPeer {
    fn observe(&self, events: PeerEventSink) {
        let sink = events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                // `None` marks the end of gathering and is not forwarded.
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(init) => sink(PeerEvent::LocalCandidate(init.into())),
                        Err(e) => log::warn!("Failed to serialize local candidate: {}", e),
                    }
                }
                Box::pin(async {})
            }));

        let sink = events.clone();
        let track_seen = Arc::new(AtomicBool::new(false));
        self.pc
            .on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
                if !track_seen.swap(true, Ordering::SeqCst) {
                    let kind = match track.kind() {
                        RTPCodecType::Video => TrackKind::Video,
                        _ => TrackKind::Audio,
                    };
                    sink(PeerEvent::RemoteTrack(kind));
                }
                Box::pin(async {})
            }));

        let sink = events;
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let state = match state {
                    RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
                    RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
                    RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
                    RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
                    RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
                    _ => PeerConnectionState::New,
                };
                sink(PeerEvent::StateChanged(state));
                Box::pin(async {})
            }));
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerSession for WebRtcPeer {
    async fn add_local_tracks(&self, media: &LocalMedia) -> Result<()> {
        for track in media.tracks() {
            self.pc.add_track(track.rtp_track()).await?;
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| Error::Signaling(format!("create offer: {}", e)))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| Error::Signaling(format!("create answer: {}", e)))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let description = to_rtc(description)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(|e| Error::Signaling(format!("set local description: {}", e)))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Signaling("peer connection is closed".to_string()));
        }
        let description = to_rtc(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|e| Error::Signaling(format!("set remote description: {}", e)))
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if self.is_closed() {
            log::debug!("Dropping candidate for closed peer connection");
            return Ok(());
        }
        self.pc.add_ice_candidate(candidate.into()).await?;
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.pc.close().await {
            log::warn!("Error closing peer connection: {}", e);
        }
    }
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription> {
    if description.sdp.trim().is_empty() {
        return Err(Error::Signaling("empty session description".to_string()));
    }
    let parsed = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    };
    parsed.map_err(|e| Error::Signaling(format!("invalid SDP: {}", e)))
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        Self {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CallType;

    fn quiet_sink() -> PeerEventSink {
        Arc::new(|_event| {})
    }

    #[tokio::test]
    async fn offer_carries_local_tracks() {
        let connector = WebRtcConnector::new().unwrap();
        let peer = connector.create(&[], quiet_sink()).await.unwrap();

        peer.add_local_tracks(&LocalMedia::new(CallType::Video)).await.unwrap();
        let offer = peer.create_offer().await.unwrap();

        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));

        peer.close().await;
    }

    #[tokio::test]
    async fn garbage_remote_sdp_is_signaling_error() {
        let connector = WebRtcConnector::new().unwrap();
        let peer = connector.create(&[], quiet_sink()).await.unwrap();

        let err = peer
            .set_remote_description(SessionDescription::answer("definitely not sdp"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Signaling(_)));

        let err = peer
            .set_remote_description(SessionDescription::offer("  "))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Signaling(_)));

        peer.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent_and_drops_late_candidates() {
        let connector = WebRtcConnector::new().unwrap();
        let peer = connector.create(&[], quiet_sink()).await.unwrap();

        peer.close().await;
        peer.close().await;

        let late = IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        assert!(peer.add_remote_candidate(late).await.is_ok());

        let err = peer
            .set_remote_description(SessionDescription::offer("v=0"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Signaling(_)));
    }
}
