//! Media transport backend behind each peer session.
//!
//! [`RtcConnector`] builds real webrtc-rs peer connections. Sessions only talk
//! to the [`MediaConnection`] trait so negotiation can be driven without a
//! network in tests.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::MediaConfig;
use crate::error::NegotiationError;

/// A proposed network path, as carried by `ice-candidate` frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: String,
    pub sdp_mline_index: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offer => f.write_str("offer"),
            Self::Answer => f.write_str("answer"),
        }
    }
}

/// Connectivity reported by the ICE agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Asynchronous notifications from a media connection to its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    LocalCandidate(IceCandidate),
    Ice(IceState),
}

pub type MediaEvents = mpsc::UnboundedSender<MediaEvent>;

/// Allocates media connections, one per remote device.
#[async_trait]
pub trait MediaConnector: Send + Sync {
    async fn open(
        &self,
        remote_device_id: &str,
        events: MediaEvents,
    ) -> Result<Arc<dyn MediaConnection>, NegotiationError>;
}

/// One negotiated media path.
#[async_trait]
pub trait MediaConnection: Send + Sync {
    /// Creates an offer for sending and receiving video and audio, and applies
    /// it as the local description before returning it.
    async fn create_offer(&self) -> Result<String, NegotiationError>;

    /// Creates an answer to the applied remote offer and applies it locally.
    async fn create_answer(&self) -> Result<String, NegotiationError>;

    async fn set_remote_description(
        &self,
        kind: SdpKind,
        sdp: String,
    ) -> Result<(), NegotiationError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    /// Sends a locally captured track on the transceiver of the same kind.
    async fn attach_track(
        &self,
        track: Arc<dyn TrackLocal + Send + Sync>,
    ) -> Result<(), NegotiationError>;

    async fn close(&self);
}

fn media_error(err: webrtc::Error) -> NegotiationError {
    NegotiationError::Media(err.to_string())
}

fn sdp_error(err: webrtc::Error) -> NegotiationError {
    NegotiationError::Sdp(err.to_string())
}

/// webrtc-rs backed connector.
pub struct RtcConnector {
    api: API,
    config: MediaConfig,
}

impl RtcConnector {
    pub fn new(config: MediaConfig) -> Result<Self, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(media_error)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(media_error)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api, config })
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.config.ice_servers.is_empty() {
            Vec::new()
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
impl MediaConnector for RtcConnector {
    async fn open(
        &self,
        remote_device_id: &str,
        events: MediaEvents,
    ) -> Result<Arc<dyn MediaConnection>, NegotiationError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.rtc_configuration())
                .await
                .map_err(media_error)?,
        );

        for kind in [RTPCodecType::Video, RTPCodecType::Audio] {
            pc.add_transceiver_from_kind(kind, None)
                .await
                .map_err(media_error)?;
        }

        let candidate_tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = candidate_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!("ICE gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(MediaEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid.unwrap_or_default(),
                            sdp_mline_index: init.sdp_mline_index.unwrap_or(0),
                        }));
                    }
                    Err(e) => warn!("failed to serialize local ICE candidate: {}", e),
                }
            })
        }));

        let remote = remote_device_id.to_string();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            debug!("ICE connection state for {}: {}", remote, state);
            let mapped = match state {
                RTCIceConnectionState::Checking => Some(IceState::Checking),
                RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                    Some(IceState::Connected)
                }
                RTCIceConnectionState::Disconnected => Some(IceState::Disconnected),
                RTCIceConnectionState::Failed => Some(IceState::Failed),
                RTCIceConnectionState::Closed => Some(IceState::Closed),
                _ => None,
            };
            if let Some(mapped) = mapped {
                let _ = events.send(MediaEvent::Ice(mapped));
            }
            Box::pin(async {})
        }));

        let remote = remote_device_id.to_string();
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            info!("remote {} track received from {}", track.kind(), remote);
            Box::pin(async {})
        }));

        debug!("peer connection allocated for {}", remote_device_id);
        Ok(Arc::new(RtcConnection { pc }))
    }
}

struct RtcConnection {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl MediaConnection for RtcConnection {
    async fn create_offer(&self) -> Result<String, NegotiationError> {
        let offer = self.pc.create_offer(None).await.map_err(sdp_error)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(sdp_error)?;
        Ok(offer.sdp)
    }

    async fn create_answer(&self) -> Result<String, NegotiationError> {
        let answer = self.pc.create_answer(None).await.map_err(sdp_error)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(sdp_error)?;
        Ok(answer.sdp)
    }

    async fn set_remote_description(
        &self,
        kind: SdpKind,
        sdp: String,
    ) -> Result<(), NegotiationError> {
        let description = match kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp),
            SdpKind::Answer => RTCSessionDescription::answer(sdp),
        }
        .map_err(sdp_error)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(sdp_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: (!candidate.sdp_mid.is_empty()).then_some(candidate.sdp_mid),
            sdp_mline_index: Some(candidate.sdp_mline_index),
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| NegotiationError::Candidate(e.to_string()))
    }

    async fn attach_track(
        &self,
        track: Arc<dyn TrackLocal + Send + Sync>,
    ) -> Result<(), NegotiationError> {
        let kind = track.kind();
        for transceiver in self.pc.get_transceivers().await {
            if transceiver.kind() == kind {
                let sender = transceiver.sender().await;
                return sender.replace_track(Some(track)).await.map_err(media_error);
            }
        }
        Err(NegotiationError::Media(format!("no {kind} transceiver")))
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!("failed to close peer connection: {}", e);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn offline_connector() -> RtcConnector {
        RtcConnector::new(MediaConfig {
            ice_servers: Vec::new(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_offer_carries_video_and_audio() {
        let connector = offline_connector();
        let (tx, _rx) = mpsc::unbounded_channel();
        let connection = connector.open("camera-1", tx).await.unwrap();

        let sdp = connection.create_offer().await.unwrap();
        assert!(sdp.contains("m=video"));
        assert!(sdp.contains("m=audio"));
        connection.close().await;
    }

    #[tokio::test]
    async fn test_offer_answer_exchange_between_two_connections() {
        let connector = offline_connector();
        let (viewer_tx, _viewer_rx) = mpsc::unbounded_channel();
        let (camera_tx, _camera_rx) = mpsc::unbounded_channel();
        let viewer = connector.open("camera-1", viewer_tx).await.unwrap();
        let camera = connector.open("viewer-1", camera_tx).await.unwrap();

        let offer = viewer.create_offer().await.unwrap();
        camera
            .set_remote_description(SdpKind::Offer, offer)
            .await
            .unwrap();
        let answer = camera.create_answer().await.unwrap();
        viewer
            .set_remote_description(SdpKind::Answer, answer)
            .await
            .unwrap();

        viewer.close().await;
        camera.close().await;
    }

    #[tokio::test]
    async fn test_garbage_remote_description_is_rejected() {
        let connector = offline_connector();
        let (tx, _rx) = mpsc::unbounded_channel();
        let connection = connector.open("camera-1", tx).await.unwrap();

        let result = connection
            .set_remote_description(SdpKind::Offer, "not an sdp".into())
            .await;
        assert!(matches!(result, Err(NegotiationError::Sdp(_))));
        connection.close().await;
    }
}
