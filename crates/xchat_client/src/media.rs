/*
 * SPDX-FileCopyrightText: 2026 XChat Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Peer session adapter: the seam between the call session state machine and
//! the `webrtc` crate. Tests substitute a fake transport here.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("media permission denied: {0}")]
    PermissionDenied(String),
    #[error("media setup failed: {0}")]
    Setup(String),
}

fn setup(e: impl std::fmt::Display) -> MediaError {
    MediaError::Setup(format!("{e:#}"))
}

/// Events the transport pushes back to the session actor. Trickle ICE plus
/// the connection-state transitions the call state machine cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    Candidate {
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    },
    Connected,
    Disconnected,
    Failed,
}

#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Caller side: local description is set, returns the offer SDP.
    async fn create_offer(&self) -> Result<String, MediaError>;
    /// Callee side: applies the remote offer and returns the answer SDP.
    async fn answer_offer(&self, offer_sdp: &str) -> Result<String, MediaError>;
    /// Caller side: applies the remote answer.
    async fn apply_answer(&self, answer_sdp: &str) -> Result<(), MediaError>;
    async fn add_remote_candidate(
        &self,
        candidate: &str,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    ) -> Result<(), MediaError>;
    async fn close(&self);
}

#[async_trait]
pub trait MediaFactory: Send + Sync {
    /// Capability check before any call-record side effect. A
    /// `PermissionDenied` here cancels the initiate or turns an accept into
    /// a decline.
    async fn probe(&self, is_video: bool) -> Result<(), MediaError>;
    async fn create(
        &self,
        is_video: bool,
        events: mpsc::Sender<MediaEvent>,
    ) -> Result<Arc<dyn MediaTransport>, MediaError>;
}

pub struct WebrtcFactory {
    pub ice_urls: Vec<String>,
    pub ice_username: Option<String>,
    pub ice_credential: Option<String>,
}

impl WebrtcFactory {
    fn ice_servers(&self) -> Vec<RTCIceServer> {
        if self.ice_urls.is_empty() {
            return Vec::new();
        }
        vec![RTCIceServer {
            urls: self.ice_urls.clone(),
            username: self.ice_username.clone().unwrap_or_default(),
            credential: self.ice_credential.clone().unwrap_or_default(),
            ..Default::default()
        }]
    }
}

#[async_trait]
impl MediaFactory for WebrtcFactory {
    async fn probe(&self, _is_video: bool) -> Result<(), MediaError> {
        // Exercises the codec stack; capture-device permission checks live in
        // the app layer above this crate.
        let mut engine = MediaEngine::default();
        engine.register_default_codecs().map_err(setup)?;
        Ok(())
    }

    async fn create(
        &self,
        is_video: bool,
        events: mpsc::Sender<MediaEvent>,
    ) -> Result<Arc<dyn MediaTransport>, MediaError> {
        let mut engine = MediaEngine::default();
        engine.register_default_codecs().map_err(setup)?;
        let registry = register_default_interceptors(Registry::new(), &mut engine).map_err(setup)?;
        let api = APIBuilder::new()
            .with_media_engine(engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = api
            .new_peer_connection(RTCConfiguration {
                ice_servers: self.ice_servers(),
                ..Default::default()
            })
            .await
            .map_err(setup)?;
        let pc = Arc::new(pc);

        pc.add_transceiver_from_kind(RTPCodecType::Audio, None)
            .await
            .map_err(setup)?;
        if is_video {
            pc.add_transceiver_from_kind(RTPCodecType::Video, None)
                .await
                .map_err(setup)?;
        }

        // Trickle ICE straight into the session's event stream.
        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |cand| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(cand) = cand else { return };
                if let Ok(init) = cand.to_json() {
                    let _ = tx
                        .send(MediaEvent::Candidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        })
                        .await;
                }
            })
        }));

        let tx = events;
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            let tx = tx.clone();
            Box::pin(async move {
                let ev = match st {
                    RTCPeerConnectionState::Connected => Some(MediaEvent::Connected),
                    RTCPeerConnectionState::Disconnected => Some(MediaEvent::Disconnected),
                    RTCPeerConnectionState::Failed => Some(MediaEvent::Failed),
                    _ => None,
                };
                if let Some(ev) = ev {
                    let _ = tx.send(ev).await;
                }
            })
        }));

        Ok(Arc::new(WebrtcTransport { pc }))
    }
}

pub struct WebrtcTransport {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl MediaTransport for WebrtcTransport {
    async fn create_offer(&self) -> Result<String, MediaError> {
        let offer = self.pc.create_offer(None).await.map_err(setup)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(setup)?;
        Ok(offer.sdp)
    }

    async fn answer_offer(&self, offer_sdp: &str) -> Result<String, MediaError> {
        let offer = RTCSessionDescription::offer(offer_sdp.to_string()).map_err(setup)?;
        self.pc.set_remote_description(offer).await.map_err(setup)?;
        let answer = self.pc.create_answer(None).await.map_err(setup)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(setup)?;
        Ok(answer.sdp)
    }

    async fn apply_answer(&self, answer_sdp: &str) -> Result<(), MediaError> {
        let answer = RTCSessionDescription::answer(answer_sdp.to_string()).map_err(setup)?;
        self.pc.set_remote_description(answer).await.map_err(setup)?;
        Ok(())
    }

    async fn add_remote_candidate(
        &self,
        candidate: &str,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    ) -> Result<(), MediaError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.to_string(),
                sdp_mid,
                sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(setup)?;
        Ok(())
    }

    async fn close(&self) {
        let _ = self.pc.close().await;
    }
}
