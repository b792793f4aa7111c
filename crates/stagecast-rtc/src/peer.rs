//! `webrtc` peer connection construction and its [`SessionPeer`] binding.

use std::sync::Arc;

use async_trait::async_trait;
use stagecast_common::{Error, IceCandidatePayload, IceServerConfig, Result};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::negotiator::SessionPeer;

pub(crate) fn rtc_error(err: webrtc::Error) -> Error {
    Error::rtc(err)
}

/// Build a peer connection with the default codecs and interceptors.
pub async fn new_peer_connection(ice_servers: &[IceServerConfig]) -> Result<Arc<RTCPeerConnection>> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs().map_err(rtc_error)?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine).map_err(rtc_error)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let config = RTCConfiguration {
        ice_servers: ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    };

    let pc = api.new_peer_connection(config).await.map_err(rtc_error)?;
    Ok(Arc::new(pc))
}

/// [`SessionPeer`] over a `webrtc` peer connection.
pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
}

impl RtcPeer {
    pub fn new(pc: Arc<RTCPeerConnection>) -> Self {
        Self { pc }
    }

    pub fn connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }

    /// Route locally gathered candidates into a channel, in generation order.
    pub fn local_candidates(&self, label: &str) -> mpsc::UnboundedReceiver<IceCandidatePayload> {
        let (tx, rx) = mpsc::unbounded_channel();
        let label = label.to_string();
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = tx.clone();
            let label = label.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!("{}: ICE gathering complete", label);
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(IceCandidatePayload {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_m_line_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        });
                    }
                    Err(e) => warn!("{}: failed to serialize local candidate: {}", label, e),
                }
            })
        }));
        rx
    }
}

#[async_trait]
impl SessionPeer for RtcPeer {
    async fn create_offer(&self) -> Result<String> {
        let offer = self.pc.create_offer(None).await.map_err(rtc_error)?;
        Ok(offer.sdp)
    }

    async fn set_local_offer(&self, sdp: &str) -> Result<()> {
        let offer = RTCSessionDescription::offer(sdp.to_string()).map_err(rtc_error)?;
        self.pc.set_local_description(offer).await.map_err(rtc_error)
    }

    async fn local_description(&self) -> Option<String> {
        self.pc.local_description().await.map(|desc| desc.sdp)
    }

    async fn set_remote_answer(&self, sdp: &str) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| Error::protocol(format!("invalid answer sdp: {e}")))?;
        self.pc.set_remote_description(answer).await.map_err(rtc_error)
    }

    async fn add_remote_candidate(&self, candidate: IceCandidatePayload) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_m_line_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(rtc_error)
    }
}
