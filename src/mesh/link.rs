//! One point-to-point connection to a remote peer.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::{MeshError, Result};

/// Build the shared WebRTC API with default codecs and interceptors.
pub fn create_webrtc_api() -> Result<Arc<API>> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    Ok(Arc::new(
        APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build(),
    ))
}

pub(crate) fn kind_label(kind: RTPCodecType) -> &'static str {
    match kind {
        RTPCodecType::Audio => "audio",
        RTPCodecType::Video => "video",
        RTPCodecType::Unspecified => "unspecified",
    }
}

/// The locally captured media, owned by the media-acquisition layer. The
/// mesh only attaches and substitutes these tracks on connections; it never
/// stops tracks it does not own.
#[derive(Clone, Default)]
pub struct LocalMedia {
    pub tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>,
}

impl LocalMedia {
    pub fn new(tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>) -> Self {
        Self { tracks }
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

/// Inbound media from one remote peer, keyed by track kind. Replaced
/// wholesale per kind when a new track event fires.
#[derive(Clone, Default)]
pub struct RemoteMedia {
    pub tracks: HashMap<String, Arc<TrackRemote>>,
}

/// Crate-side signaling state for one link. Answers are only applied in
/// `OfferSent`; anything else is stale and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    OfferSent,
    Connected,
    Closed,
}

pub struct PeerLink {
    remote_peer_id: String,
    pc: Arc<RTCPeerConnection>,
    senders: RwLock<HashMap<&'static str, Arc<RTCRtpSender>>>,
    state: RwLock<LinkState>,
}

impl PeerLink {
    pub async fn new(api: &Arc<API>, remote_peer_id: &str, stun_servers: &[String]) -> Result<Self> {
        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: stun_servers.to_vec(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| MeshError::PeerConnectionCreation(e.to_string()))?,
        );

        Ok(Self {
            remote_peer_id: remote_peer_id.to_string(),
            pc,
            senders: RwLock::new(HashMap::new()),
            state: RwLock::new(LinkState::Idle),
        })
    }

    pub fn remote_peer_id(&self) -> &str {
        &self.remote_peer_id
    }

    pub(crate) fn raw(&self) -> Arc<RTCPeerConnection> {
        self.pc.clone()
    }

    pub async fn state(&self) -> LinkState {
        *self.state.read().await
    }

    /// Attach the local tracks to this connection. When there is nothing to
    /// send, receive-only transceivers keep media sections in the offer.
    pub async fn attach_local(&self, media: &LocalMedia) -> Result<()> {
        if media.is_empty() {
            self.pc
                .add_transceiver_from_kind(RTPCodecType::Video, None)
                .await?;
            self.pc
                .add_transceiver_from_kind(RTPCodecType::Audio, None)
                .await?;
            return Ok(());
        }

        let mut senders = self.senders.write().await;
        for track in &media.tracks {
            let kind = kind_label(track.kind());
            let sender = self
                .pc
                .add_track(track.clone())
                .await
                .map_err(|e| MeshError::AddTrackFailed(e.to_string()))?;
            senders.insert(kind, sender);
        }
        Ok(())
    }

    /// Substitute outbound tracks in place (same-kind replacement). Avoids a
    /// renegotiation round trip when the local stream changes identity.
    pub async fn replace_local(&self, media: &LocalMedia) -> Result<()> {
        let mut senders = self.senders.write().await;
        for track in &media.tracks {
            let kind = kind_label(track.kind());
            match senders.get(kind) {
                Some(sender) => {
                    sender
                        .replace_track(Some(track.clone()))
                        .await
                        .map_err(|e| MeshError::AddTrackFailed(e.to_string()))?;
                }
                None => {
                    let sender = self
                        .pc
                        .add_track(track.clone())
                        .await
                        .map_err(|e| MeshError::AddTrackFailed(e.to_string()))?;
                    senders.insert(kind, sender);
                }
            }
        }
        Ok(())
    }

    /// Create a session offer and set it as the local description.
    pub async fn create_offer(&self) -> Result<RTCSessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| MeshError::CreateOfferFailed(e.to_string()))?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| MeshError::SetLocalDescriptionFailed(e.to_string()))?;

        *self.state.write().await = LinkState::OfferSent;
        Ok(offer)
    }

    /// Apply a remote offer and produce the local answer.
    pub async fn accept_offer(&self, offer: RTCSessionDescription) -> Result<RTCSessionDescription> {
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| MeshError::SetRemoteDescriptionFailed(e.to_string()))?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| MeshError::CreateAnswerFailed(e.to_string()))?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| MeshError::SetLocalDescriptionFailed(e.to_string()))?;

        *self.state.write().await = LinkState::Connected;
        Ok(answer)
    }

    /// Apply a remote answer. Returns false when the link is not waiting for
    /// one, in which case the answer is stale and the caller drops it.
    pub async fn apply_answer(&self, answer: RTCSessionDescription) -> Result<bool> {
        {
            let state = self.state.read().await;
            if *state != LinkState::OfferSent {
                return Ok(false);
            }
        }

        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| MeshError::SetRemoteDescriptionFailed(e.to_string()))?;

        *self.state.write().await = LinkState::Connected;
        Ok(true)
    }

    pub async fn add_remote_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        self.pc
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| MeshError::AddIceCandidateFailed(e.to_string()))
    }

    /// Close the underlying connection. Idempotent.
    pub async fn close(&self) {
        {
            let mut state = self.state.write().await;
            if *state == LinkState::Closed {
                return;
            }
            *state = LinkState::Closed;
        }

        if let Err(err) = self.pc.close().await {
            tracing::debug!(
                peer_id = %self.remote_peer_id,
                error = %err,
                "Error closing peer connection"
            );
        }
    }
}
