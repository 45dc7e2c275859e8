//! Peer-to-peer mesh connection manager.
//!
//! One bidirectional media connection per remote peer, negotiated over the
//! room topic (`webrtc_offer` / `webrtc_answer` / `webrtc_ice`, each
//! addressed by peer id). For any pair of peers exactly one side initiates:
//! the one whose id sorts lexicographically lower. That tie-break avoids
//! glare and requires peer ids drawn from a total order; UUID strings
//! compare fine for this purpose.

mod link;

pub use link::{create_webrtc_api, LinkState, LocalMedia, PeerLink, RemoteMedia};

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast::error::RecvError, Mutex, RwLock};
use tokio::task::JoinHandle;
use webrtc::api::API;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

use crate::bus::{BusEvent, IceSignal, Participant, SdpSignal, TopicHandle};
use crate::error::Result;
use link::kind_label;

/// True when the local peer is the one that must send the offer.
pub fn should_initiate(local_peer_id: &str, remote_peer_id: &str) -> bool {
    local_peer_id < remote_peer_id
}

pub struct MeshManager {
    inner: Arc<MeshInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct MeshInner {
    local_peer_id: String,
    topic: TopicHandle,
    api: Arc<API>,
    stun_servers: Vec<String>,
    links: Arc<RwLock<HashMap<String, Arc<PeerLink>>>>,
    remote: Arc<RwLock<HashMap<String, RemoteMedia>>>,
    local_media: RwLock<LocalMedia>,
    enabled: AtomicBool,
}

impl MeshManager {
    pub fn new(
        topic: TopicHandle,
        local_peer_id: &str,
        local_media: LocalMedia,
        stun_servers: Vec<String>,
    ) -> Result<Self> {
        let api = create_webrtc_api()?;

        Ok(Self {
            inner: Arc::new(MeshInner {
                local_peer_id: local_peer_id.to_string(),
                topic,
                api,
                stun_servers,
                links: Arc::new(RwLock::new(HashMap::new())),
                remote: Arc::new(RwLock::new(HashMap::new())),
                local_media: RwLock::new(local_media),
                enabled: AtomicBool::new(true),
            }),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start consuming signaling events addressed to the local peer.
    pub async fn start(&self) {
        let inner = self.inner.clone();
        let mut events = inner.topic.events();

        let pump = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(BusEvent::WebrtcOffer(signal)) if signal.to == inner.local_peer_id => {
                        if let Err(err) = inner.handle_offer(signal).await {
                            tracing::warn!(error = %err, "Failed to handle offer");
                        }
                    }
                    Ok(BusEvent::WebrtcAnswer(signal)) if signal.to == inner.local_peer_id => {
                        if let Err(err) = inner.handle_answer(signal).await {
                            tracing::warn!(error = %err, "Failed to handle answer");
                        }
                    }
                    Ok(BusEvent::WebrtcIce(signal)) if signal.to == inner.local_peer_id => {
                        inner.handle_ice(signal).await;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Mesh signaling lagged behind topic");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        self.tasks.lock().await.push(pump);
    }

    /// Reconcile open connections against the current presence list:
    /// close links to departed peers, then initiate to new peers when the
    /// local id wins the tie-break. Safe to call redundantly; repeated
    /// passes never create a second connection to the same peer.
    pub async fn reconcile(&self, participants: &[Participant]) {
        if !self.inner.enabled.load(Ordering::SeqCst) {
            return;
        }

        let remote_ids: HashSet<&str> = participants
            .iter()
            .map(|p| p.id.as_str())
            .filter(|id| *id != self.inner.local_peer_id)
            .collect();

        // Departed peers first, close before dropping the reference
        let departed: Vec<String> = {
            let links = self.inner.links.read().await;
            links
                .keys()
                .filter(|id| !remote_ids.contains(id.as_str()))
                .cloned()
                .collect()
        };
        for peer_id in departed {
            self.inner.close_link(&peer_id).await;
        }

        for peer_id in remote_ids {
            if self.inner.links.read().await.contains_key(peer_id) {
                continue;
            }
            if !should_initiate(&self.inner.local_peer_id, peer_id) {
                // The higher-sorting side waits passively for the offer
                continue;
            }
            if let Err(err) = self.inner.initiate(peer_id).await {
                tracing::warn!(peer_id = %peer_id, error = %err, "Failed to initiate connection");
            }
        }
    }

    /// Swap the outbound tracks on every open connection after the local
    /// stream changed identity. Same-kind substitution, no renegotiation.
    pub async fn replace_local_media(&self, media: LocalMedia) {
        *self.inner.local_media.write().await = media.clone();

        let links: Vec<Arc<PeerLink>> = self.inner.links.read().await.values().cloned().collect();
        for link in links {
            if let Err(err) = link.replace_local(&media).await {
                tracing::warn!(
                    peer_id = %link.remote_peer_id(),
                    error = %err,
                    "Failed to replace outbound tracks"
                );
            }
        }
    }

    /// Snapshot of inbound media per remote peer id.
    pub async fn remote_streams(&self) -> HashMap<String, RemoteMedia> {
        self.inner.remote.read().await.clone()
    }

    pub async fn link_count(&self) -> usize {
        self.inner.links.read().await.len()
    }

    pub async fn link_state(&self, peer_id: &str) -> Option<LinkState> {
        let link = self.inner.links.read().await.get(peer_id).cloned();
        match link {
            Some(link) => Some(link.state().await),
            None => None,
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Close every connection and stop signaling. Must leave no open link
    /// behind; local tracks are not stopped here because the mesh does not
    /// own them.
    pub async fn teardown(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }

        let links: Vec<String> = self.inner.links.read().await.keys().cloned().collect();
        for peer_id in links {
            self.inner.close_link(&peer_id).await;
        }
        self.inner.remote.write().await.clear();
        self.inner.enabled.store(false, Ordering::SeqCst);

        tracing::info!(peer_id = %self.inner.local_peer_id, "Mesh torn down");
    }
}

impl MeshInner {
    /// Create a link, wire its callbacks, and attach local tracks.
    async fn create_link(&self, remote_peer_id: &str) -> Result<Arc<PeerLink>> {
        let link = Arc::new(PeerLink::new(&self.api, remote_peer_id, &self.stun_servers).await?);
        let pc = link.raw();

        // Inbound tracks populate the remote map under this peer's id
        {
            let remote = self.remote.clone();
            let peer_id = remote_peer_id.to_string();
            pc.on_track(Box::new(move |track, _receiver, _transceiver| {
                let remote = remote.clone();
                let peer_id = peer_id.clone();
                Box::pin(async move {
                    let kind = kind_label(track.kind());
                    tracing::debug!(peer_id = %peer_id, kind = %kind, "Remote track arrived");
                    remote
                        .write()
                        .await
                        .entry(peer_id)
                        .or_default()
                        .tracks
                        .insert(kind.to_string(), track);
                })
            }));
        }

        // Trickle local candidates to the specific remote peer
        {
            let topic = self.topic.clone();
            let from = self.local_peer_id.clone();
            let to = remote_peer_id.to_string();
            pc.on_ice_candidate(Box::new(move |candidate| {
                let topic = topic.clone();
                let from = from.clone();
                let to = to.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else { return };
                    match candidate.to_json() {
                        Ok(init) => {
                            let signal = IceSignal {
                                from,
                                to,
                                candidate: init,
                            };
                            if let Err(err) = topic.publish(BusEvent::WebrtcIce(signal)).await {
                                tracing::warn!(error = %err, "Failed to publish ICE candidate");
                            }
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "Failed to serialize ICE candidate");
                        }
                    }
                })
            }));
        }

        // Failed/closed connections tear down without renegotiation; the
        // next reconcile pass recreates the link if the peer is still there
        {
            let links = self.links.clone();
            let remote = self.remote.clone();
            let peer_id = remote_peer_id.to_string();
            pc.on_peer_connection_state_change(Box::new(move |state| {
                let links = links.clone();
                let remote = remote.clone();
                let peer_id = peer_id.clone();
                Box::pin(async move {
                    if matches!(
                        state,
                        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                    ) {
                        let link = links.write().await.remove(&peer_id);
                        if let Some(link) = link {
                            tracing::info!(peer_id = %peer_id, state = %state, "Connection ended, removing link");
                            link.close().await;
                        }
                        remote.write().await.remove(&peer_id);
                    }
                })
            }));
        }

        {
            let media = self.local_media.read().await;
            link.attach_local(&media).await?;
        }

        self.links
            .write()
            .await
            .insert(remote_peer_id.to_string(), link.clone());
        Ok(link)
    }

    /// Offerer side: create the link, publish an addressed offer.
    async fn initiate(&self, remote_peer_id: &str) -> Result<()> {
        let link = self.create_link(remote_peer_id).await?;
        let offer = link.create_offer().await?;

        tracing::debug!(peer_id = %remote_peer_id, "Sending offer");
        self.topic
            .publish(BusEvent::WebrtcOffer(SdpSignal {
                from: self.local_peer_id.clone(),
                to: remote_peer_id.to_string(),
                sdp: offer,
            }))
            .await
    }

    /// Receiver side: apply the offer on a fresh or existing link and answer.
    async fn handle_offer(&self, signal: SdpSignal) -> Result<()> {
        if signal.from == self.local_peer_id {
            return Ok(());
        }

        let link = {
            let existing = self.links.read().await.get(&signal.from).cloned();
            match existing {
                Some(link) => link,
                None => self.create_link(&signal.from).await?,
            }
        };

        let answer = link.accept_offer(signal.sdp).await?;

        tracing::debug!(peer_id = %signal.from, "Sending answer");
        self.topic
            .publish(BusEvent::WebrtcAnswer(SdpSignal {
                from: self.local_peer_id.clone(),
                to: signal.from,
                sdp: answer,
            }))
            .await
    }

    /// Offerer side: apply the answer while waiting for one, drop otherwise.
    async fn handle_answer(&self, signal: SdpSignal) -> Result<()> {
        let link = self.links.read().await.get(&signal.from).cloned();
        let Some(link) = link else {
            tracing::debug!(peer_id = %signal.from, "Answer for unknown link, dropping");
            return Ok(());
        };

        if !link.apply_answer(signal.sdp).await? {
            tracing::debug!(peer_id = %signal.from, "Stale answer dropped");
        }
        Ok(())
    }

    /// Candidates for links we do not hold are dropped.
    async fn handle_ice(&self, signal: IceSignal) {
        let link = self.links.read().await.get(&signal.from).cloned();
        let Some(link) = link else {
            tracing::debug!(peer_id = %signal.from, "ICE candidate for unknown link, dropping");
            return;
        };

        if let Err(err) = link.add_remote_candidate(signal.candidate).await {
            tracing::debug!(peer_id = %signal.from, error = %err, "Failed to apply ICE candidate");
        }
    }

    /// Close-before-drop removal; the only way a link leaves the map alive.
    async fn close_link(&self, peer_id: &str) {
        let link = self.links.write().await.remove(peer_id);
        if let Some(link) = link {
            link.close().await;
        }
        self.remote.write().await.remove(peer_id);
    }
}
