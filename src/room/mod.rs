//! Room session management.
//!
//! One bus topic per room code. The presenter owns the canonical
//! [`RoomState`] and broadcasts it; every peer holds a mirror that is
//! replaced atomically on each `state_sync` event. If two broadcasts race,
//! whichever arrives last at a given viewer wins; that weakening is part of
//! the protocol, not a defect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use tokio::sync::{broadcast::error::RecvError, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::bus::{room_topic, BusEvent, MessageBus, Participant, Role, RoomState, TopicHandle};
use crate::config::ReconnectPolicy;
use crate::error::Result;

/// Generate a random 6-digit room code.
pub fn generate_room_code() -> String {
    let mut rng = rand::thread_rng();
    format!("{:06}", rng.gen_range(100000..999999))
}

/// Partial update to this peer's presence metadata.
#[derive(Debug, Default, Clone)]
pub struct PresencePatch {
    pub name: Option<String>,
    pub hand_raised: Option<bool>,
}

/// A live connection to one room.
pub struct RoomSession {
    room_code: String,
    role: Role,
    local_peer_id: String,
    topic: TopicHandle,
    state: Arc<RwLock<RoomState>>,
    participants: Arc<RwLock<Vec<Participant>>>,
    meta: Arc<Mutex<Participant>>,
    connected: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RoomSession {
    /// Subscribe to the room topic, register presence, and start mirroring
    /// state and participant snapshots.
    ///
    /// Subscription failure surfaces as an error and leaves nothing running;
    /// there is no automatic retry here (see [`Self::connect_with_retry`]).
    pub async fn connect(
        bus: &dyn MessageBus,
        room_code: &str,
        role: Role,
        display_name: &str,
    ) -> Result<Self> {
        let local_peer_id = uuid::Uuid::new_v4().to_string();
        let topic = bus.subscribe(&room_topic(room_code), &local_peer_id).await?;

        let meta = Participant {
            id: local_peer_id.clone(),
            name: display_name.to_string(),
            role,
            joined_at: Utc::now(),
            hand_raised: false,
        };
        topic.track(meta.clone()).await?;

        let state = Arc::new(RwLock::new(RoomState::default()));
        let participants = Arc::new(RwLock::new(topic.presence_snapshot().await));
        let connected = Arc::new(AtomicBool::new(true));

        let mut tasks = Vec::new();

        // Mirror task: replace the whole snapshot on every state_sync, never
        // a partial merge.
        {
            let mut events = topic.events();
            let state = state.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(BusEvent::StateSync(next)) => {
                            *state.write().await = next;
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "State mirror lagged behind topic");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }));
        }

        // Presence task: recompute the full participant list from the
        // registry snapshot on every membership change. Idempotent, safe to
        // run redundantly.
        {
            let mut changes = topic.presence_changes();
            let topic = topic.clone();
            let participants = participants.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    match changes.recv().await {
                        Ok(()) | Err(RecvError::Lagged(_)) => {
                            *participants.write().await = topic.presence_snapshot().await;
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }));
        }

        tracing::info!(
            room_code = %room_code,
            peer_id = %local_peer_id,
            role = ?role,
            "Connected to room"
        );

        Ok(Self {
            room_code: room_code.to_string(),
            role,
            local_peer_id,
            topic,
            state,
            participants,
            meta: Arc::new(Mutex::new(meta)),
            connected,
            tasks: Mutex::new(tasks),
        })
    }

    /// [`Self::connect`] with the configured retry policy applied on
    /// subscription failure, backing off exponentially between attempts.
    pub async fn connect_with_retry(
        bus: &dyn MessageBus,
        room_code: &str,
        role: Role,
        display_name: &str,
        policy: &ReconnectPolicy,
    ) -> Result<Self> {
        let attempts = policy.max_attempts.max(1);
        let mut last_err = None;

        for attempt in 1..=attempts {
            match Self::connect(bus, room_code, role, display_name).await {
                Ok(session) => return Ok(session),
                Err(err) => {
                    tracing::warn!(
                        room_code = %room_code,
                        attempt,
                        error = %err,
                        "Room connect attempt failed"
                    );
                    last_err = Some(err);
                    if attempt < attempts {
                        tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
                    }
                }
            }
        }

        Err(last_err.expect("at least one attempt"))
    }

    /// Broadcast the canonical room state. No-op for viewers; this is a
    /// client-side convenience guard, not a security boundary.
    pub async fn broadcast(&self, state: RoomState) -> Result<()> {
        if self.role != Role::Presenter {
            tracing::debug!(peer_id = %self.local_peer_id, "Ignoring broadcast from non-presenter");
            return Ok(());
        }
        self.topic.publish(BusEvent::StateSync(state)).await
    }

    /// Merge a partial update into the locally held presence metadata and
    /// re-publish the full object (last-writer-wins at the object level).
    pub async fn update_presence(&self, patch: PresencePatch) -> Result<()> {
        let meta = {
            let mut meta = self.meta.lock().await;
            if let Some(name) = patch.name {
                meta.name = name;
            }
            if let Some(hand_raised) = patch.hand_raised {
                meta.hand_raised = hand_raised;
            }
            meta.clone()
        };
        self.topic.track(meta).await
    }

    /// Leave the room: remove presence, stop mirror tasks, mark disconnected.
    pub async fn disconnect(&self) {
        if let Err(err) = self.topic.untrack().await {
            tracing::warn!(error = %err, "Failed to untrack presence on disconnect");
        }
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
        tracing::info!(room_code = %self.room_code, peer_id = %self.local_peer_id, "Disconnected from room");
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Current mirror of the presenter's state.
    pub async fn state(&self) -> RoomState {
        self.state.read().await.clone()
    }

    /// Current participant list, recomputed from presence snapshots.
    pub async fn participants(&self) -> Vec<Participant> {
        self.participants.read().await.clone()
    }

    pub fn local_peer_id(&self) -> &str {
        &self.local_peer_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn room_code(&self) -> &str {
        &self.room_code
    }

    /// Handle to the underlying topic, shared with the mesh manager and the
    /// coordinator/student agents of this peer.
    pub fn topic_handle(&self) -> TopicHandle {
        self.topic.clone()
    }
}
