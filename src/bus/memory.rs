//! In-process bus implementation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};

use super::{BusEvent, MessageBus, Participant, TopicChannel, TopicHandle};
use crate::error::{MeshError, Result};

const EVENT_CHANNEL_CAPACITY: usize = 256;

struct TopicState {
    events: broadcast::Sender<BusEvent>,
    presence: RwLock<HashMap<String, Participant>>,
    presence_changes: broadcast::Sender<()>,
}

impl TopicState {
    fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (presence_changes, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            events,
            presence: RwLock::new(HashMap::new()),
            presence_changes,
        }
    }
}

/// Bus backed by per-topic `tokio::sync::broadcast` channels and an
/// in-memory presence registry. Every subscriber of a topic receives every
/// broadcast, including echoes of its own publishes.
pub struct InMemoryBus {
    topics: Arc<RwLock<HashMap<String, Arc<TopicState>>>>,
}

impl InMemoryBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            topics: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    async fn topic_state(&self, topic: &str) -> Arc<TopicState> {
        if let Some(state) = self.topics.read().await.get(topic) {
            return state.clone();
        }

        let mut topics = self.topics.write().await;
        topics
            .entry(topic.to_string())
            .or_insert_with(|| Arc::new(TopicState::new()))
            .clone()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn subscribe(&self, topic: &str, local_peer_id: &str) -> Result<TopicHandle> {
        let state = self.topic_state(topic).await;
        tracing::debug!(topic = %topic, peer_id = %local_peer_id, "Subscribed to topic");

        Ok(Arc::new(InMemoryTopic {
            topic: topic.to_string(),
            local_peer_id: local_peer_id.to_string(),
            state,
        }))
    }
}

struct InMemoryTopic {
    topic: String,
    local_peer_id: String,
    state: Arc<TopicState>,
}

#[async_trait]
impl TopicChannel for InMemoryTopic {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn publish(&self, event: BusEvent) -> Result<()> {
        // A send error only means no subscriber currently holds a receiver,
        // which is legal for fire-and-forget broadcast.
        let _ = self.state.events.send(event);
        Ok(())
    }

    async fn track(&self, meta: Participant) -> Result<()> {
        if meta.id != self.local_peer_id {
            return Err(MeshError::PublishFailed(
                self.topic.clone(),
                format!(
                    "presence entry id {} does not match subscriber {}",
                    meta.id, self.local_peer_id
                ),
            ));
        }

        {
            let mut presence = self.state.presence.write().await;
            presence.insert(self.local_peer_id.clone(), meta);
        }
        let _ = self.state.presence_changes.send(());
        Ok(())
    }

    async fn untrack(&self) -> Result<()> {
        let removed = {
            let mut presence = self.state.presence.write().await;
            presence.remove(&self.local_peer_id).is_some()
        };

        if removed {
            let _ = self.state.presence_changes.send(());
        }
        Ok(())
    }

    async fn presence_snapshot(&self) -> Vec<Participant> {
        let presence = self.state.presence.read().await;
        let mut entries: Vec<Participant> = presence.values().cloned().collect();
        // Registry iteration order is arbitrary; stable order keeps
        // participant lists deterministic across subscribers.
        entries.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then(a.id.cmp(&b.id)));
        entries
    }

    fn events(&self) -> broadcast::Receiver<BusEvent> {
        self.state.events.subscribe()
    }

    fn presence_changes(&self) -> broadcast::Receiver<()> {
        self.state.presence_changes.subscribe()
    }
}
