//! Topic-scoped publish/subscribe with a presence registry.
//!
//! The hosted realtime service is modeled as a [`MessageBus`] trait so the
//! rest of the crate never talks to a concrete transport. [`InMemoryBus`]
//! backs tests and single-process sessions.
//!
//! Delivery order across distinct event types is not guaranteed; every
//! consumer in this crate tolerates reordering (dedup sets for dispatch,
//! stale-state checks for signaling, last-write-wins state mirrors).

pub mod events;
mod memory;

pub use events::{
    AgentInit, BusEvent, Difficulty, FeedbackPhase, IceSignal, Participant, Question,
    QuestionDispatch, QuestionKind, Role, RoomState, SdpSignal, StudentResponse,
};
pub use memory::InMemoryBus;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::Result;

/// Topic carrying room state, presence, signaling, and agent events.
pub fn room_topic(code: &str) -> String {
    format!("room:{code}")
}

/// Topic for ephemeral emoji reactions.
pub fn reactions_topic(code: &str) -> String {
    format!("reactions:{code}")
}

/// Topic for the room text chat.
pub fn chat_topic(code: &str) -> String {
    format!("chat:{code}")
}

/// A live subscription to one topic.
///
/// Publishing is fire-and-forget broadcast; the publisher's own event stream
/// receives the echo, so consumers of addressed events must filter on the
/// `to`/`from` fields rather than assume no self-delivery.
#[async_trait]
pub trait TopicChannel: Send + Sync {
    fn topic(&self) -> &str;

    /// Broadcast an event to every subscriber of this topic.
    async fn publish(&self, event: BusEvent) -> Result<()>;

    /// Register or replace this peer's presence entry, notifying the topic.
    async fn track(&self, meta: Participant) -> Result<()>;

    /// Remove this peer's presence entry, notifying the topic.
    async fn untrack(&self) -> Result<()>;

    /// Full snapshot of the topic's presence registry.
    async fn presence_snapshot(&self) -> Vec<Participant>;

    /// New receiver for broadcast events on this topic.
    fn events(&self) -> broadcast::Receiver<BusEvent>;

    /// New receiver notified on every presence membership change.
    fn presence_changes(&self) -> broadcast::Receiver<()>;
}

/// Handle to a topic subscription, shared between the room session, the mesh
/// manager, and the agents of one peer.
pub type TopicHandle = Arc<dyn TopicChannel>;

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Subscribe the given peer to a topic. Presence is not tracked until
    /// the caller invokes [`TopicChannel::track`].
    async fn subscribe(&self, topic: &str, local_peer_id: &str) -> Result<TopicHandle>;
}
