use thiserror::Error;

/// Error types for the coordination layer
#[derive(Debug, Error)]
pub enum MeshError {
    /// Bus transport errors
    #[error("Failed to subscribe to topic {0}")]
    SubscribeFailed(String),

    #[error("Failed to publish on topic {0}: {1}")]
    PublishFailed(String, String),

    #[error("Topic {0} is closed")]
    TopicClosed(String),

    #[error("Not connected to room")]
    NotConnected,

    /// WebRTC API errors
    #[error("WebRTC API error: {0}")]
    WebRtcApi(String),

    #[error("Failed to create peer connection: {0}")]
    PeerConnectionCreation(String),

    #[error("Failed to create offer: {0}")]
    CreateOfferFailed(String),

    #[error("Failed to create answer: {0}")]
    CreateAnswerFailed(String),

    #[error("Failed to set local description: {0}")]
    SetLocalDescriptionFailed(String),

    #[error("Failed to set remote description: {0}")]
    SetRemoteDescriptionFailed(String),

    #[error("Failed to add ICE candidate: {0}")]
    AddIceCandidateFailed(String),

    #[error("Failed to add track: {0}")]
    AddTrackFailed(String),

    #[error("No connection open to peer {0}")]
    LinkNotFound(String),

    /// Collaborator errors
    #[error("Agent request failed: {0}")]
    AgentRequestFailed(String),

    #[error("Agent response invalid: {0}")]
    AgentResponseInvalid(String),

    #[error("Speech engine error: {0}")]
    SpeechEngineFailed(String),

    #[error("Engagement upsert failed: {0}")]
    PersistFailed(String),

    /// Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Failed to serialize message: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Convenience type alias for Results using MeshError
pub type Result<T> = std::result::Result<T, MeshError>;

impl MeshError {
    /// Helper to create Internal errors with context
    pub fn internal(msg: impl Into<String>) -> Self {
        MeshError::Internal(msg.into())
    }

    /// Helper to create agent request errors
    pub fn agent(msg: impl Into<String>) -> Self {
        MeshError::AgentRequestFailed(msg.into())
    }
}

/// Convert webrtc::Error to MeshError
impl From<webrtc::Error> for MeshError {
    fn from(err: webrtc::Error) -> Self {
        MeshError::WebRtcApi(err.to_string())
    }
}
