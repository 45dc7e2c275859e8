//! Wire protocol for room topics.
//!
//! Every broadcast on a room topic is one of the [`BusEvent`] variants below,
//! serialized with an `event` tag and a `payload` body. Payload shapes are
//! validated on receipt by serde; malformed events are dropped at the bus
//! boundary instead of trusted downstream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Presenter,
    Viewer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackPhase {
    Idle,
    Question,
    Feedback,
}

/// Canonical presentation state. Written only by the presenter; viewers hold
/// a read-only mirror replaced wholesale on every `state_sync` broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomState {
    pub lesson_idx: usize,
    pub section_idx: usize,
    pub active_question_idx: Option<usize>,
    pub buddy_enabled: bool,
    pub difficulty: Difficulty,
    pub feedback_phase: FeedbackPhase,
}

impl Default for RoomState {
    fn default() -> Self {
        Self {
            lesson_idx: 0,
            section_idx: 0,
            active_question_idx: None,
            buddy_enabled: true,
            difficulty: Difficulty::Easy,
            feedback_phase: FeedbackPhase::Idle,
        }
    }
}

/// Presence entry for one connected peer. A peer writes only its own entry;
/// everyone else observes snapshots via the presence registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: String,
    pub name: String,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
    #[serde(default)]
    pub hand_raised: bool,
}

/// Addressed SDP exchange. Consumers filter on `to == local_peer_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdpSignal {
    pub from: String,
    pub to: String,
    pub sdp: RTCSessionDescription,
}

/// Addressed trickle ICE candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceSignal {
    pub from: String,
    pub to: String,
    pub candidate: RTCIceCandidateInit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuestionKind {
    Choice,
    Text,
}

/// A single generated quiz question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub highlight: String,
    pub question: String,
    #[serde(rename = "type")]
    pub kind: QuestionKind,
    /// Up to 2 options for choice questions, empty for free-text
    #[serde(default)]
    pub options: Vec<String>,
    pub answer: String,
    pub reinforcement: String,
    pub correction: String,
    pub difficulty: Difficulty,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
}

/// Coordinator -> students: one question pushed to every viewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionDispatch {
    pub slide_index: usize,
    pub question: Question,
    pub dispatched_at: DateTime<Utc>,
}

/// Coordinator -> students: session context for (re)joining viewers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInit {
    pub lesson_title: String,
    pub current_slide_index: usize,
    pub difficulty: Difficulty,
}

/// Student -> coordinator: one submitted answer with response latency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentResponse {
    pub student_id: String,
    pub student_name: String,
    pub slide_index: usize,
    pub question_text: String,
    pub answer: String,
    pub correct: bool,
    pub response_time_ms: u64,
    pub answered_at: DateTime<Utc>,
}

/// Tagged union of every event that travels over a room topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum BusEvent {
    StateSync(RoomState),
    WebrtcOffer(SdpSignal),
    WebrtcAnswer(SdpSignal),
    WebrtcIce(IceSignal),
    BuddyQuestion(QuestionDispatch),
    BuddyAgentInit(AgentInit),
    BuddyResponse(StudentResponse),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_tag_names_match_wire_protocol() {
        let event = BusEvent::StateSync(RoomState::default());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "state_sync");

        let event = BusEvent::BuddyAgentInit(AgentInit {
            lesson_title: "Photosynthesis".to_string(),
            current_slide_index: 2,
            difficulty: Difficulty::Medium,
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "buddy_agent_init");
        assert_eq!(json["payload"]["lessonTitle"], "Photosynthesis");
        assert_eq!(json["payload"]["currentSlideIndex"], 2);
    }

    #[test]
    fn test_room_state_round_trip_uses_camel_case() {
        let state = RoomState {
            lesson_idx: 1,
            section_idx: 3,
            active_question_idx: Some(0),
            buddy_enabled: false,
            difficulty: Difficulty::Hard,
            feedback_phase: FeedbackPhase::Question,
        };

        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["sectionIdx"], 3);
        assert_eq!(json["feedbackPhase"], "question");

        let back: RoomState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_participant_hand_raised_defaults_false() {
        let json = serde_json::json!({
            "id": "p1",
            "name": "Ada",
            "role": "viewer",
            "joinedAt": "2024-05-01T12:00:00Z"
        });

        let p: Participant = serde_json::from_value(json).unwrap();
        assert!(!p.hand_raised);
        assert_eq!(p.role, Role::Viewer);
    }

    #[test]
    fn test_question_type_field_name() {
        let q = Question {
            highlight: "chlorophyll".to_string(),
            question: "What pigment absorbs light?".to_string(),
            kind: QuestionKind::Choice,
            options: vec!["Chlorophyll".to_string(), "Keratin".to_string()],
            answer: "Chlorophyll".to_string(),
            reinforcement: "Right, it absorbs red and blue light.".to_string(),
            correction: "Keratin is a structural protein.".to_string(),
            difficulty: Difficulty::Easy,
            topic: Some("Pigments".to_string()),
        };

        let json = serde_json::to_value(&q).unwrap();
        assert_eq!(json["type"], "choice");
        assert_eq!(json["options"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_malformed_payload_rejected() {
        let json = serde_json::json!({
            "event": "buddy_response",
            "payload": { "studentId": "s1" }
        });

        assert!(serde_json::from_value::<BusEvent>(json).is_err());
    }
}
