// End-to-end session flow over the in-memory bus: presenter with a
// coordinator agent, students with buddy agents, question dispatch driven by
// speech coverage, and engagement aggregation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::sleep;

use classmesh::ai::{ChatProvider, ChatRequest, PreGenerateRequest, QuestionGenerator, SlideInput};
use classmesh::bus::{Difficulty, InMemoryBus, Question, QuestionKind, Role, RoomState};
use classmesh::coordinator::{Coordinator, SessionInfo, SlideQuestionBank};
use classmesh::error::Result;
use classmesh::persist::{EngagementRow, EngagementSink};
use classmesh::room::RoomSession;
use classmesh::student::StudentAgent;

struct StubGenerator {
    bank: Vec<SlideQuestionBank>,
    calls: AtomicU64,
}

#[async_trait]
impl QuestionGenerator for StubGenerator {
    async fn pre_generate(&self, _request: &PreGenerateRequest) -> Result<Vec<SlideQuestionBank>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.bank.clone())
    }
}

#[async_trait]
impl ChatProvider for StubGenerator {
    async fn chat(&self, request: &ChatRequest) -> Result<String> {
        Ok(format!("Here's a hint about {}", request.slide_title))
    }
}

/// Records every flush; the latest row per student wins, like the real
/// upsert-keyed table.
#[derive(Default)]
struct MemorySink {
    rows: Mutex<HashMap<String, EngagementRow>>,
}

#[async_trait]
impl EngagementSink for MemorySink {
    async fn upsert(&self, rows: &[EngagementRow]) -> Result<()> {
        let mut stored = self.rows.lock().await;
        for row in rows {
            stored.insert(row.student_id.clone(), row.clone());
        }
        Ok(())
    }
}

fn question(text: &str, answer: &str) -> Question {
    Question {
        highlight: "key term".to_string(),
        question: text.to_string(),
        kind: QuestionKind::Choice,
        options: vec![answer.to_string(), "Wrong".to_string()],
        answer: answer.to_string(),
        reinforcement: "Nice!".to_string(),
        correction: "Not quite.".to_string(),
        difficulty: Difficulty::Easy,
        topic: None,
    }
}

fn lesson_bank() -> Vec<SlideQuestionBank> {
    vec![
        SlideQuestionBank {
            slide_index: 0,
            slide_title: "Photosynthesis".to_string(),
            key_phrases: vec![
                "chlorophyll".to_string(),
                "sunlight".to_string(),
                "glucose".to_string(),
            ],
            questions: vec![
                question("What pigment absorbs light?", "Chlorophyll"),
                question("What sugar is produced?", "Glucose"),
            ],
        },
        SlideQuestionBank {
            slide_index: 1,
            slide_title: "Respiration".to_string(),
            key_phrases: vec!["mitochondria".to_string(), "oxygen".to_string()],
            questions: vec![question("Where does respiration happen?", "Mitochondria")],
        },
        SlideQuestionBank {
            slide_index: 2,
            slide_title: "Recap".to_string(),
            key_phrases: vec![],
            questions: vec![question("Ready for the quiz?", "Yes")],
        },
    ]
}

fn slides() -> Vec<SlideInput> {
    lesson_bank()
        .into_iter()
        .map(|entry| SlideInput {
            index: entry.slide_index,
            title: entry.slide_title,
            content: "slide body".to_string(),
        })
        .collect()
}

async fn settle() {
    sleep(Duration::from_millis(80)).await;
}

/// A presenter's speech covering 2 of 3 key phrases marks the slide covered
/// and pushes both of its questions to every student exactly once, in order.
#[tokio::test]
async fn test_speech_coverage_dispatches_to_students() {
    let bus = InMemoryBus::new();
    let presenter = RoomSession::connect(&*bus, "777001", Role::Presenter, "Ms. Finch")
        .await
        .unwrap();
    let viewer = RoomSession::connect(&*bus, "777001", Role::Viewer, "Ada")
        .await
        .unwrap();

    let generator = Arc::new(StubGenerator {
        bank: lesson_bank(),
        calls: AtomicU64::new(0),
    });
    let coordinator = Coordinator::new(
        presenter.topic_handle(),
        generator.clone(),
        None,
        SessionInfo {
            session_id: None,
            lesson_title: "Plant biology".to_string(),
            difficulty: Difficulty::Easy,
        },
        Duration::from_secs(30),
    );
    let student = StudentAgent::new(
        viewer.topic_handle(),
        generator.clone(),
        viewer.local_peer_id(),
        "Ada",
    );
    student.start().await;

    coordinator.start().await;
    coordinator.generate_bank(&slides()).await.unwrap();
    settle().await;

    // Students picked up the broadcast session context
    let context = student.session_context().await.unwrap();
    assert_eq!(context.lesson_title, "Plant biology");

    // One phrase of three: nothing happens
    coordinator.append_speech("plants use chlorophyll to capture light").await;
    settle().await;
    assert!(student.active_question().await.is_none());

    // Second phrase: slide 0 crosses the 40% threshold
    coordinator.append_speech("turning sunlight into energy").await;
    settle().await;

    assert!(coordinator.covered_slides().await.contains(&0));
    assert_eq!(coordinator.dispatch_count(), 2);

    let active = student.active_question().await.unwrap();
    assert_eq!(active.question.question, "What pigment absorbs light?");
    assert_eq!(student.queued_count().await, 1);

    // Re-covering speech must not dispatch again
    coordinator.append_speech("chlorophyll sunlight glucose").await;
    settle().await;
    assert_eq!(coordinator.dispatch_count(), 2);
    assert_eq!(student.queued_count().await, 1);

    coordinator.stop().await;
    student.stop().await;
    presenter.disconnect().await;
    viewer.disconnect().await;
}

/// Answers flow back to the coordinator and are aggregated per student into
/// engagement rows flushed to the sink.
#[tokio::test]
async fn test_student_answers_aggregate_to_engagement_rows() {
    let bus = InMemoryBus::new();
    let presenter = RoomSession::connect(&*bus, "777002", Role::Presenter, "Ms. Finch")
        .await
        .unwrap();
    let viewer = RoomSession::connect(&*bus, "777002", Role::Viewer, "Ada")
        .await
        .unwrap();

    let generator = Arc::new(StubGenerator {
        bank: lesson_bank(),
        calls: AtomicU64::new(0),
    });
    let sink = Arc::new(MemorySink::default());
    let coordinator = Coordinator::new(
        presenter.topic_handle(),
        generator.clone(),
        Some(sink.clone()),
        SessionInfo {
            session_id: Some("sess-42".to_string()),
            lesson_title: "Plant biology".to_string(),
            difficulty: Difficulty::Easy,
        },
        Duration::from_millis(100),
    );
    coordinator.start().await;
    coordinator.generate_bank(&slides()).await.unwrap();

    let student = StudentAgent::new(
        viewer.topic_handle(),
        generator,
        viewer.local_peer_id(),
        "Ada",
    );
    student.start().await;
    settle().await;

    coordinator.dispatch_single(1, 0).await;
    settle().await;

    // The feedback layer grades the answer and the agent reports it as-is
    assert_eq!(student.check_answer("mitochondria").await, Some(true));
    assert!(student.answer_question(true, "mitochondria").await);
    student.dismiss_question().await;
    assert!(student.active_question().await.is_none());

    // Wait past a flush interval for the aggregate to land in the sink
    sleep(Duration::from_millis(400)).await;

    let rows = sink.rows.lock().await;
    let row = rows.get(viewer.local_peer_id()).unwrap();
    assert_eq!(row.session_id, "sess-42");
    assert_eq!(row.questions_answered, 1);
    assert_eq!(row.correct_answers, 1);

    coordinator.stop().await;
    student.stop().await;
    presenter.disconnect().await;
    viewer.disconnect().await;
}

/// A student joining after dispatch receives the session context broadcast
/// but not previously dispatched questions.
#[tokio::test]
async fn test_late_joiner_gets_context_not_history() {
    let bus = InMemoryBus::new();
    let presenter = RoomSession::connect(&*bus, "777003", Role::Presenter, "Ms. Finch")
        .await
        .unwrap();

    let generator = Arc::new(StubGenerator {
        bank: lesson_bank(),
        calls: AtomicU64::new(0),
    });
    let coordinator = Coordinator::new(
        presenter.topic_handle(),
        generator.clone(),
        None,
        SessionInfo {
            session_id: None,
            lesson_title: "Plant biology".to_string(),
            difficulty: Difficulty::Medium,
        },
        Duration::from_secs(30),
    );
    coordinator.start().await;
    coordinator.generate_bank(&slides()).await.unwrap();
    coordinator.dispatch_for_slide(0).await;
    settle().await;

    // Student joins after the slide-0 questions already went out
    let viewer = RoomSession::connect(&*bus, "777003", Role::Viewer, "Ben")
        .await
        .unwrap();
    let student = StudentAgent::new(
        viewer.topic_handle(),
        generator,
        viewer.local_peer_id(),
        "Ben",
    );
    student.start().await;

    coordinator.set_current_slide(1).await;
    settle().await;

    let context = student.session_context().await.unwrap();
    assert_eq!(context.current_slide_index, 1);
    assert_eq!(context.difficulty, Difficulty::Medium);
    assert!(student.active_question().await.is_none());

    coordinator.stop().await;
    student.stop().await;
    presenter.disconnect().await;
    viewer.disconnect().await;
}

/// Presenter state broadcasts and presence keep working alongside the agent
/// traffic on the same topic.
#[tokio::test]
async fn test_room_state_and_agents_share_one_topic() {
    let bus = InMemoryBus::new();
    let presenter = RoomSession::connect(&*bus, "777004", Role::Presenter, "Ms. Finch")
        .await
        .unwrap();
    let viewer = RoomSession::connect(&*bus, "777004", Role::Viewer, "Ada")
        .await
        .unwrap();

    let generator = Arc::new(StubGenerator {
        bank: lesson_bank(),
        calls: AtomicU64::new(0),
    });
    let coordinator = Coordinator::new(
        presenter.topic_handle(),
        generator.clone(),
        None,
        SessionInfo {
            session_id: None,
            lesson_title: "Plant biology".to_string(),
            difficulty: Difficulty::Easy,
        },
        Duration::from_secs(30),
    );
    coordinator.start().await;
    coordinator.generate_bank(&slides()).await.unwrap();

    let student = StudentAgent::new(
        viewer.topic_handle(),
        generator,
        viewer.local_peer_id(),
        "Ada",
    );
    student.start().await;
    settle().await;

    let mut state = RoomState::default();
    state.section_idx = 2;
    presenter.broadcast(state.clone()).await.unwrap();

    coordinator.append_speech("mitochondria need oxygen").await;
    settle().await;

    // State mirror updated and slide 1 dispatched, neither interfering
    assert_eq!(viewer.state().await, state);
    assert!(coordinator.covered_slides().await.contains(&1));
    assert_eq!(
        student.active_question().await.unwrap().question.question,
        "Where does respiration happen?"
    );
    assert_eq!(presenter.participants().await.len(), 2);

    coordinator.stop().await;
    student.stop().await;
    presenter.disconnect().await;
    viewer.disconnect().await;
}

/// Slides whose key-phrase list is empty are never auto-covered; their
/// questions go out only on manual dispatch.
#[tokio::test]
async fn test_empty_phrase_slide_requires_manual_dispatch() {
    let bus = InMemoryBus::new();
    let presenter = RoomSession::connect(&*bus, "777005", Role::Presenter, "Ms. Finch")
        .await
        .unwrap();

    let generator = Arc::new(StubGenerator {
        bank: lesson_bank(),
        calls: AtomicU64::new(0),
    });
    let coordinator = Coordinator::new(
        presenter.topic_handle(),
        generator,
        None,
        SessionInfo {
            session_id: None,
            lesson_title: "Plant biology".to_string(),
            difficulty: Difficulty::Easy,
        },
        Duration::from_secs(30),
    );
    coordinator.start().await;
    coordinator.generate_bank(&slides()).await.unwrap();

    coordinator
        .append_speech("chlorophyll sunlight glucose mitochondria oxygen quiz ready")
        .await;

    // Slides 0 and 1 covered by speech; slide 2 has no phrases
    let covered = coordinator.covered_slides().await;
    assert!(covered.contains(&0));
    assert!(covered.contains(&1));
    assert!(!covered.contains(&2));
    assert_eq!(coordinator.dispatch_count(), 3);

    coordinator.dispatch_for_slide(2).await;
    assert_eq!(coordinator.dispatch_count(), 4);
    assert!(coordinator.is_dispatched(2, 0).await);

    coordinator.stop().await;
    presenter.disconnect().await;
}
