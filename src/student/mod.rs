//! Viewer-side study buddy agent.
//!
//! Receives dispatched questions over the room topic, surfaces them one at a
//! time (FIFO), reports answers back to the coordinator with response
//! latency, and relays free-form chat turns to the language model.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::{broadcast::error::RecvError, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::ai::{ChatProvider, ChatRequest, ChatRole, ChatTurn};
use crate::bus::{AgentInit, BusEvent, QuestionDispatch, StudentResponse, TopicHandle};

/// Shown in the chat pane when the model call fails; the student keeps a
/// working UI either way.
pub const CHAT_FALLBACK_REPLY: &str = "Sorry, I had trouble thinking. Try asking again!";

/// The question currently in front of the student, with its local arrival
/// time for latency measurement.
#[derive(Debug, Clone)]
pub struct ActiveQuestion {
    pub dispatch: QuestionDispatch,
    received_at: Instant,
}

impl ActiveQuestion {
    fn new(dispatch: QuestionDispatch) -> Self {
        Self {
            dispatch,
            received_at: Instant::now(),
        }
    }
}

pub struct StudentAgent {
    inner: Arc<StudentInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct StudentInner {
    topic: TopicHandle,
    provider: Arc<dyn ChatProvider>,
    student_id: String,
    student_name: String,
    active: Mutex<Option<ActiveQuestion>>,
    queue: Mutex<VecDeque<QuestionDispatch>>,
    session: RwLock<Option<AgentInit>>,
    history: Mutex<Vec<ChatTurn>>,
    enabled: AtomicBool,
}

impl StudentAgent {
    pub fn new(
        topic: TopicHandle,
        provider: Arc<dyn ChatProvider>,
        student_id: impl Into<String>,
        student_name: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(StudentInner {
                topic,
                provider,
                student_id: student_id.into(),
                student_name: student_name.into(),
                active: Mutex::new(None),
                queue: Mutex::new(VecDeque::new()),
                session: RwLock::new(None),
                history: Mutex::new(Vec::new()),
                enabled: AtomicBool::new(true),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Begin consuming dispatched questions and session context updates.
    pub async fn start(&self) {
        let inner = self.inner.clone();
        let mut events = inner.topic.events();
        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(BusEvent::BuddyQuestion(dispatch)) => {
                        if inner.enabled.load(Ordering::SeqCst) {
                            inner.receive_question(dispatch).await;
                        }
                    }
                    Ok(BusEvent::BuddyAgentInit(init)) => {
                        tracing::debug!(lesson = %init.lesson_title, "Session context updated");
                        *inner.session.write().await = Some(init);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Student agent lagged behind topic");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        self.tasks.lock().await.push(task);
    }

    /// Report the student's answer for the active question. Correctness is
    /// the caller's judgement; the feedback layer owns grading, which for
    /// free-text questions may accept paraphrases a literal comparison would
    /// reject ([`Self::check_answer`] offers that comparison for choice
    /// questions). The active question stays in place until dismissed, so
    /// the feedback phase can show reinforcement or correction text.
    /// Returns false when no question is active.
    pub async fn answer_question(&self, correct: bool, answer: &str) -> bool {
        let active = self.inner.active.lock().await;
        let Some(active) = active.as_ref() else {
            return false;
        };

        let question = &active.dispatch.question;
        let response = StudentResponse {
            student_id: self.inner.student_id.clone(),
            student_name: self.inner.student_name.clone(),
            slide_index: active.dispatch.slide_index,
            question_text: question.question.clone(),
            answer: answer.to_string(),
            correct,
            response_time_ms: active.received_at.elapsed().as_millis() as u64,
            answered_at: Utc::now(),
        };

        if let Err(err) = self.inner.topic.publish(BusEvent::BuddyResponse(response)).await {
            tracing::warn!(error = %err, "Failed to report answer");
        }
        true
    }

    /// Literal comparison of the given answer against the active question's
    /// canonical answer, ignoring case and surrounding whitespace. `None`
    /// when no question is active.
    pub async fn check_answer(&self, answer: &str) -> Option<bool> {
        let active = self.inner.active.lock().await;
        let active = active.as_ref()?;
        Some(
            answer
                .trim()
                .eq_ignore_ascii_case(active.dispatch.question.answer.trim()),
        )
    }

    /// Clear the active question and activate the next queued one, if any.
    pub async fn dismiss_question(&self) {
        let mut active = self.inner.active.lock().await;
        let next = self.inner.queue.lock().await.pop_front();
        *active = next.map(ActiveQuestion::new);
    }

    /// Send a free-form chat turn to the model, threading the running
    /// conversation and the current slide context. A failed model call
    /// returns the fallback reply instead of an error; both the question and
    /// the (possibly fallback) reply are kept in history.
    pub async fn send_chat_message(
        &self,
        message: &str,
        slide_title: &str,
        slide_content: &str,
    ) -> String {
        let lesson_title = self
            .inner
            .session
            .read()
            .await
            .as_ref()
            .map(|init| init.lesson_title.clone())
            .unwrap_or_default();

        let history = self.inner.history.lock().await.clone();
        let request = ChatRequest {
            message: message.to_string(),
            slide_content: slide_content.to_string(),
            slide_title: slide_title.to_string(),
            lesson_title,
            conversation_history: history,
        };

        let reply = match self.inner.provider.chat(&request).await {
            Ok(reply) => reply,
            Err(err) => {
                tracing::warn!(error = %err, "Chat request failed");
                CHAT_FALLBACK_REPLY.to_string()
            }
        };

        let mut history = self.inner.history.lock().await;
        history.push(ChatTurn {
            role: ChatRole::User,
            content: message.to_string(),
        });
        history.push(ChatTurn {
            role: ChatRole::Assistant,
            content: reply.clone(),
        });
        reply
    }

    /// Stop consuming questions and drop anything pending. Idempotent.
    pub async fn stop(&self) {
        self.inner.enabled.store(false, Ordering::SeqCst);
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.inner.active.lock().await.take();
        self.inner.queue.lock().await.clear();
    }

    pub async fn active_question(&self) -> Option<QuestionDispatch> {
        self.inner
            .active
            .lock()
            .await
            .as_ref()
            .map(|a| a.dispatch.clone())
    }

    pub async fn queued_count(&self) -> usize {
        self.inner.queue.lock().await.len()
    }

    pub async fn session_context(&self) -> Option<AgentInit> {
        self.inner.session.read().await.clone()
    }

    pub async fn chat_history(&self) -> Vec<ChatTurn> {
        self.inner.history.lock().await.clone()
    }
}

impl StudentInner {
    /// Activate immediately when idle, otherwise enqueue behind the current
    /// question. Arrival order is preserved.
    async fn receive_question(&self, dispatch: QuestionDispatch) {
        let mut active = self.active.lock().await;
        match active.as_ref() {
            None => {
                tracing::info!(
                    slide = dispatch.slide_index,
                    question = %dispatch.question.question,
                    "Question activated"
                );
                *active = Some(ActiveQuestion::new(dispatch));
            }
            Some(_) => {
                self.queue.lock().await.push_back(dispatch);
            }
        }
    }
}
