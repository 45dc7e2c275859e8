//! Presenter-side coordinator agent.
//!
//! Orchestrates question-bank generation, live speech coverage matching,
//! question dispatch, and response aggregation. Slide coverage is a one-way
//! transition, and dispatch is deduplicated per `(slide, question)` pair, so
//! automatic coverage triggers and manual teacher triggers can never
//! double-send the same question.

pub mod bank;
pub mod speech;
mod transcript;

pub use bank::SlideQuestionBank;
pub use speech::{SpeechEngine, SpeechEvent, BENIGN_NO_SPEECH};
pub use transcript::{coverage_fraction, TranscriptWindow, COVERAGE_THRESHOLD, TRANSCRIPT_WINDOW_CHARS};

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast::error::RecvError, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::ai::{PreGenerateRequest, QuestionGenerator, SlideInput};
use crate::bus::{AgentInit, BusEvent, Difficulty, QuestionDispatch, StudentResponse, TopicHandle};
use crate::error::Result;
use crate::persist::{EngagementRow, EngagementSink};
use bank::dispatch_key;

/// Identity of the running presentation session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Durable session row id; engagement is only persisted when present
    pub session_id: Option<String>,
    pub lesson_title: String,
    pub difficulty: Difficulty,
}

pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct CoordinatorInner {
    topic: TopicHandle,
    generator: Arc<dyn QuestionGenerator>,
    sink: Option<Arc<dyn EngagementSink>>,
    session: SessionInfo,
    flush_interval: Duration,
    bank: RwLock<Option<Vec<SlideQuestionBank>>>,
    generating: AtomicBool,
    generate_error: RwLock<Option<String>>,
    transcript: Mutex<TranscriptWindow>,
    display: RwLock<String>,
    covered: Mutex<HashSet<usize>>,
    dispatched: Mutex<HashSet<String>>,
    dispatch_count: AtomicU64,
    responses: Mutex<Vec<StudentResponse>>,
    current_slide: AtomicUsize,
    enabled: AtomicBool,
    listening: AtomicBool,
    engine: Mutex<Option<Arc<dyn SpeechEngine>>>,
}

impl Coordinator {
    pub fn new(
        topic: TopicHandle,
        generator: Arc<dyn QuestionGenerator>,
        sink: Option<Arc<dyn EngagementSink>>,
        session: SessionInfo,
        flush_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                topic,
                generator,
                sink,
                session,
                flush_interval,
                bank: RwLock::new(None),
                generating: AtomicBool::new(false),
                generate_error: RwLock::new(None),
                transcript: Mutex::new(TranscriptWindow::default()),
                display: RwLock::new(String::new()),
                covered: Mutex::new(HashSet::new()),
                dispatched: Mutex::new(HashSet::new()),
                dispatch_count: AtomicU64::new(0),
                responses: Mutex::new(Vec::new()),
                current_slide: AtomicUsize::new(0),
                enabled: AtomicBool::new(true),
                listening: AtomicBool::new(false),
                engine: Mutex::new(None),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Begin collecting student responses and flushing aggregates, and
    /// announce the session context to connected students.
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;

        // Response collection
        {
            let inner = self.inner.clone();
            let mut events = inner.topic.events();
            tasks.push(tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(BusEvent::BuddyResponse(response)) => {
                            tracing::debug!(
                                student = %response.student_name,
                                correct = response.correct,
                                "Student response received"
                            );
                            inner.responses.lock().await.push(response);
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Coordinator lagged behind topic");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }));
        }

        // Periodic engagement flush; every run recomputes and upserts the
        // full aggregate so repeated flushes overwrite, never duplicate.
        if let (Some(sink), Some(session_id)) =
            (self.inner.sink.clone(), self.inner.session.session_id.clone())
        {
            let inner = self.inner.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(inner.flush_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                ticker.tick().await; // immediate first tick
                loop {
                    ticker.tick().await;
                    let rows = {
                        let responses = inner.responses.lock().await;
                        aggregate_responses(&session_id, &responses)
                    };
                    if rows.is_empty() {
                        continue;
                    }
                    if let Err(err) = sink.upsert(&rows).await {
                        tracing::warn!(error = %err, "Engagement flush failed");
                    }
                }
            }));
        }

        drop(tasks);
        self.broadcast_init().await;
    }

    /// Generate the question bank from the slide set. Runs at most once: a
    /// second call while a bank exists (or generation is in flight) is a
    /// no-op. Failure retains an error string for display and is also
    /// returned.
    pub async fn generate_bank(&self, slides: &[SlideInput]) -> Result<()> {
        if slides.is_empty() || self.inner.bank.read().await.is_some() {
            return Ok(());
        }
        if self.inner.generating.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // The generator chokes on empty slide bodies; substitute the title
        let slides = slides
            .iter()
            .map(|slide| SlideInput {
                index: slide.index,
                title: slide.title.clone(),
                content: if slide.content.trim().is_empty() {
                    format!("Slide about: {}", slide.title)
                } else {
                    slide.content.clone()
                },
            })
            .collect();

        let request = PreGenerateRequest {
            slides,
            difficulty: self.inner.session.difficulty,
            lesson_title: self.inner.session.lesson_title.clone(),
        };

        let result = self.inner.generator.pre_generate(&request).await;
        self.inner.generating.store(false, Ordering::SeqCst);

        match result {
            Ok(bank) => {
                tracing::info!(slides = bank.len(), "Question bank ready");
                *self.inner.bank.write().await = Some(bank);
                *self.inner.generate_error.write().await = None;
                Ok(())
            }
            Err(err) => {
                tracing::error!(error = %err, "Question bank generation failed");
                *self.inner.generate_error.write().await = Some(err.to_string());
                Err(err)
            }
        }
    }

    /// Append a finalized speech fragment to the rolling window and run a
    /// coverage pass over every not-yet-covered slide.
    pub async fn append_speech(&self, text: &str) {
        let snapshot = {
            let mut transcript = self.inner.transcript.lock().await;
            transcript.push(text);
            transcript.contents().to_string()
        };
        *self.inner.display.write().await = snapshot.clone();

        self.inner.coverage_pass(&snapshot).await;
    }

    /// Update the display transcript with an interim fragment. Interim text
    /// never participates in coverage matching.
    pub async fn set_interim(&self, text: &str) {
        let stable = self.inner.transcript.lock().await.contents().to_string();
        let display = format!("{stable} {text}").trim().to_string();
        *self.inner.display.write().await = display;
    }

    /// Run the speech capture loop on the given engine, restarting it each
    /// time it ends for as long as the coordinator is enabled.
    pub async fn run_speech(&self, engine: Arc<dyn SpeechEngine>) {
        *self.inner.engine.lock().await = Some(engine.clone());

        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            while inner.enabled.load(Ordering::SeqCst) {
                let mut events = match engine.start().await {
                    Ok(events) => events,
                    Err(err) => {
                        tracing::warn!(error = %err, "Speech engine failed to start");
                        break;
                    }
                };
                inner.listening.store(true, Ordering::SeqCst);
                tracing::info!("Speech recognition started");

                while let Some(event) = events.recv().await {
                    match event {
                        SpeechEvent::Final(text) => {
                            let snapshot = {
                                let mut transcript = inner.transcript.lock().await;
                                transcript.push(&text);
                                transcript.contents().to_string()
                            };
                            *inner.display.write().await = snapshot.clone();
                            inner.coverage_pass(&snapshot).await;
                        }
                        SpeechEvent::Interim(text) => {
                            let stable = inner.transcript.lock().await.contents().to_string();
                            *inner.display.write().await =
                                format!("{stable} {text}").trim().to_string();
                        }
                        SpeechEvent::Error(code) if code == BENIGN_NO_SPEECH => {}
                        SpeechEvent::Error(code) => {
                            tracing::warn!(code = %code, "Speech recognition error");
                        }
                        SpeechEvent::Ended => break,
                    }
                }
                inner.listening.store(false, Ordering::SeqCst);
            }
        });

        self.tasks.lock().await.push(task);
    }

    /// Dispatch every undispatched question for the given slide.
    pub async fn dispatch_for_slide(&self, slide_index: usize) {
        let entry = {
            let bank = self.inner.bank.read().await;
            bank.as_ref()
                .and_then(|b| b.iter().find(|s| s.slide_index == slide_index).cloned())
        };
        if let Some(entry) = entry {
            self.inner.dispatch_slide_questions(&entry).await;
        }
    }

    /// Dispatch every remaining question across all slides.
    pub async fn dispatch_all(&self) {
        let entries = match self.inner.bank.read().await.clone() {
            Some(entries) => entries,
            None => return,
        };
        for entry in &entries {
            self.inner.dispatch_slide_questions(entry).await;
        }
    }

    /// Dispatch one question by slide and question index.
    pub async fn dispatch_single(&self, slide_index: usize, question_index: usize) {
        let question = {
            let bank = self.inner.bank.read().await;
            bank.as_ref()
                .and_then(|b| b.iter().find(|s| s.slide_index == slide_index))
                .and_then(|s| s.questions.get(question_index).cloned())
        };
        let Some(question) = question else { return };

        if !self.inner.mark_dispatched(slide_index, question_index).await {
            return;
        }
        self.inner.publish_question(slide_index, question).await;
    }

    pub async fn is_dispatched(&self, slide_index: usize, question_index: usize) -> bool {
        self.inner
            .dispatched
            .lock()
            .await
            .contains(&dispatch_key(slide_index, question_index))
    }

    /// Announce lesson title, slide index, and difficulty so connected and
    /// late-joining students can refresh their session context. Questions
    /// dispatched before a student joined are not replayed; late joiners
    /// only get the context, a known gap of the one-shot broadcast design.
    pub async fn broadcast_init(&self) {
        let init = AgentInit {
            lesson_title: self.inner.session.lesson_title.clone(),
            current_slide_index: self.inner.current_slide.load(Ordering::SeqCst),
            difficulty: self.inner.session.difficulty,
        };
        if let Err(err) = self.inner.topic.publish(BusEvent::BuddyAgentInit(init)).await {
            tracing::warn!(error = %err, "Failed to broadcast agent init");
        }
    }

    /// Track the presenter's slide navigation; re-announces the context.
    pub async fn set_current_slide(&self, slide_index: usize) {
        self.inner.current_slide.store(slide_index, Ordering::SeqCst);
        self.broadcast_init().await;
    }

    /// Disable the agent, stop the speech engine, and cancel background
    /// tasks. Idempotent.
    pub async fn stop(&self) {
        self.inner.enabled.store(false, Ordering::SeqCst);
        if let Some(engine) = self.inner.engine.lock().await.take() {
            engine.stop().await;
        }
        self.inner.listening.store(false, Ordering::SeqCst);
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
    }

    pub async fn question_bank(&self) -> Option<Vec<SlideQuestionBank>> {
        self.inner.bank.read().await.clone()
    }

    pub async fn generate_error(&self) -> Option<String> {
        self.inner.generate_error.read().await.clone()
    }

    pub async fn covered_slides(&self) -> HashSet<usize> {
        self.inner.covered.lock().await.clone()
    }

    pub async fn transcript_display(&self) -> String {
        self.inner.display.read().await.clone()
    }

    pub async fn responses(&self) -> Vec<StudentResponse> {
        self.inner.responses.lock().await.clone()
    }

    pub fn dispatch_count(&self) -> u64 {
        self.inner.dispatch_count.load(Ordering::SeqCst)
    }

    pub fn is_listening(&self) -> bool {
        self.inner.listening.load(Ordering::SeqCst)
    }
}

impl CoordinatorInner {
    /// Coverage check over every slide not yet covered. Covering is
    /// monotonic: once a slide is in the set, no later transcript content
    /// can remove it, and its check is skipped entirely.
    async fn coverage_pass(&self, transcript: &str) {
        let entries = match self.bank.read().await.clone() {
            Some(entries) => entries,
            None => return,
        };

        for entry in &entries {
            {
                let covered = self.covered.lock().await;
                if covered.contains(&entry.slide_index) {
                    continue;
                }
            }
            if entry.key_phrases.is_empty() {
                continue;
            }

            let coverage = coverage_fraction(transcript, &entry.key_phrases);
            if coverage >= COVERAGE_THRESHOLD {
                tracing::info!(
                    slide = entry.slide_index,
                    coverage = format!("{:.0}%", coverage * 100.0),
                    "Slide covered"
                );
                self.covered.lock().await.insert(entry.slide_index);
                self.dispatch_slide_questions(entry).await;
            }
        }
    }

    async fn dispatch_slide_questions(&self, entry: &SlideQuestionBank) {
        for (question_index, question) in entry.questions.iter().enumerate() {
            if !self.mark_dispatched(entry.slide_index, question_index).await {
                continue;
            }
            self.publish_question(entry.slide_index, question.clone()).await;
        }
    }

    /// Returns true exactly once per `(slide, question)` pair.
    async fn mark_dispatched(&self, slide_index: usize, question_index: usize) -> bool {
        self.dispatched
            .lock()
            .await
            .insert(dispatch_key(slide_index, question_index))
    }

    async fn publish_question(&self, slide_index: usize, question: crate::bus::Question) {
        let text = question.question.clone();
        let event = QuestionDispatch {
            slide_index,
            question,
            dispatched_at: Utc::now(),
        };

        match self.topic.publish(BusEvent::BuddyQuestion(event)).await {
            Ok(()) => {
                self.dispatch_count.fetch_add(1, Ordering::SeqCst);
                tracing::info!(slide = slide_index, question = %text, "Dispatched question");
            }
            Err(err) => {
                tracing::warn!(error = %err, "Failed to dispatch question");
            }
        }
    }
}

/// Group responses by student and compute the aggregate row per student.
pub(crate) fn aggregate_responses(
    session_id: &str,
    responses: &[StudentResponse],
) -> Vec<EngagementRow> {
    let mut by_student: HashMap<&str, Vec<&StudentResponse>> = HashMap::new();
    for response in responses {
        by_student
            .entry(response.student_id.as_str())
            .or_default()
            .push(response);
    }

    let mut rows: Vec<EngagementRow> = by_student
        .into_iter()
        .map(|(student_id, entries)| {
            let answered = entries.len() as u64;
            let correct = entries.iter().filter(|r| r.correct).count() as u64;
            let total_ms: u64 = entries.iter().map(|r| r.response_time_ms).sum();
            EngagementRow {
                session_id: session_id.to_string(),
                student_id: student_id.to_string(),
                questions_answered: answered,
                correct_answers: correct,
                avg_response_time_ms: (total_ms as f64 / answered as f64).round() as u64,
                buddy_interactions: answered,
            }
        })
        .collect();

    rows.sort_by(|a, b| a.student_id.cmp(&b.student_id));
    rows
}
