//! Per-slide question bank.

use serde::{Deserialize, Serialize};

use crate::bus::Question;

/// Questions and coverage key phrases for one slide. Generated once per
/// session and immutable afterwards; dispatch state is tracked separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlideQuestionBank {
    pub slide_index: usize,
    pub slide_title: String,
    /// Lowercase-normalized phrases matched against the speech transcript
    #[serde(default)]
    pub key_phrases: Vec<String>,
    #[serde(default)]
    pub questions: Vec<Question>,
}

/// Dedup key for one question within the bank.
pub(crate) fn dispatch_key(slide_index: usize, question_index: usize) -> String {
    format!("{slide_index}-{question_index}")
}
