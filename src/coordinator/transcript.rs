//! Rolling speech transcript and coverage matching.

/// Character budget of the rolling transcript window.
pub const TRANSCRIPT_WINDOW_CHARS: usize = 500;

/// Fraction of a slide's key phrases that must appear in the window before
/// the slide counts as covered.
pub const COVERAGE_THRESHOLD: f64 = 0.4;

/// Append-only rolling window over the most recent finalized speech,
/// truncated from the front past the character budget.
#[derive(Debug)]
pub struct TranscriptWindow {
    text: String,
    budget: usize,
}

impl TranscriptWindow {
    pub fn new(budget: usize) -> Self {
        Self {
            text: String::new(),
            budget,
        }
    }

    pub fn push(&mut self, fragment: &str) {
        let fragment = fragment.trim();
        if fragment.is_empty() {
            return;
        }

        if !self.text.is_empty() {
            self.text.push(' ');
        }
        self.text.push_str(fragment);

        let count = self.text.chars().count();
        if count > self.budget {
            // Truncate on a char boundary, never mid-codepoint
            let skip = count - self.budget;
            if let Some((idx, _)) = self.text.char_indices().nth(skip) {
                self.text.drain(..idx);
            }
            self.text = self.text.trim_start().to_string();
        }
    }

    pub fn contents(&self) -> &str {
        &self.text
    }
}

impl Default for TranscriptWindow {
    fn default() -> Self {
        Self::new(TRANSCRIPT_WINDOW_CHARS)
    }
}

/// Fraction of `key_phrases` present in `transcript`, case-insensitive
/// substring match. Empty phrase lists never match.
pub fn coverage_fraction(transcript: &str, key_phrases: &[String]) -> f64 {
    if key_phrases.is_empty() {
        return 0.0;
    }

    let haystack = transcript.to_lowercase();
    let matched = key_phrases
        .iter()
        .filter(|phrase| haystack.contains(&phrase.to_lowercase()))
        .count();

    matched as f64 / key_phrases.len() as f64
}
