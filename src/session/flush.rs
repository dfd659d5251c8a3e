//! Flush policy for streaming synthesis
//!
//! Generated tokens are accumulated and handed to the synthesizer in
//! fragments. A fragment is flushed when it ends a sentence, when it ends a
//! clause and is already long, or when it is simply too long.

use std::sync::LazyLock;

use regex::Regex;

/// Clause-ending fragments flush once longer than this many characters
pub const CLAUSE_FLUSH_CHARS: usize = 80;

/// Fragments flush unconditionally once longer than this many characters
pub const HARD_FLUSH_CHARS: usize = 100;

static SENTENCE_END: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.!?]\s*$").expect("valid regex"));

static CLAUSE_END: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[,;]\s*$").expect("valid regex"));

/// Whether accumulated text should be sent to synthesis now
#[must_use]
pub fn should_flush(text: &str) -> bool {
    if SENTENCE_END.is_match(text) {
        return true;
    }

    let chars = text.chars().count();
    (chars > CLAUSE_FLUSH_CHARS && CLAUSE_END.is_match(text)) || chars > HARD_FLUSH_CHARS
}

/// Accumulates tokens between flushes
#[derive(Debug, Default)]
pub struct FlushBuffer {
    pending: String,
}

impl FlushBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a token; returns the fragment to synthesize if the policy fires
    pub fn push(&mut self, token: &str) -> Option<String> {
        self.pending.push_str(token);
        if should_flush(&self.pending) {
            Some(std::mem::take(&mut self.pending))
        } else {
            None
        }
    }

    /// Take whatever is left at end of stream, skipping whitespace-only text
    pub fn take_remainder(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        if rest.trim().is_empty() {
            None
        } else {
            Some(rest)
        }
    }

    /// Text waiting to be flushed
    #[must_use]
    pub fn pending(&self) -> &str {
        &self.pending
    }
}
