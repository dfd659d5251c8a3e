//! Utterance segmentation by silence timing
//!
//! Every inbound chunk pushes the silence deadline forward. When the deadline
//! passes with no new chunk, or the client signals the end explicitly, the
//! buffered audio becomes one utterance. There is only ever one deadline, so
//! a burst of chunks never stacks timers.

use std::time::Duration;

use tokio::time::Instant;

use super::buffer::{AudioBuffer, BufferStatus};

/// Silence after the last chunk that ends an utterance
pub const DEFAULT_SILENCE: Duration = Duration::from_millis(500);

/// Why an utterance was finalized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    /// Silence deadline elapsed
    Silence,
    /// Client sent `end_utterance`
    Explicit,
    /// Buffer reached its byte cap
    Overflow,
}

/// A finalized span of user audio
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    pub audio: Vec<u8>,
    pub boundary: Boundary,
}

/// Accumulates audio chunks and decides utterance boundaries
#[derive(Debug)]
pub struct UtteranceSegmenter {
    buffer: AudioBuffer,
    silence: Duration,
    deadline: Option<Instant>,
}

impl UtteranceSegmenter {
    /// Create a segmenter with the given silence delay and byte cap
    #[must_use]
    pub const fn new(silence: Duration, max_bytes: usize) -> Self {
        Self {
            buffer: AudioBuffer::new(max_bytes),
            silence,
            deadline: None,
        }
    }

    /// Append a chunk and restart the silence deadline
    ///
    /// Returns an utterance immediately if the chunk filled the buffer.
    pub fn push(&mut self, chunk: Vec<u8>) -> Option<Utterance> {
        if self.buffer.push(chunk) == BufferStatus::Full {
            tracing::warn!(
                bytes = self.buffer.len(),
                max_bytes = self.buffer.max_bytes(),
                "utterance buffer full, finalizing early"
            );
            return self.finalize(Boundary::Overflow);
        }

        self.deadline = Some(Instant::now() + self.silence);
        None
    }

    /// Finalize now, bypassing the silence deadline
    pub fn end_utterance(&mut self) -> Option<Utterance> {
        self.finalize(Boundary::Explicit)
    }

    /// Finalize after the silence deadline fired
    pub fn on_silence(&mut self) -> Option<Utterance> {
        self.finalize(Boundary::Silence)
    }

    /// Drop buffered audio and disarm the deadline
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.deadline = None;
    }

    /// Pending silence deadline, if any audio is buffered
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Bytes currently buffered
    #[must_use]
    pub const fn buffered_bytes(&self) -> usize {
        self.buffer.len()
    }

    fn finalize(&mut self, boundary: Boundary) -> Option<Utterance> {
        self.deadline = None;
        if self.buffer.is_empty() {
            return None;
        }

        let audio = self.buffer.take();
        tracing::debug!(bytes = audio.len(), ?boundary, "utterance finalized");
        Some(Utterance { audio, boundary })
    }
}

/// Wait until `deadline`, or forever when there is none
pub async fn wait_for_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
