//! Collaborator contracts consumed by the session pipeline
//!
//! Transcription, generation and synthesis are opaque services. The session
//! only depends on these traits; `crate::voice` holds the HTTP-backed
//! implementations and tests substitute scripted fakes.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::session::history::Turn;

/// Failure modes of a generation stream
#[derive(Debug, Error)]
pub enum GenerationError {
    /// Stopped through its cancellation token; not a failure
    #[error("generation cancelled")]
    Cancelled,

    /// Any other provider or transport failure
    #[error("generation failed: {0}")]
    Failed(String),
}

/// Incrementally produced tokens
pub type TokenStream =
    Pin<Box<dyn Stream<Item = std::result::Result<String, GenerationError>> + Send>>;

/// Turns a finished utterance into text
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe raw utterance audio
    ///
    /// Returns `Ok(None)` when no speech was detected.
    ///
    /// # Errors
    ///
    /// Returns error if the transcription service fails
    async fn transcribe(&self, audio: &[u8]) -> Result<Option<String>>;
}

/// Produces the assistant reply token by token
#[async_trait]
pub trait Generator: Send + Sync {
    /// Start generating a reply to `history`
    ///
    /// Cancelling `cancel` must end the stream at its next yield point, with
    /// either end-of-stream or [`GenerationError::Cancelled`].
    ///
    /// # Errors
    ///
    /// Returns error if the stream cannot be opened
    async fn generate(
        &self,
        history: &[Turn],
        cancel: CancellationToken,
    ) -> std::result::Result<TokenStream, GenerationError>;
}

/// Receives encoded audio chunks as they are synthesized
///
/// Sending waits while the session is behind on delivering earlier chunks, so
/// a synthesizer never runs further ahead of the client than the channel
/// allows.
#[derive(Debug, Clone)]
pub struct ChunkSink {
    chunks: mpsc::Sender<Vec<u8>>,
    stop: CancellationToken,
}

impl ChunkSink {
    #[must_use]
    pub const fn new(chunks: mpsc::Sender<Vec<u8>>, stop: CancellationToken) -> Self {
        Self { chunks, stop }
    }

    /// Hand over one chunk, waiting for room
    ///
    /// Returns `false` once synthesis should stop: the stop token fired or
    /// nobody is receiving anymore. The chunk is not delivered in that case.
    pub async fn send(&self, chunk: Vec<u8>) -> bool {
        if self.stop.is_cancelled() {
            return false;
        }
        tokio::select! {
            biased;
            () = self.stop.cancelled() => false,
            sent = self.chunks.send(chunk) => sent.is_ok(),
        }
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Resolves once synthesis has been asked to stop
    pub async fn stopped(&self) {
        self.stop.cancelled().await;
    }
}

/// Turns a text fragment into encoded audio
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Synthesize `text`, handing each audio chunk to `sink` in order
    ///
    /// Once the sink reports it is stopped no further chunk may be delivered
    /// and the call returns promptly with `Ok(())`.
    ///
    /// # Errors
    ///
    /// Returns error if synthesis fails
    async fn synthesize(&self, text: &str, sink: &ChunkSink) -> Result<()>;
}

/// The three collaborators a session needs
#[derive(Clone)]
pub struct Gateways {
    pub transcriber: Arc<dyn Transcriber>,
    pub generator: Arc<dyn Generator>,
    pub synthesizer: Arc<dyn Synthesizer>,
}

impl std::fmt::Debug for Gateways {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateways").finish_non_exhaustive()
    }
}
