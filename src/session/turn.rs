//! One conversational turn: transcription, generation, chunked synthesis
//!
//! A turn runs as its own task so the session stays responsive while it
//! waits on collaborators. It never touches session state directly; it
//! reports progress as [`TurnEvent`]s and the coordinator applies them.
//! Cancellation is cooperative and checked at every await point.

use futures::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::flush::FlushBuffer;
use super::history::Turn;
use crate::gateway::{ChunkSink, GenerationError, Gateways};

/// Synthesized chunks buffered between the synthesizer and the turn
const AUDIO_CHUNK_CAPACITY: usize = 8;

/// Monotonic per-session turn number
pub type TurnId = u64;

/// Server-side lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    /// No active turn
    #[default]
    Idle,
    Transcribing,
    Generating,
    Synthesizing,
}

/// Ways a turn can end early
#[derive(Debug, Error)]
pub enum TurnError {
    /// Transcription found no speech
    #[error("No speech detected")]
    NoSpeechDetected,

    /// Transcription service failed
    #[error("transcription failed: {0}")]
    TranscriptionFailed(String),

    /// Generation stream failed
    #[error("response generation failed: {0}")]
    GenerationFailed(String),

    /// Speech synthesis failed
    #[error("speech synthesis failed: {0}")]
    SynthesisFailed(String),

    /// Turn was interrupted; never reported to the client
    #[error("turn cancelled")]
    Cancelled,
}

impl From<GenerationError> for TurnError {
    fn from(err: GenerationError) -> Self {
        match err {
            GenerationError::Cancelled => Self::Cancelled,
            GenerationError::Failed(msg) => Self::GenerationFailed(msg),
        }
    }
}

/// Progress reported by a running turn
#[derive(Debug)]
pub enum TurnEventKind {
    Phase(SessionPhase),
    Transcript(String),
    Token(String),
    Audio(Vec<u8>),
    Completed,
    Failed(TurnError),
}

/// A [`TurnEventKind`] tagged with the turn it came from
#[derive(Debug)]
pub struct TurnEvent {
    pub turn_id: TurnId,
    pub kind: TurnEventKind,
}

/// Everything a turn needs to run to completion
pub struct TurnTask {
    id: TurnId,
    audio: Vec<u8>,
    history: Vec<Turn>,
    gateways: Gateways,
    cancel: CancellationToken,
    synthesis_stop: CancellationToken,
    events: mpsc::Sender<TurnEvent>,
}

impl TurnTask {
    /// Create a turn over `audio`, replying in the context of `history`
    #[must_use]
    pub fn new(
        id: TurnId,
        audio: Vec<u8>,
        history: Vec<Turn>,
        gateways: Gateways,
        cancel: CancellationToken,
        synthesis_stop: CancellationToken,
        events: mpsc::Sender<TurnEvent>,
    ) -> Self {
        Self {
            id,
            audio,
            history,
            gateways,
            cancel,
            synthesis_stop,
            events,
        }
    }

    /// Run the turn and report its outcome
    ///
    /// Cancellation ends the task silently.
    pub async fn run(mut self) {
        match self.drive().await {
            Ok(()) => {
                let _ = self.emit(TurnEventKind::Completed).await;
            }
            Err(TurnError::Cancelled) => {
                tracing::debug!(turn_id = self.id, "turn cancelled");
            }
            Err(err) => {
                let _ = self.emit(TurnEventKind::Failed(err)).await;
            }
        }
    }

    async fn drive(&mut self) -> Result<(), TurnError> {
        self.emit(TurnEventKind::Phase(SessionPhase::Transcribing)).await?;

        let transcript = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(TurnError::Cancelled),
            result = self.gateways.transcriber.transcribe(&self.audio) => {
                result.map_err(|e| TurnError::TranscriptionFailed(e.to_string()))?
            }
        };

        let text = transcript
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or(TurnError::NoSpeechDetected)?;

        tracing::info!(turn_id = self.id, transcript = %text, "utterance transcribed");
        self.emit(TurnEventKind::Transcript(text.clone())).await?;
        self.history.push(Turn::user(text));

        self.emit(TurnEventKind::Phase(SessionPhase::Generating)).await?;
        let mut tokens = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(TurnError::Cancelled),
            stream = self.gateways.generator.generate(&self.history, self.cancel.clone()) => stream?,
        };

        let mut flush = FlushBuffer::new();
        loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Err(TurnError::Cancelled),
                next = tokens.next() => next,
            };

            let Some(token) = next else { break };
            let token = token?;
            if token.is_empty() {
                continue;
            }

            self.emit(TurnEventKind::Token(token.clone())).await?;
            if let Some(fragment) = flush.push(&token) {
                self.synthesize(fragment).await?;
            }
        }

        if self.cancel.is_cancelled() {
            return Err(TurnError::Cancelled);
        }

        if let Some(rest) = flush.take_remainder() {
            self.synthesize(rest).await?;
        }

        Ok(())
    }

    async fn synthesize(&self, fragment: String) -> Result<(), TurnError> {
        if self.cancel.is_cancelled() || self.synthesis_stop.is_cancelled() {
            return Err(TurnError::Cancelled);
        }

        self.emit(TurnEventKind::Phase(SessionPhase::Synthesizing)).await?;
        tracing::debug!(
            turn_id = self.id,
            chars = fragment.chars().count(),
            "flushing fragment to synthesis"
        );

        let (chunks_tx, mut chunks) = mpsc::channel(AUDIO_CHUNK_CAPACITY);
        let sink = ChunkSink::new(chunks_tx, self.synthesis_stop.clone());
        let synthesis = self.gateways.synthesizer.synthesize(&fragment, &sink);
        tokio::pin!(synthesis);

        // forwarding waits on the session, which in turn pauses synthesis
        let result = loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Err(TurnError::Cancelled),
                Some(chunk) = chunks.recv() => self.forward_audio(chunk).await?,
                result = &mut synthesis => break result,
            }
        };
        while let Ok(chunk) = chunks.try_recv() {
            self.forward_audio(chunk).await?;
        }

        if self.cancel.is_cancelled() || self.synthesis_stop.is_cancelled() {
            return Err(TurnError::Cancelled);
        }
        result.map_err(|e| TurnError::SynthesisFailed(e.to_string()))?;

        self.emit(TurnEventKind::Phase(SessionPhase::Generating)).await
    }

    async fn forward_audio(&self, chunk: Vec<u8>) -> Result<(), TurnError> {
        if self.synthesis_stop.is_cancelled() {
            return Err(TurnError::Cancelled);
        }
        self.emit(TurnEventKind::Audio(chunk)).await
    }

    /// Report progress, waiting while the session catches up
    ///
    /// Cancellation or a closed channel ends the turn.
    async fn emit(&self, kind: TurnEventKind) -> Result<(), TurnError> {
        let event = TurnEvent {
            turn_id: self.id,
            kind,
        };
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(TurnError::Cancelled),
            sent = self.events.send(event) => sent.map_err(|_| TurnError::Cancelled),
        }
    }
}
