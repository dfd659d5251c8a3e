//! Shared test utilities: scripted collaborators and session harness

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cadence::gateway::ChunkSink;
use cadence::protocol::{ClientMessage, ServerMessage};
use cadence::session::{
    ConversationHistory, Inbound, SessionCoordinator, SessionIdentity, SessionSettings, Turn,
};
use cadence::{GenerationError, Gateways, Generator, Synthesizer, TokenStream, Transcriber};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Returns a fixed transcript and records every utterance it was given
#[derive(Default)]
pub struct ScriptedTranscriber {
    reply: Option<String>,
    pub calls: Mutex<Vec<Vec<u8>>>,
}

impl ScriptedTranscriber {
    pub fn replying(text: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Some(text.to_string()),
            calls: Mutex::default(),
        })
    }

    pub fn no_speech() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn utterances(&self) -> Vec<Vec<u8>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transcriber for ScriptedTranscriber {
    async fn transcribe(&self, audio: &[u8]) -> cadence::Result<Option<String>> {
        self.calls.lock().unwrap().push(audio.to_vec());
        Ok(self.reply.clone())
    }
}

/// Emits scripted tokens, each after its own delay
#[derive(Default)]
pub struct ScriptedGenerator {
    steps: Vec<(Duration, String)>,
    fail_at_end: Option<String>,
    pub histories: Mutex<Vec<Vec<Turn>>>,
}

impl ScriptedGenerator {
    /// Tokens produced back to back
    pub fn tokens(tokens: &[&str]) -> Arc<Self> {
        Self::paced(tokens, Duration::ZERO)
    }

    /// Tokens produced `gap` apart
    pub fn paced(tokens: &[&str], gap: Duration) -> Arc<Self> {
        Arc::new(Self {
            steps: tokens.iter().map(|t| (gap, (*t).to_string())).collect(),
            ..Self::default()
        })
    }

    /// Tokens followed by a provider failure
    pub fn failing_after(tokens: &[&str], message: &str) -> Arc<Self> {
        Arc::new(Self {
            steps: tokens.iter().map(|t| (Duration::ZERO, (*t).to_string())).collect(),
            fail_at_end: Some(message.to_string()),
            ..Self::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.histories.lock().unwrap().len()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(
        &self,
        history: &[Turn],
        _cancel: CancellationToken,
    ) -> Result<TokenStream, GenerationError> {
        self.histories.lock().unwrap().push(history.to_vec());

        let tokens = futures::stream::iter(self.steps.clone()).then(|(delay, token)| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok::<_, GenerationError>(token)
        });
        let failure = futures::stream::iter(
            self.fail_at_end
                .clone()
                .map(|msg| Err(GenerationError::Failed(msg))),
        );
        Ok(Box::pin(tokens.chain(failure)))
    }
}

/// Records flushed fragments and answers each with its own bytes as audio
#[derive(Default)]
pub struct RecordingSynthesizer {
    chunks_per_fragment: usize,
    chunk_gap: Duration,
    fail: bool,
    pub fragments: Mutex<Vec<String>>,
}

impl RecordingSynthesizer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            chunks_per_fragment: 1,
            ..Self::default()
        })
    }

    /// Several chunks per fragment, `gap` apart
    pub fn slow(chunks_per_fragment: usize, gap: Duration) -> Arc<Self> {
        Arc::new(Self {
            chunks_per_fragment,
            chunk_gap: gap,
            ..Self::default()
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Self::default()
        })
    }

    pub fn flushed(&self) -> Vec<String> {
        self.fragments.lock().unwrap().clone()
    }
}

#[async_trait]
impl Synthesizer for RecordingSynthesizer {
    async fn synthesize(&self, text: &str, sink: &ChunkSink) -> cadence::Result<()> {
        self.fragments.lock().unwrap().push(text.to_string());
        if self.fail {
            return Err(cadence::Error::Tts("voice unavailable".to_string()));
        }
        for _ in 0..self.chunks_per_fragment {
            if !self.chunk_gap.is_zero() {
                tokio::time::sleep(self.chunk_gap).await;
            }
            if !sink.send(text.as_bytes().to_vec()).await {
                return Ok(());
            }
        }
        Ok(())
    }
}

/// Produces `chunks` 1 KiB chunks as fast as the sink accepts them
#[derive(Default)]
pub struct FloodingSynthesizer {
    chunks: usize,
    produced: AtomicUsize,
    stopped: AtomicBool,
}

impl FloodingSynthesizer {
    pub fn new(chunks: usize) -> Arc<Self> {
        Arc::new(Self {
            chunks,
            ..Self::default()
        })
    }

    pub fn produced(&self) -> usize {
        self.produced.load(Ordering::SeqCst)
    }

    /// Whether synthesis ended, returned or dropped, after its sink was stopped
    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

struct StopWatch<'a> {
    sink: &'a ChunkSink,
    stopped: &'a AtomicBool,
}

impl Drop for StopWatch<'_> {
    fn drop(&mut self) {
        if self.sink.is_stopped() {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Synthesizer for FloodingSynthesizer {
    async fn synthesize(&self, _text: &str, sink: &ChunkSink) -> cadence::Result<()> {
        let _watch = StopWatch {
            sink,
            stopped: &self.stopped,
        };
        for _ in 0..self.chunks {
            if !sink.send(vec![0x5A; 1024]).await {
                return Ok(());
            }
            self.produced.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

pub fn gateways(
    transcriber: Arc<ScriptedTranscriber>,
    generator: Arc<ScriptedGenerator>,
    synthesizer: Arc<RecordingSynthesizer>,
) -> Gateways {
    Gateways {
        transcriber,
        generator,
        synthesizer,
    }
}

/// A coordinator running on its own task
pub struct Harness {
    pub inbound: mpsc::Sender<Inbound>,
    pub outbound: mpsc::Receiver<ServerMessage>,
    pub shutdown: CancellationToken,
    pub task: JoinHandle<ConversationHistory>,
}

impl Harness {
    pub fn start(gateways: Gateways) -> Self {
        Self::with_settings(
            gateways,
            &SessionSettings {
                system_prompt: "You are a helpful voice assistant.".to_string(),
                ..SessionSettings::default()
            },
        )
    }

    pub fn with_settings(gateways: Gateways, settings: &SessionSettings) -> Self {
        let (out_tx, outbound) = mpsc::channel(256);
        let (inbound, in_rx) = mpsc::channel(64);
        let shutdown = CancellationToken::new();
        let coordinator = SessionCoordinator::new(
            SessionIdentity {
                session_id: "session-1".to_string(),
                user_id: "user-1".to_string(),
            },
            settings,
            gateways,
            out_tx,
        );
        let task = tokio::spawn(coordinator.run(in_rx, shutdown.clone()));
        Self {
            inbound,
            outbound,
            shutdown,
            task,
        }
    }

    pub async fn audio(&self, len: usize) {
        self.send(ClientMessage::AudioInput {
            data: vec![0x11; len],
        })
        .await;
    }

    pub async fn send(&self, message: ClientMessage) {
        self.inbound
            .send(Inbound::Message(message))
            .await
            .expect("coordinator stopped");
    }

    /// Next outbound message, or `None` if nothing arrives within `wait`
    pub async fn next(&mut self, wait: Duration) -> Option<ServerMessage> {
        tokio::time::timeout(wait, self.outbound.recv())
            .await
            .ok()
            .flatten()
    }

    /// Collect messages until `response_complete` or `error`
    pub async fn until_turn_end(&mut self) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Some(message) = self.next(Duration::from_secs(30)).await {
            let done = matches!(
                message,
                ServerMessage::ResponseComplete | ServerMessage::Error { .. }
            );
            messages.push(message);
            if done {
                break;
            }
        }
        messages
    }

    /// Everything sent within `wait`
    pub async fn drain(&mut self, wait: Duration) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Some(message) = self.next(wait).await {
            messages.push(message);
        }
        messages
    }

    /// Close the inbound side and return the final history
    pub async fn finish(self) -> ConversationHistory {
        drop(self.inbound);
        self.task.await.expect("coordinator panicked")
    }
}

pub fn tokens(messages: &[ServerMessage]) -> Vec<String> {
    messages
        .iter()
        .filter_map(|m| match m {
            ServerMessage::LlmToken { token } => Some(token.clone()),
            _ => None,
        })
        .collect()
}

pub fn audio_chunks(messages: &[ServerMessage]) -> Vec<Vec<u8>> {
    messages
        .iter()
        .filter_map(|m| match m {
            ServerMessage::AudioChunk { data } => Some(data.clone()),
            _ => None,
        })
        .collect()
}
