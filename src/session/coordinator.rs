//! Per-connection session coordinator
//!
//! Owns the audio buffer, conversation history and active turn for one
//! connection. Inbound messages, the silence deadline and turn progress are
//! all handled on this one task, and it is the only writer to the outbound
//! channel, so messages reach the client in the order they are produced here.
//!
//! Turn events are only taken once an outbound slot is reserved. A client
//! that stops reading stalls the turn rather than the coordinator, which keeps
//! reading inbound messages so an interrupt still lands.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::mpsc::{self, OwnedPermit};
use tokio_util::sync::CancellationToken;

use super::history::{Closed, ConversationHistory};
use super::segmenter::{DEFAULT_SILENCE, Utterance, UtteranceSegmenter, wait_for_deadline};
use super::turn::{SessionPhase, TurnError, TurnEvent, TurnEventKind, TurnId, TurnTask};
use crate::gateway::Gateways;
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};

/// Turn events queued between a turn task and the coordinator
const TURN_EVENT_CAPACITY: usize = 32;

/// Error notices held while the outbound channel is full
const MAX_PENDING_NOTICES: usize = 16;

/// Stable identity bound at connection time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub session_id: String,
    pub user_id: String,
}

/// Tunables for a session
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Silence after the last chunk that ends an utterance
    pub silence: Duration,
    /// Utterance byte cap; reaching it finalizes early
    pub max_utterance_bytes: usize,
    /// Leading system turn of every conversation
    pub system_prompt: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            silence: DEFAULT_SILENCE,
            max_utterance_bytes: 1_920_000,
            system_prompt: String::new(),
        }
    }
}

/// Input from the connection handler
#[derive(Debug)]
pub enum Inbound {
    /// Well-formed client message
    Message(ClientMessage),
    /// Frame that could not be parsed
    Invalid(ProtocolError),
}

/// Handles for the one in-flight turn
#[derive(Debug)]
struct ActiveTurn {
    id: TurnId,
    cancel: CancellationToken,
    synthesis_stop: CancellationToken,
    synthesizing: bool,
    text: String,
}

/// Drives one voice session from connect to disconnect
pub struct SessionCoordinator {
    identity: SessionIdentity,
    segmenter: UtteranceSegmenter,
    history: ConversationHistory,
    gateways: Gateways,
    active: Option<ActiveTurn>,
    phase: SessionPhase,
    next_turn_id: TurnId,
    outbound: mpsc::Sender<ServerMessage>,
    notices: VecDeque<ServerMessage>,
    events_tx: mpsc::Sender<TurnEvent>,
    events_rx: mpsc::Receiver<TurnEvent>,
}

impl SessionCoordinator {
    /// Create a coordinator that writes to `outbound`
    #[must_use]
    pub fn new(
        identity: SessionIdentity,
        settings: &SessionSettings,
        gateways: Gateways,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(TURN_EVENT_CAPACITY);
        Self {
            identity,
            segmenter: UtteranceSegmenter::new(settings.silence, settings.max_utterance_bytes),
            history: ConversationHistory::new(settings.system_prompt.clone()),
            gateways,
            active: None,
            phase: SessionPhase::Idle,
            next_turn_id: 1,
            outbound,
            notices: VecDeque::new(),
            events_tx,
            events_rx,
        }
    }

    /// Process input until the inbound channel closes or `shutdown` fires
    ///
    /// Any active turn is cancelled on the way out. Returns the final history.
    pub async fn run(
        mut self,
        mut inbound: mpsc::Receiver<Inbound>,
        shutdown: CancellationToken,
    ) -> ConversationHistory {
        tracing::debug!(session_id = %self.identity.session_id, "session coordinator started");

        loop {
            let deadline = self.segmenter.deadline();
            tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    tracing::info!(session_id = %self.identity.session_id, "session shut down");
                    break;
                }
                message = inbound.recv() => match message {
                    Some(message) => self.handle_inbound(message),
                    None => break,
                },
                permit = self.outbound.clone().reserve_owned(), if !self.notices.is_empty() => {
                    match (permit, self.notices.pop_front()) {
                        (Ok(permit), Some(notice)) => {
                            permit.send(notice);
                        }
                        _ => self.notices.clear(),
                    }
                }
                (permit, event) = next_turn_event(self.outbound.clone(), &mut self.events_rx) => {
                    if let Some(message) = self.apply_turn_event(event) {
                        self.deliver(permit, message);
                    }
                }
                () = wait_for_deadline(deadline) => self.on_silence(),
            }
        }

        self.close();
        self.history
    }

    /// Apply one inbound message
    pub fn handle_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Message(ClientMessage::AudioInput { data }) => {
                if let Some(utterance) = self.segmenter.push(data) {
                    self.start_turn(utterance);
                }
            }
            Inbound::Message(ClientMessage::EndUtterance) => {
                match self.segmenter.end_utterance() {
                    Some(utterance) => self.start_turn(utterance),
                    None => tracing::debug!("end_utterance with nothing buffered"),
                }
            }
            Inbound::Message(ClientMessage::Interrupt) => self.interrupt(),
            Inbound::Invalid(err) if err.is_audio_decode() => {
                tracing::warn!(
                    session_id = %self.identity.session_id,
                    error = %err,
                    "dropping undecodable audio chunk"
                );
            }
            Inbound::Invalid(err) => {
                tracing::warn!(
                    session_id = %self.identity.session_id,
                    error = %err,
                    "protocol violation"
                );
                self.notify(ServerMessage::error(format!("invalid message: {err}")));
            }
        }
    }

    /// Cancel the in-flight turn, if any
    ///
    /// Cancels generation, stops synthesis, clears buffered audio and marks
    /// the open assistant turn as interrupted. Safe to call repeatedly.
    pub fn interrupt(&mut self) {
        let active = self.active.take();
        if let Some(turn) = &active {
            turn.cancel.cancel();
            turn.synthesis_stop.cancel();
        }

        let dropped_bytes = self.segmenter.buffered_bytes();
        self.segmenter.clear();
        let closed = self.history.interrupt_open();
        self.phase = SessionPhase::Idle;

        if let Some(turn) = active {
            tracing::info!(
                session_id = %self.identity.session_id,
                turn_id = turn.id,
                synthesizing = turn.synthesizing,
                streamed_chars = turn.text.chars().count(),
                dropped_bytes,
                history = ?closed,
                "turn interrupted"
            );
        } else {
            tracing::debug!(dropped_bytes, "interrupt with no active turn");
        }
    }

    fn on_silence(&mut self) {
        if let Some(utterance) = self.segmenter.on_silence() {
            self.start_turn(utterance);
        }
    }

    fn start_turn(&mut self, utterance: Utterance) {
        if self.active.is_some() {
            tracing::info!("new utterance while a turn is active, interrupting it");
            self.interrupt();
        }

        let id = self.next_turn_id;
        self.next_turn_id += 1;

        let cancel = CancellationToken::new();
        let synthesis_stop = CancellationToken::new();
        let task = TurnTask::new(
            id,
            utterance.audio,
            self.history.snapshot(),
            self.gateways.clone(),
            cancel.clone(),
            synthesis_stop.clone(),
            self.events_tx.clone(),
        );

        tracing::debug!(
            session_id = %self.identity.session_id,
            turn_id = id,
            boundary = ?utterance.boundary,
            "starting turn"
        );

        self.active = Some(ActiveTurn {
            id,
            cancel,
            synthesis_stop,
            synthesizing: false,
            text: String::new(),
        });
        self.phase = SessionPhase::Transcribing;
        tokio::spawn(task.run());
    }

    /// Apply progress from a turn, returning the message to send for it
    ///
    /// Events from superseded turns are dropped.
    pub fn apply_turn_event(&mut self, event: TurnEvent) -> Option<ServerMessage> {
        let Some(active) = self.active.as_mut().filter(|a| a.id == event.turn_id) else {
            tracing::trace!(turn_id = event.turn_id, "dropping event from inactive turn");
            return None;
        };

        match event.kind {
            TurnEventKind::Phase(phase) => {
                active.synthesizing = phase == SessionPhase::Synthesizing;
                self.phase = phase;
                None
            }
            TurnEventKind::Transcript(text) => {
                self.history.push_user(text.clone());
                self.history.open_assistant();
                Some(ServerMessage::SttResult { text })
            }
            TurnEventKind::Token(token) => {
                active.text.push_str(&token);
                self.history.append_to_open(&token);
                Some(ServerMessage::LlmToken { token })
            }
            TurnEventKind::Audio(data) => Some(ServerMessage::AudioChunk { data }),
            TurnEventKind::Completed => {
                self.history.close_open();
                self.finish_turn();
                Some(ServerMessage::ResponseComplete)
            }
            TurnEventKind::Failed(err) => self.fail_turn(err),
        }
    }

    fn fail_turn(&mut self, err: TurnError) -> Option<ServerMessage> {
        let closed = match err {
            TurnError::GenerationFailed(_) | TurnError::SynthesisFailed(_) => {
                self.history.close_open()
            }
            TurnError::NoSpeechDetected | TurnError::TranscriptionFailed(_) => Closed::NothingOpen,
            TurnError::Cancelled => return None,
        };

        if let Some(turn) = &self.active {
            turn.cancel.cancel();
            turn.synthesis_stop.cancel();
        }
        self.finish_turn();

        tracing::warn!(
            session_id = %self.identity.session_id,
            error = %err,
            history = ?closed,
            "turn failed"
        );
        Some(ServerMessage::error(err.to_string()))
    }

    fn finish_turn(&mut self) {
        self.active = None;
        self.phase = SessionPhase::Idle;
    }

    fn close(&mut self) {
        if self.active.is_some() {
            self.interrupt();
        }
        self.segmenter.clear();
        tracing::debug!(
            session_id = %self.identity.session_id,
            turns = self.history.len(),
            "session closed"
        );
    }

    fn deliver(&self, permit: Option<OwnedPermit<ServerMessage>>, message: ServerMessage) {
        tracing::trace!(kind = message.kind(), "sending");
        match permit {
            Some(permit) => {
                permit.send(message);
            }
            None => tracing::debug!(
                session_id = %self.identity.session_id,
                "outbound channel closed"
            ),
        }
    }

    fn notify(&mut self, message: ServerMessage) {
        if self.notices.len() >= MAX_PENDING_NOTICES {
            tracing::warn!(
                session_id = %self.identity.session_id,
                "client is not reading, dropping error notice"
            );
            return;
        }
        self.notices.push_back(message);
    }

    #[must_use]
    pub const fn phase(&self) -> SessionPhase {
        self.phase
    }

    #[must_use]
    pub const fn history(&self) -> &ConversationHistory {
        &self.history
    }

    /// Bytes of audio waiting for an utterance boundary
    #[must_use]
    pub const fn buffered_bytes(&self) -> usize {
        self.segmenter.buffered_bytes()
    }

    /// Id of the in-flight turn
    #[must_use]
    pub fn active_turn(&self) -> Option<TurnId> {
        self.active.as_ref().map(|t| t.id)
    }
}

/// Wait for an outbound slot, then for the next turn event
///
/// The permit is `None` once the client is gone; events still drain so that
/// turns are not left blocked.
async fn next_turn_event(
    outbound: mpsc::Sender<ServerMessage>,
    events: &mut mpsc::Receiver<TurnEvent>,
) -> (Option<OwnedPermit<ServerMessage>>, TurnEvent) {
    let permit = outbound.reserve_owned().await.ok();
    // the coordinator holds a sender, so the channel never closes here
    let Some(event) = events.recv().await else {
        return std::future::pending().await;
    };
    (permit, event)
}
