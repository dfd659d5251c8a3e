//! Client voice state machine
//!
//! [`VoiceClient::handle`] is a pure transition function: it takes one event
//! (a local action, a voice activity edge, a captured frame, or a server
//! message) and returns the side effects the runtime must perform, in order.

use std::collections::VecDeque;

use crate::protocol::{ClientMessage, ServerMessage};

/// Captured frames kept while waiting for speech, sent when it starts
pub const PREROLL_FRAMES: usize = 10;

/// Client voice mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceMode {
    Idle,
    /// Microphone live, speech streamed to the server
    Listening,
    /// Utterance transcribed, waiting for the reply
    Processing,
    /// Assistant audio playing
    Speaking,
    /// Stopped on an error until explicitly restarted
    Error,
}

/// Input to the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// User asked to start listening
    Start,
    /// User asked to stop
    Stop,
    /// Local voice activity crossed the threshold
    SpeechStarted,
    /// Local voice activity fell silent
    SpeechEnded,
    /// One captured frame, already PCM16 encoded
    CapturedAudio(Vec<u8>),
    /// Message received from the server
    Server(ServerMessage),
    /// Everything queued for playback has been played
    PlaybackDrained,
    /// Connection to the server was lost
    TransportFailed(String),
}

/// Side effect requested by the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum ClientAction {
    /// Open a new server connection
    Connect,
    /// Send a message to the server
    Send(ClientMessage),
    /// Queue encoded audio for playback
    PlayAudio(Vec<u8>),
    /// Halt playback and drop everything queued
    StopPlayback,
    ShowTranscript(String),
    ShowToken(String),
    ShowError(String),
    ModeChanged(VoiceMode),
}

/// Client-side protocol state
#[derive(Debug)]
pub struct VoiceClient {
    mode: VoiceMode,
    auto_listen: bool,
    connected: bool,
    session_id: Option<String>,
    /// Speech is currently being streamed to the server
    in_speech: bool,
    /// Server finished the turn while audio was still playing
    response_done: bool,
    preroll: VecDeque<Vec<u8>>,
}

impl VoiceClient {
    /// New client in `Idle`, not yet connected
    #[must_use]
    pub const fn new(auto_listen: bool) -> Self {
        Self {
            mode: VoiceMode::Idle,
            auto_listen,
            connected: false,
            session_id: None,
            in_speech: false,
            response_done: false,
            preroll: VecDeque::new(),
        }
    }

    #[must_use]
    pub const fn mode(&self) -> VoiceMode {
        self.mode
    }

    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Whether the runtime should report [`ClientEvent::PlaybackDrained`]
    #[must_use]
    pub const fn awaiting_drain(&self) -> bool {
        matches!(self.mode, VoiceMode::Speaking) && self.response_done
    }

    /// Apply one event and return the actions to perform
    pub fn handle(&mut self, event: ClientEvent) -> Vec<ClientAction> {
        let mut actions = Vec::new();

        match event {
            ClientEvent::Start => self.start(&mut actions),
            ClientEvent::Stop => {
                match self.mode {
                    VoiceMode::Processing | VoiceMode::Speaking => {
                        actions.push(ClientAction::StopPlayback);
                        actions.push(ClientAction::Send(ClientMessage::Interrupt));
                    }
                    // the server holds a partial utterance
                    VoiceMode::Listening if self.in_speech => {
                        actions.push(ClientAction::Send(ClientMessage::Interrupt));
                    }
                    _ => {}
                }
                self.reset_capture();
                self.set_mode(VoiceMode::Idle, &mut actions);
            }
            ClientEvent::SpeechStarted => self.on_speech_started(&mut actions),
            ClientEvent::SpeechEnded => {
                if self.mode == VoiceMode::Listening && self.in_speech {
                    self.in_speech = false;
                    actions.push(ClientAction::Send(ClientMessage::EndUtterance));
                }
            }
            ClientEvent::CapturedAudio(data) => self.on_audio(data, &mut actions),
            ClientEvent::Server(message) => self.on_server(message, &mut actions),
            ClientEvent::PlaybackDrained => {
                if self.awaiting_drain() {
                    self.finish_turn(&mut actions);
                }
            }
            ClientEvent::TransportFailed(reason) => {
                self.connected = false;
                self.session_id = None;
                self.fail(format!("connection lost: {reason}"), &mut actions);
            }
        }

        actions
    }

    fn start(&mut self, actions: &mut Vec<ClientAction>) {
        if !matches!(self.mode, VoiceMode::Idle | VoiceMode::Error) {
            return;
        }
        if !self.connected {
            self.connected = true;
            actions.push(ClientAction::Connect);
        }
        self.reset_capture();
        self.set_mode(VoiceMode::Listening, actions);
    }

    fn on_speech_started(&mut self, actions: &mut Vec<ClientAction>) {
        match self.mode {
            VoiceMode::Listening if !self.in_speech => {
                self.in_speech = true;
                self.flush_preroll(actions);
            }
            VoiceMode::Speaking => {
                // barge-in
                tracing::debug!("barge-in detected");
                actions.push(ClientAction::StopPlayback);
                actions.push(ClientAction::Send(ClientMessage::Interrupt));
                self.response_done = false;
                let preroll = std::mem::take(&mut self.preroll);
                self.set_mode(VoiceMode::Idle, actions);
                if self.auto_listen {
                    // keep the words that interrupted
                    self.in_speech = true;
                    self.preroll = preroll;
                    self.set_mode(VoiceMode::Listening, actions);
                    self.flush_preroll(actions);
                }
            }
            _ => {}
        }
    }

    fn on_audio(&mut self, data: Vec<u8>, actions: &mut Vec<ClientAction>) {
        if self.in_speech && self.mode == VoiceMode::Listening {
            actions.push(ClientAction::Send(ClientMessage::AudioInput { data }));
            return;
        }
        if matches!(self.mode, VoiceMode::Listening | VoiceMode::Speaking) {
            if self.preroll.len() == PREROLL_FRAMES {
                self.preroll.pop_front();
            }
            self.preroll.push_back(data);
        }
    }

    fn on_server(&mut self, message: ServerMessage, actions: &mut Vec<ClientAction>) {
        match message {
            ServerMessage::SessionStarted { session_id } => {
                tracing::info!(session_id = %session_id, "session started");
                self.session_id = Some(session_id);
            }
            ServerMessage::SttResult { text } => {
                if self.mode != VoiceMode::Listening {
                    tracing::debug!(mode = ?self.mode, "dropping transcript outside listening");
                    return;
                }
                self.in_speech = false;
                self.preroll.clear();
                self.response_done = false;
                actions.push(ClientAction::ShowTranscript(text));
                self.set_mode(VoiceMode::Processing, actions);
            }
            ServerMessage::LlmToken { token } => {
                if matches!(self.mode, VoiceMode::Processing | VoiceMode::Speaking) {
                    actions.push(ClientAction::ShowToken(token));
                }
            }
            ServerMessage::AudioChunk { data } => match self.mode {
                VoiceMode::Processing => {
                    actions.push(ClientAction::PlayAudio(data));
                    self.set_mode(VoiceMode::Speaking, actions);
                }
                VoiceMode::Speaking => actions.push(ClientAction::PlayAudio(data)),
                // in flight when playback was stopped
                _ => tracing::trace!(bytes = data.len(), "dropping late audio chunk"),
            },
            ServerMessage::ResponseComplete => match self.mode {
                VoiceMode::Speaking => self.response_done = true,
                VoiceMode::Processing => self.finish_turn(actions),
                _ => {}
            },
            ServerMessage::Error { error } => self.fail(error, actions),
        }
    }

    fn finish_turn(&mut self, actions: &mut Vec<ClientAction>) {
        self.response_done = false;
        self.set_mode(VoiceMode::Idle, actions);
        if self.auto_listen {
            self.reset_capture();
            self.set_mode(VoiceMode::Listening, actions);
        }
    }

    fn fail(&mut self, error: String, actions: &mut Vec<ClientAction>) {
        if matches!(self.mode, VoiceMode::Speaking) {
            actions.push(ClientAction::StopPlayback);
        }
        actions.push(ClientAction::ShowError(error));
        self.reset_capture();
        self.response_done = false;
        self.set_mode(VoiceMode::Error, actions);
    }

    fn flush_preroll(&mut self, actions: &mut Vec<ClientAction>) {
        actions.extend(
            self.preroll
                .drain(..)
                .map(|data| ClientAction::Send(ClientMessage::AudioInput { data })),
        );
    }

    fn reset_capture(&mut self) {
        self.in_speech = false;
        self.preroll.clear();
    }

    fn set_mode(&mut self, mode: VoiceMode, actions: &mut Vec<ClientAction>) {
        if self.mode != mode {
            tracing::debug!(from = ?self.mode, to = ?mode, "voice mode changed");
            self.mode = mode;
            actions.push(ClientAction::ModeChanged(mode));
        }
    }
}
