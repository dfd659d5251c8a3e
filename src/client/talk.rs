//! Voice client runtime
//!
//! Wires the microphone, voice activity detector, state machine, WebSocket
//! connection and speaker together. The audio streams are not `Send`, so the
//! whole runtime runs on the caller's task.

use std::collections::VecDeque;
use std::io::Write as _;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::machine::{ClientAction, ClientEvent, VoiceClient, VoiceMode};
use crate::config::Config;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::voice::{
    AudioCapture, AudioPlayback, Mp3Stream, PlaybackQueue, VadConfig, VadEvent,
    VoiceActivityDetector, samples_to_pcm16,
};
use crate::{Error, Result};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SocketSink = SplitSink<Socket, Message>;
type SocketStream = SplitStream<Socket>;
type Frame = Option<std::result::Result<Message, WsError>>;

/// How often to check whether queued playback has finished
const DRAIN_POLL: Duration = Duration::from_millis(50);

/// Options for a talk session
#[derive(Debug, Clone)]
pub struct TalkOptions {
    pub server_url: String,
    pub user_id: Option<String>,
    pub vad: VadConfig,
    pub auto_listen: bool,
}

impl TalkOptions {
    #[must_use]
    pub fn from_config(config: &Config, user_id: Option<String>) -> Self {
        Self {
            server_url: config.client.server_url.clone(),
            user_id,
            vad: config.vad_config(),
            auto_listen: config.client.auto_listen,
        }
    }

    /// Server URL with the user id attached
    ///
    /// # Errors
    ///
    /// Returns error if the server URL does not parse
    pub fn connect_url(&self) -> Result<String> {
        let mut url = reqwest::Url::parse(&self.server_url)
            .map_err(|e| Error::Config(format!("invalid server URL {}: {e}", self.server_url)))?;
        if let Some(user_id) = &self.user_id {
            url.query_pairs_mut().append_pair("user_id", user_id);
        }
        Ok(url.into())
    }
}

/// Map a received WebSocket frame to a state machine event
///
/// Returns `None` for frames the client does not act on.
fn frame_to_event(frame: Frame) -> Option<ClientEvent> {
    match frame {
        Some(Ok(Message::Text(text))) => Some(match ServerMessage::parse(&text) {
            Ok(message) => ClientEvent::Server(message),
            Err(e) => ClientEvent::Server(ServerMessage::error(format!("invalid server message: {e}"))),
        }),
        Some(Ok(Message::Close(_))) | None => {
            Some(ClientEvent::TransportFailed("closed by server".to_string()))
        }
        Some(Err(e)) => Some(ClientEvent::TransportFailed(e.to_string())),
        Some(Ok(_)) => None,
    }
}

async fn next_frame(stream: &mut Option<SocketStream>) -> Frame {
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

/// Executes state machine actions against the connection and speaker
struct Talk {
    machine: VoiceClient,
    url: String,
    sink: Option<SocketSink>,
    playback: AudioPlayback,
    decoder: Mp3Stream,
    pending: VecDeque<ClientEvent>,
}

#[allow(clippy::future_not_send)]
impl Talk {
    /// Feed an event and everything it causes through the state machine
    async fn dispatch(&mut self, event: ClientEvent, stream: &mut Option<SocketStream>) {
        self.pending.push_back(event);
        while let Some(event) = self.pending.pop_front() {
            for action in self.machine.handle(event) {
                self.perform(action, stream).await;
            }
        }
    }

    async fn perform(&mut self, action: ClientAction, stream: &mut Option<SocketStream>) {
        match action {
            ClientAction::Connect => match tokio_tungstenite::connect_async(self.url.as_str()).await {
                Ok((socket, _)) => {
                    tracing::info!(url = %self.url, "connected to voice server");
                    let (sink, source) = socket.split();
                    self.sink = Some(sink);
                    *stream = Some(source);
                }
                Err(e) => {
                    tracing::warn!(url = %self.url, error = %e, "failed to connect");
                    self.pending
                        .push_back(ClientEvent::TransportFailed(e.to_string()));
                }
            },
            ClientAction::Send(message) => self.send(&message, stream).await,
            ClientAction::PlayAudio(data) => match self.decoder.push(&data) {
                Ok(decoded) => self.playback.enqueue(&decoded),
                Err(e) => tracing::warn!(error = %e, "dropping undecodable audio"),
            },
            ClientAction::StopPlayback => {
                self.playback.stop();
                self.decoder.reset();
            }
            ClientAction::ShowTranscript(text) => {
                print!("\nyou: {text}\nassistant: ");
                let _ = std::io::stdout().flush();
            }
            ClientAction::ShowToken(token) => {
                print!("{token}");
                let _ = std::io::stdout().flush();
            }
            ClientAction::ShowError(error) => {
                eprintln!("\nerror: {error}");
            }
            ClientAction::ModeChanged(mode) => {
                tracing::info!(?mode, "voice mode");
                match mode {
                    VoiceMode::Listening => println!("\n[listening]"),
                    VoiceMode::Error => println!("[press Enter to start again]"),
                    _ => {}
                }
            }
        }
    }

    async fn send(&mut self, message: &ClientMessage, stream: &mut Option<SocketStream>) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode message");
                return;
            }
        };
        if let Err(e) = sink.send(Message::Text(text)).await {
            self.sink = None;
            *stream = None;
            self.pending
                .push_back(ClientEvent::TransportFailed(e.to_string()));
        }
    }

    async fn close(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            let _ = sink.close().await;
        }
    }
}

/// Run a spoken conversation until `shutdown` fires
///
/// # Errors
///
/// Returns error if the audio devices cannot be opened or the URL is invalid
#[allow(clippy::future_not_send)]
pub async fn run(options: TalkOptions, shutdown: CancellationToken) -> Result<()> {
    let url = options.connect_url()?;

    let mut capture = AudioCapture::new()?;
    let (frames_tx, mut frames) = mpsc::channel::<Vec<f32>>(64);
    capture.start(frames_tx)?;
    let mut vad = VoiceActivityDetector::new(options.vad, capture.sample_rate())?;

    let mut talk = Talk {
        machine: VoiceClient::new(options.auto_listen),
        url,
        sink: None,
        playback: AudioPlayback::new(PlaybackQueue::new())?,
        decoder: Mp3Stream::new(),
        pending: VecDeque::new(),
    };
    let mut stream: Option<SocketStream> = None;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut drain_tick = tokio::time::interval(DRAIN_POLL);

    talk.dispatch(ClientEvent::Start, &mut stream).await;

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            Some(frame) = frames.recv() => {
                let edges = vad.process(&frame);
                talk.dispatch(ClientEvent::CapturedAudio(samples_to_pcm16(&frame)), &mut stream)
                    .await;
                for edge in edges {
                    let event = match edge {
                        VadEvent::SpeechStart => ClientEvent::SpeechStarted,
                        VadEvent::SpeechEnd => ClientEvent::SpeechEnded,
                    };
                    talk.dispatch(event, &mut stream).await;
                }
            }
            frame = next_frame(&mut stream) => {
                if let Some(event) = frame_to_event(frame) {
                    if matches!(event, ClientEvent::TransportFailed(_)) {
                        stream = None;
                        talk.sink = None;
                    }
                    talk.dispatch(event, &mut stream).await;
                }
            }
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(_)) => {
                    let event = match talk.machine.mode() {
                        VoiceMode::Idle | VoiceMode::Error => ClientEvent::Start,
                        _ => ClientEvent::Stop,
                    };
                    talk.dispatch(event, &mut stream).await;
                }
                Ok(None) | Err(_) => stdin_open = false,
            },
            _ = drain_tick.tick() => {
                if talk.machine.awaiting_drain() {
                    talk.playback.flush();
                }
                if talk.machine.awaiting_drain() && talk.playback.is_drained() {
                    talk.dispatch(ClientEvent::PlaybackDrained, &mut stream).await;
                }
            }
        }
    }

    talk.dispatch(ClientEvent::Stop, &mut stream).await;
    talk.close().await;
    capture.stop();
    tracing::info!("talk session ended");
    Ok(())
}
